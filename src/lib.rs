// src/lib.rs

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use services::{engine::OperationEngine, maintainer::Maintainer};

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub engine: Arc<OperationEngine>,
    pub maintainer: Arc<Maintainer>,
}

pub mod entities {
    pub mod prelude;
    pub mod operations;
    pub mod resources;
}

pub mod services {
    pub mod clock;
    pub mod retry;
    pub mod operation_store;
    pub mod resource_store;
    pub mod cascade_builder;
    pub mod broker_client;
    pub mod resource_actions;
    pub mod scheduler;
    pub mod maintainer;
    pub mod engine;
}

pub mod jobs {
    pub mod maintainer_job;
}

pub mod config;
pub mod error;
pub mod query;
pub mod models;
pub mod handlers;
