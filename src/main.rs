use std::env;
use std::sync::Arc;

use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use service_manager_backend::config::EngineConfig;
use service_manager_backend::handlers;
use service_manager_backend::jobs::maintainer_job::start_maintainer_job;
use service_manager_backend::services::broker_client::BrokerClient;
use service_manager_backend::services::clock::{Clock, SystemClock};
use service_manager_backend::services::engine::OperationEngine;
use service_manager_backend::services::resource_actions::ResourceActionRouter;
use service_manager_backend::AppState;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,service_manager_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Connect to database
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    tracing::info!("Connecting to database...");
    let db = Database::connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = BrokerClient::new(config.broker_timeout).expect("Failed to build broker HTTP client");
    let actions = Arc::new(ResourceActionRouter::new(db.clone(), broker, Arc::clone(&clock)));

    let engine = Arc::new(OperationEngine::new(
        db.clone(),
        actions,
        clock,
        config.clone(),
        shutdown.clone(),
    ));
    let maintainer = Arc::new(engine.maintainer());

    // Start background maintainer
    let maintainer_handle = start_maintainer_job(Arc::clone(&maintainer), shutdown.clone());

    let state = AppState {
        db,
        engine: Arc::clone(&engine),
        maintainer,
    };

    let app = handlers::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");

    tracing::info!("Server listening on {}", bind_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    if let Err(e) = maintainer_handle.await {
        tracing::error!("Maintainer task ended abnormally: {}", e);
    }
    engine.wait_for_background().await;
    tracing::info!("Shutdown complete");
}
