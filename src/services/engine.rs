//! Entry point for callers of the operation engine
//!
//! Accepting work is synchronous: the root or standalone operation is
//! persisted before the call returns. Expansion and execution continue on
//! tracked background tasks; the outcome is only observable by reading
//! operation state.

use std::sync::Arc;

use sea_orm::{DatabaseConnection, TransactionTrait};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::error::OperationError;
use crate::models::operation::{Operation, OperationState, OperationType};
use crate::models::request_scope::RequestScope;
use crate::models::resource_type::ResourceType;
use crate::query::{self, Criterion};
use crate::services::cascade_builder::CascadeTreeBuilder;
use crate::services::clock::Clock;
use crate::services::maintainer::Maintainer;
use crate::services::resource_actions::ResourceAction;
use crate::services::scheduler::Scheduler;
use crate::services::{operation_store, resource_store};

pub struct OperationEngine {
    db: DatabaseConnection,
    builder: Arc<CascadeTreeBuilder>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    background: TaskTracker,
}

impl OperationEngine {
    pub fn new(
        db: DatabaseConnection,
        actions: Arc<dyn ResourceAction>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let builder = Arc::new(CascadeTreeBuilder::new(db.clone(), Arc::clone(&clock)));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            actions,
            Arc::clone(&clock),
            config.retry,
            config.worker_pool_size,
            shutdown,
        ));

        Self {
            db,
            builder,
            scheduler,
            clock,
            config,
            background: TaskTracker::new(),
        }
    }

    /// Maintainer sharing this engine's scheduler and builder
    pub fn maintainer(&self) -> Maintainer {
        Maintainer::new(
            self.db.clone(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.builder),
            Arc::clone(&self.clock),
            self.config.clone(),
        )
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn builder(&self) -> Arc<CascadeTreeBuilder> {
        Arc::clone(&self.builder)
    }

    /// Accept a cascade delete of a resource and everything depending on it
    ///
    /// Returns the root operation id once the root is stored. The tree is
    /// expanded and its root started in the background.
    pub async fn trigger_cascade(
        &self,
        scope: &RequestScope,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<String, OperationError> {
        let root = self
            .builder
            .create_root(scope, resource_type, resource_id, self.config.prune_finished_cascades)
            .await?;

        let builder = Arc::clone(&self.builder);
        let scheduler = Arc::clone(&self.scheduler);
        let root_id = root.id.clone();
        self.background.spawn(async move {
            match builder.expand(&root_id).await {
                Ok(report) if report.completed => {
                    if let Err(e) = scheduler.execute(&root_id).await {
                        tracing::error!(operation_id = %root_id, "Failed to start cascade root: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(operation_id = %root_id, "Cascade expansion deferred to maintainer: {}", e);
                }
            }
        });

        Ok(root.id)
    }

    /// Accept a standalone operation outside any cascade tree
    pub async fn submit(
        &self,
        scope: &RequestScope,
        resource_type: ResourceType,
        resource_id: &str,
        operation_type: OperationType,
    ) -> Result<String, OperationError> {
        let txn = self.db.begin().await?;

        let resource = resource_store::get_resource(&txn, resource_id)
            .await?
            .filter(|r| !r.is_deleted() && r.resource_type == resource_type)
            .ok_or_else(|| OperationError::NotFound(format!("{} {}", resource_type, resource_id)))?;

        let mut op = Operation::new(resource.resource_type, &resource.id, operation_type, self.clock.now());
        op.correlation_id = Some(scope.correlation_id.clone()).filter(|c| !c.is_empty());
        operation_store::create(&txn, &op).await?;
        txn.commit().await?;

        tracing::info!(
            operation_id = %op.id,
            correlation_id = %scope.correlation_id,
            user = %scope.user_name(),
            "Accepted {} of {} {}",
            operation_type,
            resource_type,
            resource_id
        );

        let scheduler = Arc::clone(&self.scheduler);
        let operation_id = op.id.clone();
        self.background.spawn(async move {
            if let Err(e) = scheduler.execute(&operation_id).await {
                tracing::error!(operation_id = %operation_id, "Failed to start operation: {}", e);
            }
        });

        Ok(op.id)
    }

    pub async fn get_operation(&self, operation_id: &str) -> Result<Operation, OperationError> {
        operation_store::get(&self.db, operation_id).await
    }

    /// Every operation of one cascade tree
    pub async fn list_tree(&self, root_id: &str) -> Result<Vec<Operation>, OperationError> {
        operation_store::list(&self.db, &[query::same_tree(root_id)]).await
    }

    pub async fn list_for_resource(
        &self,
        resource_id: &str,
        state: Option<OperationState>,
    ) -> Result<Vec<Operation>, OperationError> {
        let mut criteria = vec![query::for_resource(resource_id)];
        criteria.extend(state.map(query::in_state));
        operation_store::list(&self.db, &criteria).await
    }

    /// Operations matching `criteria` narrowed by the scope's own criteria
    pub async fn list(&self, scope: &RequestScope, criteria: &[Criterion]) -> Result<Vec<Operation>, OperationError> {
        let mut all = criteria.to_vec();
        all.extend(scope.criteria.iter().cloned());
        operation_store::list(&self.db, &all).await
    }

    /// Wait until every background task spawned so far has finished
    pub async fn wait_for_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}
