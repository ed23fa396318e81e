//! Executes single operations
//!
//! `execute` never blocks on a long-running action: an asynchronous result is
//! stored as a poll handle and the worker is released. Every state write is a
//! compare-and-set against the state the scheduler read, so concurrent
//! schedulers cannot both start or both finish the same operation.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{ActionError, OperationError};
use crate::models::operation::{Operation, OperationState};
use crate::query::{self, Criterion, OperationField};
use crate::services::clock::{to_chrono, Clock};
use crate::services::operation_store;
use crate::services::resource_actions::{ActionOutcome, ActionRequest, ResourceAction};
use crate::services::retry::RetryPolicy;

/// The action call made by one execution
enum Attempt {
    Invoke,
    Poll(String),
}

pub struct Scheduler {
    db: DatabaseConnection,
    actions: Arc<dyn ResourceAction>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        db: DatabaseConnection,
        actions: Arc<dyn ResourceAction>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        worker_pool_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            actions,
            clock,
            retry,
            workers: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            shutdown,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Advance one operation as far as it can go without waiting
    ///
    /// Returns the state the operation is left in. Operations that are not
    /// ready, whose parent has not succeeded, or whose retry is not yet due
    /// are left untouched.
    pub async fn execute(&self, operation_id: &str) -> Result<OperationState, OperationError> {
        let op = operation_store::get(&self.db, operation_id).await?;
        if op.is_terminal() {
            return Ok(op.state);
        }
        if !op.ready {
            tracing::debug!(operation_id = %op.id, "Operation not ready, leaving it");
            return Ok(op.state);
        }
        if !self.parent_succeeded(&op).await? {
            tracing::debug!(operation_id = %op.id, "Parent not succeeded yet, leaving operation blocked");
            return Ok(op.state);
        }

        let now = self.clock.now();
        if op.next_attempt_at.is_some_and(|at| at > now) {
            return Ok(op.state);
        }
        if op.next_attempt_at.is_some() && self.retry.is_exhausted(op.retry_count) {
            // The maintainer fails exhausted operations
            return Ok(op.state);
        }

        match (op.state, op.external_id.clone()) {
            (OperationState::Pending, _) => self.start(op).await,
            (OperationState::InProgress, Some(handle)) => self.attempt(op, Attempt::Poll(handle)).await,
            (OperationState::InProgress, None) if op.next_attempt_at.is_some() => self.retry_invoke(op).await,
            // Action in flight elsewhere, or outcome unknown after a crash
            _ => Ok(op.state),
        }
    }

    async fn parent_succeeded(&self, op: &Operation) -> Result<bool, OperationError> {
        let Some(parent_id) = op.parent_id.as_deref() else {
            return Ok(true);
        };
        Ok(operation_store::find(&self.db, parent_id)
            .await?
            .is_some_and(|parent| parent.state == OperationState::Succeeded))
    }

    async fn start(&self, op: Operation) -> Result<OperationState, OperationError> {
        let mut started = op;
        started.advance(OperationState::InProgress)?;
        started.external_id = None;
        started.next_attempt_at = None;
        started.updated_at = self.clock.now();

        if !operation_store::transition(&self.db, &started, &[query::in_state(OperationState::Pending)]).await? {
            tracing::debug!(operation_id = %started.id, "Lost the race to start operation");
            return self.current_state(&started.id).await;
        }

        tracing::info!(
            operation_id = %started.id,
            resource_id = %started.resource_id,
            "Started {} of {}",
            started.operation_type,
            started.resource_type
        );
        self.attempt(started, Attempt::Invoke).await
    }

    /// Claim a due transient retry and re-issue the action
    async fn retry_invoke(&self, op: Operation) -> Result<OperationState, OperationError> {
        let mut claimed = op;
        claimed.next_attempt_at = None;
        claimed.updated_at = self.clock.now();

        let guard = [
            query::in_state(OperationState::InProgress),
            Criterion::NotNil(OperationField::NextAttemptAt),
            Criterion::IsNil(OperationField::ExternalId),
        ];
        if !operation_store::transition(&self.db, &claimed, &guard).await? {
            return self.current_state(&claimed.id).await;
        }

        tracing::info!(
            operation_id = %claimed.id,
            "Retrying {} of {} (attempt {})",
            claimed.operation_type,
            claimed.resource_type,
            claimed.retry_count + 1
        );
        self.attempt(claimed, Attempt::Invoke).await
    }

    async fn attempt(&self, op: Operation, attempt: Attempt) -> Result<OperationState, OperationError> {
        let request = ActionRequest::from(&op);
        let polling = matches!(attempt, Attempt::Poll(_));

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!(operation_id = %op.id, "Action attempt cancelled");
                return Ok(op.state);
            }
            result = async {
                match &attempt {
                    Attempt::Invoke => self.actions.invoke(&request).await,
                    Attempt::Poll(handle) => self.actions.poll(&request, handle).await,
                }
            } => result,
        };

        self.record(op, result, polling).await
    }

    /// Persist the result of one action attempt in a single write
    async fn record(
        &self,
        op: Operation,
        result: Result<ActionOutcome, ActionError>,
        polling: bool,
    ) -> Result<OperationState, OperationError> {
        let now = self.clock.now();
        let mut next = op.clone();
        next.updated_at = now;

        match result {
            Ok(ActionOutcome::Succeeded) => {
                next.advance(OperationState::Succeeded)?;
                next.next_attempt_at = None;
                next.last_error = None;
            }
            Ok(ActionOutcome::Failed { reason }) => {
                next.advance(OperationState::Failed)?;
                next.next_attempt_at = None;
                next.last_error = Some(reason);
            }
            Ok(ActionOutcome::StillRunning { handle }) => {
                next.external_id = Some(handle);
                next.next_attempt_at = None;
            }
            Err(ActionError::Permanent(reason)) => {
                next.advance(OperationState::Failed)?;
                next.next_attempt_at = None;
                next.last_error = Some(reason);
            }
            Err(ActionError::Transient(reason)) => {
                let attempt = u32::try_from(op.retry_count).unwrap_or(0);
                let delay = self.retry.delay_for_attempt(attempt);
                next.retry_count = op.retry_count.saturating_add(1);
                next.next_attempt_at = Some(now + to_chrono(delay));
                next.last_error = Some(reason);
                if !polling {
                    next.external_id = None;
                }
                tracing::warn!(
                    operation_id = %op.id,
                    "Transient failure #{}, next attempt in {:?}: {}",
                    next.retry_count,
                    delay,
                    next.last_error.as_deref().unwrap_or_default()
                );
            }
        }

        if !operation_store::transition(&self.db, &next, &[query::in_state(OperationState::InProgress)]).await? {
            tracing::warn!(operation_id = %op.id, "Operation changed while its action ran, result dropped");
            return self.current_state(&op.id).await;
        }

        match next.state {
            OperationState::Succeeded => {
                tracing::info!(operation_id = %next.id, "{} of {} {} succeeded", next.operation_type, next.resource_type, next.resource_id);
            }
            OperationState::Failed => {
                tracing::error!(
                    operation_id = %next.id,
                    "{} of {} {} failed: {}",
                    next.operation_type,
                    next.resource_type,
                    next.resource_id,
                    next.last_error.as_deref().unwrap_or_default()
                );
            }
            _ => {}
        }
        Ok(next.state)
    }

    async fn current_state(&self, operation_id: &str) -> Result<OperationState, OperationError> {
        Ok(operation_store::get(&self.db, operation_id).await?.state)
    }

    /// Execute many operations concurrently, bounded by the worker pool
    pub async fn dispatch(
        self: &Arc<Self>,
        operation_ids: Vec<String>,
    ) -> Vec<(String, Result<OperationState, OperationError>)> {
        let mut tasks = JoinSet::new();

        for operation_id in operation_ids {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            let scheduler = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let result = scheduler.execute(&operation_id).await;
                (operation_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((operation_id, result)) => {
                    if let Err(e) = &result {
                        tracing::error!(operation_id = %operation_id, "Execution failed: {}", e);
                    }
                    results.push((operation_id, result));
                }
                Err(e) => tracing::error!("Scheduler task panicked: {}", e),
            }
        }
        results
    }
}
