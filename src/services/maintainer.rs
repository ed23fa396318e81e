//! Periodic reconciliation of operation state
//!
//! One tick runs recovery, then rescheduling, then cleanup of finished cascade
//! trees. Ticks never overlap: a tick entered while another is still running
//! returns immediately with [`TickReport::skipped`] set.

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::OperationError;
use crate::models::operation::{Operation, OperationState};
use crate::query::{self, Criterion, OperationField};
use crate::services::cascade_builder::CascadeTreeBuilder;
use crate::services::clock::{to_chrono, Clock};
use crate::services::operation_store;
use crate::services::scheduler::Scheduler;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Another tick was still running
    pub skipped: bool,
    /// Stale reschedulable operations reset to PENDING
    pub recovered: usize,
    /// Stale non-reschedulable operations forced to FAILED
    pub abandoned: usize,
    /// Operations failed after using up their retry budget
    pub exhausted: usize,
    pub expansions_resumed: usize,
    /// Operations handed to the scheduler
    pub dispatched: usize,
    /// PENDING descendants failed because their parent failed
    pub blocked_failed: usize,
    pub trees_deleted: usize,
    pub operations_deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub trees_deleted: usize,
    pub operations_deleted: u64,
}

pub struct Maintainer {
    db: DatabaseConnection,
    scheduler: Arc<Scheduler>,
    builder: Arc<CascadeTreeBuilder>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    tick_guard: tokio::sync::Mutex<()>,
}

impl Maintainer {
    pub fn new(
        db: DatabaseConnection,
        scheduler: Arc<Scheduler>,
        builder: Arc<CascadeTreeBuilder>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            scheduler,
            builder,
            clock,
            config,
            tick_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        self.config.tick_interval
    }

    pub async fn tick(&self) -> Result<TickReport, OperationError> {
        let Ok(_running) = self.tick_guard.try_lock() else {
            tracing::debug!("Previous maintainer tick still running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = TickReport::default();
        self.recover(&mut report).await?;
        self.reschedule(&mut report).await?;

        let cleanup = self.cleanup_finished_cascade_operations().await?;
        report.trees_deleted = cleanup.trees_deleted;
        report.operations_deleted = cleanup.operations_deleted;

        if report != TickReport::default() {
            tracing::info!(
                "Maintainer tick: recovered={} abandoned={} exhausted={} expansions={} dispatched={} blocked_failed={} trees_deleted={}",
                report.recovered,
                report.abandoned,
                report.exhausted,
                report.expansions_resumed,
                report.dispatched,
                report.blocked_failed,
                report.trees_deleted
            );
        }
        Ok(report)
    }

    async fn recover(&self, report: &mut TickReport) -> Result<(), OperationError> {
        let now = self.clock.now();
        let stale_before = now - to_chrono(self.config.stale_threshold);
        let in_progress = operation_store::list(&self.db, &[query::in_state(OperationState::InProgress)]).await?;

        for op in in_progress {
            if op.next_attempt_at.is_some() {
                if self.scheduler.retry_policy().is_exhausted(op.retry_count) {
                    let reason = format!(
                        "retry budget exhausted after {} attempts: {}",
                        op.retry_count,
                        op.last_error.as_deref().unwrap_or("unknown error")
                    );
                    let guard = [
                        query::in_state(OperationState::InProgress),
                        Criterion::NotNil(OperationField::NextAttemptAt),
                    ];
                    if self.fail(op, reason, &guard).await? {
                        report.exhausted += 1;
                    }
                }
                continue;
            }

            // A recorded poll handle means the action was issued; those are
            // re-polled, never re-issued.
            if op.external_id.is_some() || op.updated_at > stale_before {
                continue;
            }

            let guard = [
                query::in_state(OperationState::InProgress),
                Criterion::IsNil(OperationField::ExternalId),
                Criterion::IsNil(OperationField::NextAttemptAt),
            ];
            if op.reschedulable && self.scheduler.retry_policy().is_exhausted(op.retry_count) {
                let reason = format!("reschedule budget exhausted after {} recoveries", op.retry_count);
                if self.fail(op, reason, &guard).await? {
                    report.exhausted += 1;
                }
            } else if op.reschedulable {
                // Recoveries share the retry budget so a stuck operation
                // eventually fails instead of cycling.
                let mut reset = op;
                reset.advance(OperationState::Pending)?;
                reset.retry_count = reset.retry_count.saturating_add(1);
                reset.last_error = Some("recovered after stale heartbeat".to_string());
                reset.updated_at = now;
                if operation_store::transition(&self.db, &reset, &guard).await? {
                    tracing::warn!(
                        operation_id = %reset.id,
                        "Recovered stale operation back to PENDING (recovery #{})",
                        reset.retry_count
                    );
                    report.recovered += 1;
                }
            } else {
                let reason = "abandoned after restart: action outcome unknown".to_string();
                if self.fail(op, reason, &guard).await? {
                    report.abandoned += 1;
                }
            }
        }

        self.resume_expansions(report).await
    }

    /// Finish cascade trees whose expansion was interrupted
    async fn resume_expansions(&self, report: &mut TickReport) -> Result<(), OperationError> {
        let unfinished_roots = operation_store::list(
            &self.db,
            &[
                query::by_field(OperationField::Ready, false),
                Criterion::IsNil(OperationField::ParentId),
                Criterion::NotNil(OperationField::CascadeRootId),
            ],
        )
        .await?;

        for root in unfinished_roots.into_iter().filter(Operation::is_cascade_root) {
            match self.builder.expand(&root.id).await {
                Ok(expansion) if !expansion.skipped => report.expansions_resumed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(operation_id = %root.id, "Cascade expansion deferred: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn reschedule(&self, report: &mut TickReport) -> Result<(), OperationError> {
        report.blocked_failed += self.fail_orphaned_descendants().await?;

        let now = self.clock.now();
        let candidates = operation_store::list(
            &self.db,
            &[
                query::non_terminal(),
                query::by_field(OperationField::Ready, true),
            ],
        )
        .await?;
        let parent_states = self.parent_states(&candidates).await?;

        let due: Vec<String> = candidates
            .into_iter()
            .filter(|op| match op.state {
                OperationState::Pending => match op.parent_id.as_deref() {
                    None => true,
                    Some(parent_id) => parent_states.get(parent_id) == Some(&OperationState::Succeeded),
                },
                OperationState::InProgress => match op.next_attempt_at {
                    Some(at) => at <= now && !self.scheduler.retry_policy().is_exhausted(op.retry_count),
                    None => op.external_id.is_some(),
                },
                _ => false,
            })
            .map(|op| op.id)
            .collect();

        if due.is_empty() {
            return Ok(());
        }
        report.dispatched += due.len();
        self.scheduler.dispatch(due).await;
        Ok(())
    }

    /// PENDING operations under a FAILED parent can never start. Fail them,
    /// level by level, so their tree reaches a terminal state.
    async fn fail_orphaned_descendants(&self) -> Result<usize, OperationError> {
        let mut failed = 0;
        loop {
            let pending = operation_store::list(
                &self.db,
                &[
                    query::in_state(OperationState::Pending),
                    Criterion::NotNil(OperationField::ParentId),
                ],
            )
            .await?;
            let parent_states = self.parent_states(&pending).await?;

            let mut changed = 0;
            for op in pending {
                let Some(parent_id) = op.parent_id.clone() else {
                    continue;
                };
                if parent_states.get(&parent_id) != Some(&OperationState::Failed) {
                    continue;
                }
                let reason = format!("parent operation {} failed", parent_id);
                if self.fail(op, reason, &[query::in_state(OperationState::Pending)]).await? {
                    changed += 1;
                }
            }

            if changed == 0 {
                return Ok(failed);
            }
            failed += changed;
        }
    }

    async fn parent_states(&self, ops: &[Operation]) -> Result<HashMap<String, OperationState>, OperationError> {
        let parent_ids: Vec<String> = ops.iter().filter_map(|op| op.parent_id.clone()).collect();
        if parent_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let parents = operation_store::list(&self.db, &[query::in_values(OperationField::Id, parent_ids)]).await?;
        Ok(parents.into_iter().map(|p| (p.id, p.state)).collect())
    }

    async fn fail(&self, op: Operation, reason: String, guard: &[Criterion]) -> Result<bool, OperationError> {
        let mut failed = op;
        failed.advance(OperationState::Failed)?;
        failed.next_attempt_at = None;
        failed.updated_at = self.clock.now();
        tracing::warn!(operation_id = %failed.id, "Forcing operation to FAILED: {}", reason);
        failed.last_error = Some(reason);
        operation_store::transition(&self.db, &failed, guard).await
    }

    /// Delete every finished cascade tree that was scheduled for pruning
    ///
    /// A tree is finished when all of its members are terminal and ready. Each
    /// tree is checked and deleted in its own transaction; trees with any
    /// unfinished member are left untouched. Standalone operations are never
    /// considered.
    pub async fn cleanup_finished_cascade_operations(&self) -> Result<CleanupReport, OperationError> {
        let roots = operation_store::list(
            &self.db,
            &[
                Criterion::IsNil(OperationField::ParentId),
                Criterion::NotNil(OperationField::CascadeRootId),
                Criterion::NotNil(OperationField::DeletionScheduled),
            ],
        )
        .await?;

        let mut report = CleanupReport::default();
        for root in roots.into_iter().filter(Operation::is_cascade_root) {
            let txn = self.db.begin().await?;

            let tree = query::same_tree(&root.id);
            let unfinished = operation_store::count(&txn, &[tree.clone(), query::non_terminal()]).await?
                + operation_store::count(&txn, &[tree.clone(), query::by_field(OperationField::Ready, false)]).await?;
            if unfinished > 0 {
                continue;
            }

            let deleted = operation_store::delete(&txn, &[tree]).await?;
            txn.commit().await?;

            // Zero rows means another cleanup pruned the tree first
            if deleted == 0 {
                continue;
            }
            tracing::info!(operation_id = %root.id, "Pruned finished cascade tree ({} operations)", deleted);
            report.trees_deleted += 1;
            report.operations_deleted += deleted;
        }
        Ok(report)
    }
}
