//! Cascade delete tree construction
//!
//! A cascade starts as a single not-ready root. Expansion then walks the
//! resource-type dependency graph breadth-first, one storage transaction per
//! tier. The frontier of a tier is every not-ready node without children:
//! each gets a child operation per dependent resource, and frontier nodes with
//! no dependents become ready leaves. Once a tier yields nothing new, one final
//! write flips the remaining inner nodes to ready. A crash between tiers
//! leaves whole tiers only, and expansion resumes from the stored frontier.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;

use crate::error::OperationError;
use crate::models::operation::Operation;
use crate::models::request_scope::RequestScope;
use crate::models::resource_type::ResourceType;
use crate::query::{self, OperationField};
use crate::services::clock::Clock;
use crate::services::{operation_store, resource_store};

/// Outcome of one expansion run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpansionReport {
    pub root_id: String,
    /// Another task was already expanding this root
    pub skipped: bool,
    /// Tier transactions committed during this run
    pub tiers: usize,
    /// Child operations created during this run
    pub created: usize,
    /// The whole tree is materialized and ready
    pub completed: bool,
}

struct TierResult {
    created: usize,
    leaves: usize,
}

/// Registration of a root in the in-process set of running expansions
struct ExpansionGuard<'a> {
    expanding: &'a Mutex<HashSet<String>>,
    root_id: String,
}

impl<'a> ExpansionGuard<'a> {
    fn acquire(expanding: &'a Mutex<HashSet<String>>, root_id: &str) -> Option<Self> {
        if !expanding.lock().insert(root_id.to_string()) {
            return None;
        }
        Some(Self {
            expanding,
            root_id: root_id.to_string(),
        })
    }
}

impl Drop for ExpansionGuard<'_> {
    fn drop(&mut self) {
        self.expanding.lock().remove(&self.root_id);
    }
}

pub struct CascadeTreeBuilder {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    expanding: Mutex<HashSet<String>>,
}

impl CascadeTreeBuilder {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            expanding: Mutex::new(HashSet::new()),
        }
    }

    /// Create the not-ready root of a cascade delete
    ///
    /// Fails with `NotFound` for unknown or already deleted resources and with
    /// `Conflict` when the resource has a non-terminal operation.
    pub async fn create_root(
        &self,
        scope: &RequestScope,
        resource_type: ResourceType,
        resource_id: &str,
        prune_when_finished: bool,
    ) -> Result<Operation, OperationError> {
        let now = self.clock.now();
        let txn = self.db.begin().await?;

        let resource = resource_store::get_resource(&txn, resource_id)
            .await?
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| OperationError::NotFound(format!("{} {}", resource_type, resource_id)))?;
        if resource.resource_type != resource_type {
            return Err(OperationError::Validation(format!(
                "resource {} is a {}, not a {}",
                resource_id, resource.resource_type, resource_type
            )));
        }

        let mut root = Operation::cascade_root(resource_type, resource_id, now);
        root.correlation_id = Some(scope.correlation_id.clone()).filter(|c| !c.is_empty());
        root.deletion_scheduled = prune_when_finished.then_some(now);

        operation_store::create(&txn, &root).await?;
        txn.commit().await?;

        tracing::info!(
            operation_id = %root.id,
            correlation_id = %scope.correlation_id,
            user = %scope.user_name(),
            "Cascade delete accepted for {} {}",
            resource_type,
            resource_id
        );
        Ok(root)
    }

    /// Materialize the tree under `root_id`, resuming from whatever tiers are
    /// already stored. Safe to call repeatedly.
    pub async fn expand(&self, root_id: &str) -> Result<ExpansionReport, OperationError> {
        let Some(_guard) = ExpansionGuard::acquire(&self.expanding, root_id) else {
            tracing::debug!(operation_id = %root_id, "Expansion already running, skipping");
            return Ok(ExpansionReport {
                root_id: root_id.to_string(),
                skipped: true,
                ..Default::default()
            });
        };

        let root = operation_store::get(&self.db, root_id).await?;
        if !root.is_cascade_root() {
            return Err(OperationError::Validation(format!(
                "operation {} is not a cascade root",
                root_id
            )));
        }

        let mut report = ExpansionReport {
            root_id: root_id.to_string(),
            ..Default::default()
        };
        if root.ready {
            report.completed = true;
            return Ok(report);
        }

        while let Some(tier) = self.expand_tier(root_id).await? {
            report.tiers += 1;
            report.created += tier.created;
            tracing::debug!(
                operation_id = %root_id,
                "Tier {} committed: {} children, {} leaves",
                report.tiers,
                tier.created,
                tier.leaves
            );
        }

        let flipped = operation_store::mark_tree_ready(&self.db, root_id, self.clock.now()).await?;
        report.completed = true;

        tracing::info!(
            operation_id = %root_id,
            "Cascade tree ready: {} operations created in {} tiers, {} inner nodes released",
            report.created,
            report.tiers,
            flipped
        );
        Ok(report)
    }

    /// Expand the current frontier in one transaction. `None` once there is
    /// no frontier left.
    async fn expand_tier(&self, root_id: &str) -> Result<Option<TierResult>, OperationError> {
        let txn = self.db.begin().await?;

        let members = operation_store::list(&txn, &[query::same_tree(root_id)]).await?;
        let with_children: HashSet<String> = members
            .iter()
            .filter_map(|m| m.parent_id.clone())
            .collect();
        let mut seen: HashSet<String> = members.iter().map(|m| m.resource_id.clone()).collect();

        let frontier: Vec<&Operation> = members
            .iter()
            .filter(|m| !m.ready && !with_children.contains(&m.id))
            .collect();
        if frontier.is_empty() {
            return Ok(None);
        }

        let now = self.clock.now();
        let mut result = TierResult {
            created: 0,
            leaves: 0,
        };

        for node in frontier {
            let dependents = match resource_store::get_resource(&txn, &node.resource_id).await? {
                Some(resource) => resource_store::dependents_of(&txn, &resource).await?,
                None => Vec::new(),
            };

            let mut added = 0;
            for dependent in dependents {
                if !seen.insert(dependent.id.clone()) {
                    tracing::warn!(
                        operation_id = %root_id,
                        "Resource {} reached twice during expansion, skipping",
                        dependent.id
                    );
                    continue;
                }
                let child = Operation::cascade_child(node, dependent.resource_type, &dependent.id, now);
                operation_store::create(&txn, &child).await?;
                added += 1;
            }

            if added == 0 {
                let mut leaf = node.clone();
                leaf.ready = true;
                leaf.updated_at = now;
                operation_store::transition(&txn, &leaf, &[query::by_field(OperationField::Ready, false)])
                    .await?;
                result.leaves += 1;
            }
            result.created += added;
        }

        txn.commit().await?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_guard_is_exclusive_per_root() {
        let expanding = Mutex::new(HashSet::new());

        let first = ExpansionGuard::acquire(&expanding, "root-1");
        assert!(first.is_some());
        assert!(ExpansionGuard::acquire(&expanding, "root-1").is_none());
        assert!(ExpansionGuard::acquire(&expanding, "root-2").is_some());

        drop(first);
        assert!(ExpansionGuard::acquire(&expanding, "root-1").is_some());
    }
}
