mod common;

use common::{seed, seed_tenant_tree, test_config, test_start, Harness};
use service_manager_backend::config::EngineConfig;
use service_manager_backend::models::operation::{Operation, OperationState, OperationType};
use service_manager_backend::models::request_scope::RequestScope;
use service_manager_backend::models::resource::Resource;
use service_manager_backend::models::resource_type::ResourceType;
use service_manager_backend::query::{self, Criterion, OperationField};
use service_manager_backend::services::maintainer::CleanupReport;
use service_manager_backend::services::operation_store;

async fn trigger(h: &Harness, tenant: &str) -> String {
    h.engine
        .trigger_cascade(&RequestScope::new(), ResourceType::Tenant, tenant)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_finished_tree_is_deleted() {
    let h = Harness::new().await;
    let tree = seed_tenant_tree(&h.db, "t1").await;

    let root_id = trigger(&h, &tree.tenant).await;
    h.drive(10).await;

    let states = h.states(&root_id).await;
    assert_eq!(states.len(), 11);
    assert!(states.iter().all(|s| *s == OperationState::Succeeded));
    assert!(h.actions.violations().is_empty(), "{:?}", h.actions.violations());

    let report = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(
        report,
        CleanupReport {
            trees_deleted: 1,
            operations_deleted: 11
        }
    );
    assert_eq!(h.tree_count(&root_id).await, 0);
}

#[tokio::test]
async fn test_concurrent_cleanups_count_each_tree_once() {
    let h = Harness::new().await;
    let tree = seed_tenant_tree(&h.db, "t1").await;

    let root_id = trigger(&h, &tree.tenant).await;
    h.drive(10).await;

    let (first, second) = tokio::join!(
        h.maintainer.cleanup_finished_cascade_operations(),
        h.maintainer.cleanup_finished_cascade_operations()
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.trees_deleted + second.trees_deleted, 1);
    assert_eq!(first.operations_deleted + second.operations_deleted, 11);
    assert_eq!(h.tree_count(&root_id).await, 0);
}

#[tokio::test]
async fn test_multiple_finished_trees_are_deleted_at_once() {
    let h = Harness::new().await;
    let a = seed_tenant_tree(&h.db, "a").await;
    let b = seed_tenant_tree(&h.db, "b").await;
    let c = seed_tenant_tree(&h.db, "c").await;

    let (ra, rb, rc) = tokio::join!(trigger(&h, &a.tenant), trigger(&h, &b.tenant), trigger(&h, &c.tenant));
    let roots = [ra, rb, rc];
    h.drive(10).await;

    let roots_of = |root_id: &str| {
        vec![
            query::same_tree(root_id),
            Criterion::EqualsOrNil(OperationField::ParentId, "".into()),
        ]
    };
    for root_id in &roots {
        let count = operation_store::count(&h.db, &roots_of(root_id)).await.unwrap();
        assert_eq!(count, 1);
    }

    let report = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(report.trees_deleted, 3);
    assert_eq!(report.operations_deleted, 33);

    let remaining = operation_store::count(
        &h.db,
        &[query::in_values(OperationField::CascadeRootId, roots.to_vec())],
    )
    .await
    .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_tree_with_running_child_is_kept() {
    let h = Harness::new().await;
    let tree = seed_tenant_tree(&h.db, "t1").await;
    h.actions.keep_running(&tree.bindings[0]);

    let root_id = trigger(&h, &tree.tenant).await;
    h.drive(10).await;

    let binding = h
        .engine
        .list_for_resource(&tree.bindings[0], Some(OperationState::InProgress))
        .await
        .unwrap();
    assert_eq!(binding.len(), 1);
    assert!(binding[0].external_id.is_some());

    let report = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(report, CleanupReport::default());
    assert_eq!(h.tree_count(&root_id).await, 11);

    h.actions.finish(&tree.bindings[0]);
    h.drive(10).await;
    assert_eq!(h.op(&binding[0].id).await.state, OperationState::Succeeded);

    h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(h.tree_count(&root_id).await, 0);
}

#[tokio::test]
async fn test_standalone_operations_are_never_cleaned_up() {
    let h = Harness::new().await;
    seed(&h.db, Resource::new(ResourceType::ServiceInstance, "osb-1", "osb-1", test_start())).await;
    seed(&h.db, Resource::new(ResourceType::ServiceInstance, "osb-2", "osb-2", test_start())).await;

    let mut running = Operation::new(ResourceType::ServiceInstance, "osb-1", OperationType::Delete, test_start());
    running.state = OperationState::InProgress;
    running.description = Some("bla".to_string());
    operation_store::create(&h.db, &running).await.unwrap();

    let mut finished = Operation::new(ResourceType::ServiceInstance, "osb-2", OperationType::Delete, test_start());
    finished.state = OperationState::Succeeded;
    operation_store::create(&h.db, &finished).await.unwrap();

    let report = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(report, CleanupReport::default());

    let count = operation_store::count(
        &h.db,
        &[
            query::in_values(OperationField::ResourceId, ["osb-1"]),
            Criterion::EqualsOrNil(OperationField::CascadeRootId, "".into()),
            query::in_state(OperationState::InProgress),
        ],
    )
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(operation_store::count(&h.db, &[]).await.unwrap(), 2);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let h = Harness::new().await;
    let tree = seed_tenant_tree(&h.db, "t1").await;
    let other = seed_tenant_tree(&h.db, "t2").await;
    h.actions.keep_running(&other.instances[3]);

    trigger(&h, &tree.tenant).await;
    trigger(&h, &other.tenant).await;
    h.drive(10).await;

    let first = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(first.trees_deleted, 1);
    let after_first = operation_store::count(&h.db, &[]).await.unwrap();

    let second = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(second, CleanupReport::default());
    assert_eq!(operation_store::count(&h.db, &[]).await.unwrap(), after_first);
    assert_eq!(after_first, 11);
}

#[tokio::test]
async fn test_terminal_tree_with_unready_node_is_kept() {
    let h = Harness::new().await;
    let tree = seed_tenant_tree(&h.db, "t1").await;
    let root = h
        .engine
        .builder()
        .create_root(&RequestScope::new(), ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();

    let mut terminal = root.clone();
    terminal.state = OperationState::Failed;
    operation_store::update(&h.db, &terminal).await.unwrap();
    assert!(!h.op(&root.id).await.ready);

    let report = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(report, CleanupReport::default());
    assert_eq!(h.tree_count(&root.id).await, 1);
}

#[tokio::test]
async fn test_trees_are_kept_when_pruning_is_disabled() {
    let h = Harness::with_config(EngineConfig {
        prune_finished_cascades: false,
        ..test_config()
    })
    .await;
    let tree = seed_tenant_tree(&h.db, "t1").await;

    let root_id = trigger(&h, &tree.tenant).await;
    h.drive(10).await;
    assert!(h.states(&root_id).await.iter().all(|s| *s == OperationState::Succeeded));
    assert!(h.op(&root_id).await.deletion_scheduled.is_none());

    let report = h.maintainer.cleanup_finished_cascade_operations().await.unwrap();
    assert_eq!(report.trees_deleted, 0);
    assert_eq!(h.tree_count(&root_id).await, 11);
}
