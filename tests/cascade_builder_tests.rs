mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{seed, seed_tenant_tree, setup_test_db, test_start};
use service_manager_backend::error::OperationError;
use service_manager_backend::models::operation::{Operation, OperationState, OperationType};
use service_manager_backend::models::request_scope::RequestScope;
use service_manager_backend::models::resource::Resource;
use service_manager_backend::models::resource_type::ResourceType;
use service_manager_backend::query;
use service_manager_backend::services::cascade_builder::CascadeTreeBuilder;
use service_manager_backend::services::clock::{Clock, ManualClock};
use service_manager_backend::services::{operation_store, resource_store};

fn builder(db: &sea_orm::DatabaseConnection) -> CascadeTreeBuilder {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(test_start()));
    CascadeTreeBuilder::new(db.clone(), clock)
}

#[tokio::test]
async fn test_tenant_tree_mirrors_resource_ownership() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    let builder = builder(&db);

    let root = builder
        .create_root(&RequestScope::with_correlation_id("corr-1"), ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();
    assert!(!root.ready);

    let report = builder.expand(&root.id).await.unwrap();
    assert!(report.completed);
    assert!(!report.skipped);
    assert_eq!(report.created, tree.descendants());
    assert_eq!(report.tiers, 4);

    let ops = operation_store::list(&db, &[query::same_tree(&root.id)]).await.unwrap();
    assert_eq!(ops.len(), 11);

    let by_id: HashMap<&str, &Operation> = ops.iter().map(|op| (op.id.as_str(), op)).collect();
    for op in &ops {
        assert!(op.ready, "{} should be ready", op.resource_id);
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.operation_type, OperationType::Delete);
        assert_eq!(op.cascade_root_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(op.correlation_id.as_deref(), Some("corr-1"));
        assert!(op.deletion_scheduled.is_some());

        let resource = resource_store::get_resource(&db, &op.resource_id).await.unwrap().unwrap();
        match &op.parent_id {
            None => assert_eq!(op.id, root.id),
            Some(parent_id) => {
                let parent = by_id[parent_id.as_str()];
                assert_eq!(resource.owner_id.as_deref(), Some(parent.resource_id.as_str()));
            }
        }
    }
}

#[tokio::test]
async fn test_resource_without_dependents_yields_single_node() {
    let db = setup_test_db().await;
    seed(&db, Resource::new(ResourceType::Platform, "lonely", "lonely", test_start())).await;
    let builder = builder(&db);

    let root = builder
        .create_root(&RequestScope::new(), ResourceType::Platform, "lonely", true)
        .await
        .unwrap();
    let report = builder.expand(&root.id).await.unwrap();

    assert_eq!(report.created, 0);
    let ops = operation_store::list(&db, &[query::same_tree(&root.id)]).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert!(ops[0].ready);
    assert!(ops[0].is_cascade_root());
}

#[tokio::test]
async fn test_duplicate_cascade_is_rejected() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    let builder = builder(&db);
    let scope = RequestScope::new();

    builder
        .create_root(&scope, ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();
    let err = builder
        .create_root(&scope, ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Conflict { .. }));
    assert_eq!(operation_store::count(&db, &[]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_or_mistyped_resource() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    let builder = builder(&db);
    let scope = RequestScope::new();

    assert!(matches!(
        builder.create_root(&scope, ResourceType::Tenant, "nope", true).await,
        Err(OperationError::NotFound(_))
    ));
    assert!(matches!(
        builder.create_root(&scope, ResourceType::Platform, &tree.tenant, true).await,
        Err(OperationError::Validation(_))
    ));

    resource_store::soft_delete(&db, &tree.platforms[1], test_start()).await.unwrap();
    assert!(matches!(
        builder.create_root(&scope, ResourceType::Platform, &tree.platforms[1], true).await,
        Err(OperationError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_deleted_dependents_are_not_expanded() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    resource_store::soft_delete(&db, &tree.platforms[1], test_start()).await.unwrap();
    let builder = builder(&db);

    let root = builder
        .create_root(&RequestScope::new(), ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();
    builder.expand(&root.id).await.unwrap();

    // p2, i3 and k3 drop out
    assert_eq!(
        operation_store::count(&db, &[query::same_tree(&root.id)]).await.unwrap(),
        8
    );
}

#[tokio::test]
async fn test_interrupted_expansion_resumes_without_duplicates() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    let builder = builder(&db);

    let root = builder
        .create_root(&RequestScope::new(), ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();

    // First tier committed, then the process died
    for (resource_type, id) in [
        (ResourceType::Platform, &tree.platforms[0]),
        (ResourceType::Platform, &tree.platforms[1]),
        (ResourceType::ServiceBroker, &tree.broker),
    ] {
        let child = Operation::cascade_child(&root, resource_type, id, test_start());
        operation_store::create(&db, &child).await.unwrap();
    }

    let report = builder.expand(&root.id).await.unwrap();
    assert!(report.completed);
    assert_eq!(report.created, 7);

    let ops = operation_store::list(&db, &[query::same_tree(&root.id)]).await.unwrap();
    assert_eq!(ops.len(), 11);
    assert!(ops.iter().all(|op| op.ready));

    // Expanding a finished tree changes nothing
    let again = builder.expand(&root.id).await.unwrap();
    assert!(again.completed);
    assert_eq!(again.created, 0);
    assert_eq!(
        operation_store::count(&db, &[query::same_tree(&root.id)]).await.unwrap(),
        11
    );
}

#[tokio::test]
async fn test_concurrent_expansions_build_one_tree() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    let builder = Arc::new(builder(&db));

    let root = builder
        .create_root(&RequestScope::new(), ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();

    let (a, b) = tokio::join!(builder.expand(&root.id), builder.expand(&root.id));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.completed || b.completed);
    assert_eq!(a.created + b.created, 10);
    assert_eq!(
        operation_store::count(&db, &[query::same_tree(&root.id)]).await.unwrap(),
        11
    );
}

#[tokio::test]
async fn test_tier_conflict_rolls_back_and_retries_later() {
    let db = setup_test_db().await;
    let tree = seed_tenant_tree(&db, "t1").await;
    let builder = builder(&db);

    let blocker = Operation::new(
        ResourceType::Platform,
        &tree.platforms[0],
        OperationType::Update,
        test_start(),
    );
    operation_store::create(&db, &blocker).await.unwrap();

    let root = builder
        .create_root(&RequestScope::new(), ResourceType::Tenant, &tree.tenant, true)
        .await
        .unwrap();
    let err = builder.expand(&root.id).await.unwrap_err();
    assert!(matches!(err, OperationError::Conflict { .. }));
    assert_eq!(
        operation_store::count(&db, &[query::same_tree(&root.id)]).await.unwrap(),
        1,
        "the whole tier must roll back"
    );

    let mut finished = blocker.clone();
    finished.state = OperationState::Succeeded;
    operation_store::update(&db, &finished).await.unwrap();

    let report = builder.expand(&root.id).await.unwrap();
    assert!(report.completed);
    assert_eq!(
        operation_store::count(&db, &[query::same_tree(&root.id)]).await.unwrap(),
        11
    );
}
