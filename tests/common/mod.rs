#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

use service_manager_backend::config::EngineConfig;
use service_manager_backend::error::ActionError;
use service_manager_backend::models::operation::{Operation, OperationState};
use service_manager_backend::models::resource::Resource;
use service_manager_backend::models::resource_type::ResourceType;
use service_manager_backend::query;
use service_manager_backend::services::clock::{Clock, ManualClock};
use service_manager_backend::services::engine::OperationEngine;
use service_manager_backend::services::maintainer::Maintainer;
use service_manager_backend::services::resource_actions::{ActionOutcome, ActionRequest, ResourceAction};
use service_manager_backend::services::retry::RetryPolicy;
use service_manager_backend::services::{operation_store, resource_store};

/// In-memory SQLite database with all migrations applied
///
/// A single pooled connection keeps every query on the same in-memory database.
pub async fn setup_test_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .expect("Test database connection should succeed");
    migration::Migrator::up(&db, None)
        .await
        .expect("Migrations should apply");
    db
}

pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 26, 12, 0, 0).unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        tick_interval: Duration::from_secs(1),
        stale_threshold: Duration::from_secs(300),
        retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10)),
        worker_pool_size: 4,
        broker_timeout: Duration::from_secs(5),
        prune_finished_cascades: true,
    }
}

pub async fn seed(db: &DatabaseConnection, resource: Resource) {
    resource_store::create_resource(db, &resource)
        .await
        .expect("seeding resource");
}

/// Ids of a seeded tenant inventory
pub struct TenantTree {
    pub tenant: String,
    pub platforms: Vec<String>,
    pub broker: String,
    pub instances: Vec<String>,
    pub bindings: Vec<String>,
}

impl TenantTree {
    pub fn descendants(&self) -> usize {
        self.platforms.len() + 1 + self.instances.len() + self.bindings.len()
    }
}

/// Tenant with 10 descendants:
///
/// ```text
/// tenant ─┬─ p1 ─┬─ i1 ── k1
///         │      └─ i2 ── k2
///         ├─ p2 ─── i3 ── k3
///         └─ b1 ─── i4
/// ```
pub async fn seed_tenant_tree(db: &DatabaseConnection, prefix: &str) -> TenantTree {
    let now = test_start();
    let id = |name: &str| format!("{}-{}", prefix, name);

    let tenant = id("tenant");
    seed(db, Resource::new(ResourceType::Tenant, &tenant, "tenant", now)).await;

    let broker = id("b1");
    seed(
        db,
        Resource::new(ResourceType::ServiceBroker, &broker, "broker", now)
            .owned_by(&tenant)
            .with_broker_url("http://127.0.0.1:1"),
    )
    .await;

    let platforms = vec![id("p1"), id("p2")];
    for p in &platforms {
        seed(db, Resource::new(ResourceType::Platform, p, p, now).owned_by(&tenant)).await;
    }

    let owners = [&platforms[0], &platforms[0], &platforms[1], &broker];
    let instances: Vec<String> = (1..=4).map(|n| id(&format!("i{}", n))).collect();
    for (instance, owner) in instances.iter().zip(owners) {
        seed(
            db,
            Resource::new(ResourceType::ServiceInstance, instance, instance, now)
                .owned_by(owner)
                .served_by(&broker),
        )
        .await;
    }

    let bindings: Vec<String> = (1..=3).map(|n| id(&format!("k{}", n))).collect();
    for (binding, instance) in bindings.iter().zip(&instances) {
        seed(
            db,
            Resource::new(ResourceType::ServiceBinding, binding, binding, now)
                .owned_by(instance)
                .served_by(&broker),
        )
        .await;
    }

    TenantTree {
        tenant,
        platforms,
        broker,
        instances,
        bindings,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Invoke(String),
    Poll(String, String),
}

/// Scriptable [`ResourceAction`]
///
/// Results are queued per resource id; an empty queue succeeds. Every call
/// checks that the operation's parent has already succeeded.
pub struct ScriptedActions {
    db: DatabaseConnection,
    invoke_script: Mutex<HashMap<String, VecDeque<Result<ActionOutcome, ActionError>>>>,
    poll_script: Mutex<HashMap<String, VecDeque<Result<ActionOutcome, ActionError>>>>,
    /// Resources whose actions fail transiently forever
    always_transient: Mutex<HashSet<String>>,
    /// Resources whose actions keep reporting "still running"
    running: Mutex<HashSet<String>>,
    /// Resources whose invocations never return
    hanging: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    violations: Mutex<Vec<String>>,
}

impl ScriptedActions {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            invoke_script: Mutex::new(HashMap::new()),
            poll_script: Mutex::new(HashMap::new()),
            always_transient: Mutex::new(HashSet::new()),
            running: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
        }
    }

    pub fn on_invoke(&self, resource_id: &str, result: Result<ActionOutcome, ActionError>) {
        self.invoke_script
            .lock()
            .entry(resource_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn on_poll(&self, resource_id: &str, result: Result<ActionOutcome, ActionError>) {
        self.poll_script
            .lock()
            .entry(resource_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn fail_transiently(&self, resource_id: &str) {
        self.always_transient.lock().insert(resource_id.to_string());
    }

    pub fn keep_running(&self, resource_id: &str) {
        self.running.lock().insert(resource_id.to_string());
    }

    /// Let a resource kept running complete on its next poll
    pub fn finish(&self, resource_id: &str) {
        self.running.lock().remove(resource_id);
    }

    pub fn hang(&self, resource_id: &str) {
        self.hanging.lock().insert(resource_id.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn invocations(&self, resource_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Invoke(id) if id == resource_id))
            .count()
    }

    pub fn polls(&self, resource_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Poll(id, _) if id == resource_id))
            .count()
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }

    async fn check_parent(&self, request: &ActionRequest) {
        let op = operation_store::get(&self.db, &request.operation_id)
            .await
            .expect("operation under action exists");
        if let Some(parent_id) = op.parent_id {
            let parent = operation_store::get(&self.db, &parent_id)
                .await
                .expect("parent exists");
            if parent.state != OperationState::Succeeded {
                self.violations.lock().push(format!(
                    "{} ran while parent {} was {}",
                    op.id, parent.id, parent.state
                ));
            }
        }
    }

    fn scripted(
        &self,
        script: &Mutex<HashMap<String, VecDeque<Result<ActionOutcome, ActionError>>>>,
        resource_id: &str,
    ) -> Result<ActionOutcome, ActionError> {
        if self.always_transient.lock().contains(resource_id) {
            return Err(ActionError::Transient("broker unavailable".to_string()));
        }
        if self.running.lock().contains(resource_id) {
            return Ok(ActionOutcome::StillRunning {
                handle: format!("last-op-{}", resource_id),
            });
        }
        script
            .lock()
            .get_mut(resource_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(ActionOutcome::Succeeded))
    }
}

#[async_trait]
impl ResourceAction for ScriptedActions {
    async fn invoke(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        self.check_parent(request).await;
        self.calls.lock().push(Call::Invoke(request.resource_id.clone()));
        if self.hanging.lock().contains(&request.resource_id) {
            std::future::pending::<()>().await;
        }
        self.scripted(&self.invoke_script, &request.resource_id)
    }

    async fn poll(&self, request: &ActionRequest, handle: &str) -> Result<ActionOutcome, ActionError> {
        self.check_parent(request).await;
        self.calls
            .lock()
            .push(Call::Poll(request.resource_id.clone(), handle.to_string()));
        self.scripted(&self.poll_script, &request.resource_id)
    }
}

/// Engine wired to an in-memory database, a manual clock and scripted actions
pub struct Harness {
    pub db: DatabaseConnection,
    pub clock: Arc<ManualClock>,
    pub actions: Arc<ScriptedActions>,
    pub engine: Arc<OperationEngine>,
    pub maintainer: Arc<Maintainer>,
    pub shutdown: CancellationToken,
    pub config: EngineConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let db = setup_test_db().await;
        let clock = Arc::new(ManualClock::new(test_start()));
        let actions = Arc::new(ScriptedActions::new(db.clone()));
        let shutdown = CancellationToken::new();

        let engine = Arc::new(OperationEngine::new(
            db.clone(),
            Arc::clone(&actions) as Arc<dyn ResourceAction>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            config.clone(),
            shutdown.clone(),
        ));
        let maintainer = Arc::new(engine.maintainer());

        Self {
            db,
            clock,
            actions,
            engine,
            maintainer,
            shutdown,
            config,
        }
    }

    pub async fn op(&self, id: &str) -> Operation {
        operation_store::get(&self.db, id).await.expect("operation exists")
    }

    pub async fn tree_count(&self, root_id: &str) -> u64 {
        operation_store::count(&self.db, &[query::same_tree(root_id)])
            .await
            .expect("count")
    }

    pub async fn states(&self, root_id: &str) -> Vec<OperationState> {
        self.engine
            .list_tree(root_id)
            .await
            .expect("list tree")
            .into_iter()
            .map(|op| op.state)
            .collect()
    }

    /// Execute every non-terminal operation round after round, without the
    /// maintainer, until a round changes nothing. Blocked operations are
    /// offered to the scheduler too and must stay untouched.
    pub async fn drive(&self, max_rounds: usize) -> usize {
        let scheduler = self.engine.scheduler();
        for round in 0..max_rounds {
            self.engine.wait_for_background().await;
            let before = snapshot(&self.db).await;
            let ids: Vec<String> = operation_store::list(&self.db, &[query::non_terminal()])
                .await
                .expect("list")
                .into_iter()
                .map(|op| op.id)
                .collect();
            scheduler.dispatch(ids).await;
            if snapshot(&self.db).await == before {
                return round;
            }
        }
        max_rounds
    }

    /// Run maintainer ticks, advancing the clock by one tick interval each time
    pub async fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.engine.wait_for_background().await;
            self.clock.advance(self.config.tick_interval);
            self.maintainer.tick().await.expect("tick");
        }
    }
}

async fn snapshot(db: &DatabaseConnection) -> Vec<(String, OperationState, Option<String>, i32)> {
    operation_store::list(db, &[])
        .await
        .expect("list")
        .into_iter()
        .map(|op| (op.id, op.state, op.external_id, op.retry_count))
        .collect()
}
