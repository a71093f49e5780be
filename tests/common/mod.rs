//! Shared fixtures for the integration tests.
//!
//! `ScriptedExecutor` stands in for the HTTP layer so retry timing can be
//! driven with paused Tokio time; `CaptureResponder` records what reached a
//! wiremock server when the real `HttpExecutor` is under test.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use webhook_notifier::{
    build_request, DeliveryExecutor, DeliveryJob, DeliveryOutcome, Dispatcher, DispatcherConfig,
    DomainEvent, IdempotencyKey, InMemoryDlqStore, InMemoryRegistry, OutboundRequest, StoreError,
    Subscription, SubscriptionHealth, SubscriptionId, SubscriptionRegistry, SubscriptionStatus,
    SubscriptionUpdate, TriggerType,
};
use wiremock::{Request, Respond, ResponseTemplate};

pub const SECRET: &str = "whsec_test_secret_key_12345";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One observed delivery attempt.
#[derive(Debug, Clone)]
pub struct Call {
    pub subscription_id: SubscriptionId,
    pub idempotency_key: IdempotencyKey,
    /// 1-based number of this attempt within its job.
    pub attempt: u32,
    pub at: Instant,
    pub request: OutboundRequest,
}

#[derive(Default)]
struct Counters {
    per_subscription: HashMap<SubscriptionId, usize>,
    per_key: HashMap<IdempotencyKey, usize>,
    max_per_subscription: HashMap<SubscriptionId, usize>,
    max_per_key: usize,
}

/// Executor answering with scripted HTTP statuses.
///
/// Each subscription pops statuses from its script; once the script is empty
/// the default status is used.
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<SubscriptionId, VecDeque<u16>>>,
    default_status: u16,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    counters: Mutex<Counters>,
}

impl ScriptedExecutor {
    pub fn new(default_status: u16) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_status,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, id: SubscriptionId, statuses: &[u16]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id, statuses.iter().copied().collect());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: &SubscriptionId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| &call.subscription_id == id)
            .collect()
    }

    pub fn max_concurrency(&self, id: &SubscriptionId) -> usize {
        self.counters
            .lock()
            .unwrap()
            .max_per_subscription
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_concurrency_per_key(&self) -> usize {
        self.counters.lock().unwrap().max_per_key
    }

    fn enter(&self, job: &DeliveryJob) {
        let mut counters = self.counters.lock().unwrap();
        let current = {
            let entry = counters.per_subscription.entry(job.subscription_id).or_insert(0);
            *entry += 1;
            *entry
        };
        let max = counters.max_per_subscription.entry(job.subscription_id).or_insert(0);
        *max = (*max).max(current);

        let per_key = {
            let entry = counters.per_key.entry(job.idempotency_key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        counters.max_per_key = counters.max_per_key.max(per_key);
    }

    fn leave(&self, job: &DeliveryJob) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(n) = counters.per_subscription.get_mut(&job.subscription_id) {
            *n -= 1;
        }
        if let Some(n) = counters.per_key.get_mut(&job.idempotency_key) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl DeliveryExecutor for ScriptedExecutor {
    async fn attempt(&self, job: &DeliveryJob, subscription: &Subscription, _timeout: Duration) -> DeliveryOutcome {
        let request = match build_request(job, subscription, 1_700_000_000) {
            Ok(request) => request,
            Err(err) => return DeliveryOutcome::FatalFailure(err.into()),
        };

        self.enter(job);
        self.calls.lock().unwrap().push(Call {
            subscription_id: job.subscription_id,
            idempotency_key: job.idempotency_key.clone(),
            attempt: job.attempt_count + 1,
            at: Instant::now(),
            request,
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let status = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&job.subscription_id)
            .and_then(|script| script.pop_front())
            .unwrap_or(self.default_status);

        self.leave(job);
        DeliveryOutcome::from_status(status)
    }
}

/// Registry whose backing store is down.
pub struct UnavailableRegistry;

#[async_trait]
impl SubscriptionRegistry for UnavailableRegistry {
    async fn find_active_by_trigger(&self, _trigger: TriggerType) -> Result<Vec<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn record_outcome(&self, _id: &SubscriptionId, _success: bool) -> Result<Option<SubscriptionHealth>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn set_status(&self, _id: &SubscriptionId, _status: SubscriptionStatus) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn insert(&self, _subscription: Subscription) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn update(&self, _id: &SubscriptionId, _update: SubscriptionUpdate) -> Result<Option<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn remove(&self, _id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// In-memory registry with injected latency around outcome writes and admin
/// edits, for interleaving admin calls with the scheduler.
pub struct SlowRegistry {
    inner: Arc<InMemoryRegistry>,
    outcome_delay: Duration,
    update_delay: Duration,
}

impl SlowRegistry {
    pub fn new(inner: Arc<InMemoryRegistry>) -> Self {
        Self {
            inner,
            outcome_delay: Duration::ZERO,
            update_delay: Duration::ZERO,
        }
    }

    /// Sleep after `record_outcome` has been applied.
    pub fn with_outcome_delay(mut self, delay: Duration) -> Self {
        self.outcome_delay = delay;
        self
    }

    /// Sleep before `update` is applied.
    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = delay;
        self
    }
}

#[async_trait]
impl SubscriptionRegistry for SlowRegistry {
    async fn find_active_by_trigger(&self, trigger: TriggerType) -> Result<Vec<Subscription>, StoreError> {
        self.inner.find_active_by_trigger(trigger).await
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        self.inner.get(id).await
    }

    async fn record_outcome(&self, id: &SubscriptionId, success: bool) -> Result<Option<SubscriptionHealth>, StoreError> {
        let health = self.inner.record_outcome(id, success).await;
        tokio::time::sleep(self.outcome_delay).await;
        health
    }

    async fn set_status(&self, id: &SubscriptionId, status: SubscriptionStatus) -> Result<bool, StoreError> {
        self.inner.set_status(id, status).await
    }

    async fn insert(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.inner.insert(subscription).await
    }

    async fn update(&self, id: &SubscriptionId, update: SubscriptionUpdate) -> Result<Option<Subscription>, StoreError> {
        tokio::time::sleep(self.update_delay).await;
        self.inner.update(id, update).await
    }

    async fn remove(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        self.inner.remove(id).await
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        self.inner.list().await
    }
}

/// A dispatcher over in-memory stores and a scripted executor.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub registry: Arc<InMemoryRegistry>,
    pub dlq_store: Arc<InMemoryDlqStore>,
    pub executor: Arc<ScriptedExecutor>,
}

impl Harness {
    pub fn new(config: DispatcherConfig, executor: ScriptedExecutor) -> Self {
        init_tracing();
        let registry = Arc::new(InMemoryRegistry::new());
        let dlq_store = Arc::new(InMemoryDlqStore::new());
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(
            config,
            registry.clone(),
            dlq_store.clone(),
            executor.clone(),
        );
        Self {
            dispatcher,
            registry,
            dlq_store,
            executor,
        }
    }

    pub async fn subscribe(&self, subscription: Subscription) -> Subscription {
        self.registry.insert(subscription.clone()).await.unwrap();
        subscription
    }

    pub async fn current(&self, id: &SubscriptionId) -> Subscription {
        self.registry.get(id).await.unwrap().unwrap()
    }
}

pub fn test_config() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_worker_count(4)
        .with_queue_size(64)
}

pub fn event(id: &str, trigger: TriggerType) -> DomainEvent {
    DomainEvent::new(id, trigger, serde_json::json!({ "event": id, "amount": 42 }))
}

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A wiremock responder that captures incoming requests.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code)
    }
}
