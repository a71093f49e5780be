use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::backoff::Verdict;
use crate::config::DispatcherConfig;
use crate::dlq::{DlqManager, DlqStore};
use crate::error::{DeliveryOutcome, DispatchError};
use crate::executor::{DeliveryExecutor, HttpExecutor};
use crate::registry::SubscriptionRegistry;
use crate::telemetry::{metric_inc, metric_inc_subscription};
use crate::types::{
    DeadLetterReason, DeliveryJob, DeliveryState, DeliveryStatus, DlqEntry, DomainEvent, EventId,
    IdempotencyKey, NewSubscription, Subscription, SubscriptionId, SubscriptionStatus,
    SubscriptionUpdate, WebhookStats,
};
use crate::worker::{worker_loop, SchedulerMsg, Task, WorkerContext, WorkerReport};

pub(crate) use crate::worker::JobOrigin;

/// What happened to each matching subscription when an event fanned out.
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub event_id: EventId,
    /// Jobs accepted into the delivery queue.
    pub queued: Vec<IdempotencyKey>,
    /// Jobs whose key was already being driven.
    pub skipped: Vec<IdempotencyKey>,
    /// Jobs recorded straight into the dead-letter queue without an attempt.
    pub dead_lettered: Vec<(SubscriptionId, DeadLetterReason)>,
}

impl DispatchReceipt {
    fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            queued: Vec::new(),
            skipped: Vec::new(),
            dead_lettered: Vec::new(),
        }
    }

    /// Number of subscriptions the event matched.
    pub fn matched(&self) -> usize {
        self.queued.len() + self.skipped.len() + self.dead_lettered.len()
    }
}

/// Webhook delivery engine.
///
/// Cloning is cheap; all clones drive the same workers. Background tasks stop
/// on [`Dispatcher::shutdown`] or when the last clone is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

struct Shared {
    core: Arc<Core>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    _cancel_on_drop: DropGuard,
}

/// State shared by the dispatcher handle and the scheduler task.
struct Core {
    config: DispatcherConfig,
    registry: Arc<dyn SubscriptionRegistry>,
    dlq_store: Arc<dyn DlqStore>,
    ctx: Arc<WorkerContext>,
    job_tx: mpsc::Sender<Task>,
    /// Keys between submission and their terminal state.
    active: Mutex<HashSet<IdempotencyKey>>,
    idle: Notify,
    status: RwLock<StatusBook>,
}

impl Dispatcher {
    /// Start the worker pool and scheduler. Must be called inside a Tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<dyn SubscriptionRegistry>,
        dlq_store: Arc<dyn DlqStore>,
        executor: Arc<dyn DeliveryExecutor>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));
        let shared_job_rx = Arc::new(Mutex::new(job_rx));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(WorkerContext {
            registry: registry.clone(),
            executor,
            lanes: RwLock::new(HashMap::new()),
            lane_limit: config.per_subscription_concurrency.max(1),
            attempt_timeout: config.attempt_timeout,
            report_tx,
            shutdown: shutdown.clone(),
        });

        let mut handles = Vec::with_capacity(config.worker_count + 1);
        for _ in 0..config.worker_count.max(1) {
            handles.push(tokio::spawn(worker_loop(shared_job_rx.clone(), ctx.clone())));
        }

        let core = Arc::new(Core {
            status: RwLock::new(StatusBook::new(config.status_capacity.max(1))),
            config,
            registry,
            dlq_store,
            ctx,
            job_tx,
            active: Mutex::new(HashSet::new()),
            idle: Notify::new(),
        });

        let scheduler = Scheduler {
            core: core.clone(),
            rx: report_rx,
            heap: BinaryHeap::new(),
            seq: 0,
        };
        handles.push(tokio::spawn(scheduler.run()));

        tracing::info!(
            target: "webhook_delivery",
            workers = core.config.worker_count.max(1),
            queue_size = core.config.queue_size.max(1),
            per_subscription_concurrency = core.ctx.lane_limit,
            "Webhook dispatcher started"
        );

        Self {
            shared: Arc::new(Shared {
                core,
                running: AtomicBool::new(true),
                handles: Mutex::new(handles),
                _cancel_on_drop: shutdown.drop_guard(),
            }),
        }
    }

    /// Start a dispatcher that delivers over HTTP.
    pub fn with_http(
        config: DispatcherConfig,
        registry: Arc<dyn SubscriptionRegistry>,
        dlq_store: Arc<dyn DlqStore>,
    ) -> Result<Self, reqwest::Error> {
        let executor = Arc::new(HttpExecutor::new()?);
        Ok(Self::new(config, registry, dlq_store, executor))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core().config
    }

    fn core(&self) -> &Arc<Core> {
        &self.shared.core
    }

    pub(crate) fn registry(&self) -> &Arc<dyn SubscriptionRegistry> {
        &self.core().registry
    }

    pub(crate) fn dlq_store(&self) -> &Arc<dyn DlqStore> {
        &self.core().dlq_store
    }

    /// Fan an event out to every active subscription for its trigger.
    ///
    /// Returns once each job is queued or dead-lettered; delivery happens in
    /// the background. Fails only if the registry cannot be read or the
    /// dispatcher is shut down.
    pub async fn dispatch(&self, event: DomainEvent) -> Result<DispatchReceipt, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }

        let subscriptions = match self.registry().find_active_by_trigger(event.trigger).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                metric_inc("webhook.dispatch.registry_error");
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.id,
                    trigger = %event.trigger,
                    error = %err,
                    "Registry unavailable, event not dispatched"
                );
                return Err(err.into());
            }
        };

        let mut receipt = DispatchReceipt::new(event.id.clone());

        for subscription in subscriptions {
            let job = DeliveryJob::for_event(&event, subscription.id);
            let key = job.idempotency_key.clone();

            if let Err(err) = subscription.signature.validate() {
                let reason = DeadLetterReason::Configuration { message: err.to_string() };
                tracing::warn!(
                    target: "webhook_delivery",
                    subscription_id = %subscription.id,
                    idempotency_key = %key,
                    error = %err,
                    "Subscription cannot be signed, delivery dead-lettered"
                );
                self.dead_letter_unsent(&job, &subscription, reason.clone()).await;
                receipt.dead_lettered.push((subscription.id, reason));
                continue;
            }

            let subscription_id = subscription.id;
            let name = subscription.name.clone();
            match self.submit(job.clone(), subscription, JobOrigin::Automatic).await {
                Ok(()) => receipt.queued.push(key),
                Err(DispatchError::AlreadyInFlight(_)) => {
                    metric_inc("webhook.dispatch.duplicate");
                    receipt.skipped.push(key);
                }
                Err(DispatchError::Backpressure) => {
                    let reason = DeadLetterReason::Backpressure;
                    tracing::warn!(
                        target: "webhook_delivery",
                        subscription_id = %subscription_id,
                        idempotency_key = %key,
                        "Delivery queue full, delivery dead-lettered"
                    );
                    let entry = DlqEntry::new(&job, name, reason.clone());
                    self.store_unsent(entry, DeliveryStatus::DeadLettered).await;
                    receipt.dead_lettered.push((subscription_id, reason));
                }
                Err(err) => return Err(err),
            }
        }

        metric_inc("webhook.dispatch.completed");
        tracing::info!(
            target: "webhook_delivery",
            event_id = %event.id,
            trigger = %event.trigger,
            queued = receipt.queued.len(),
            skipped = receipt.skipped.len(),
            dead_lettered = receipt.dead_lettered.len(),
            "Event dispatched"
        );
        Ok(receipt)
    }

    /// Put a job on the delivery queue.
    pub(crate) async fn submit(
        &self,
        job: DeliveryJob,
        subscription: Subscription,
        origin: JobOrigin,
    ) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }

        let core = self.core();
        let key = job.idempotency_key.clone();
        {
            let mut active = core.active.lock().await;
            if !active.insert(key.clone()) {
                return Err(DispatchError::AlreadyInFlight(key.0));
            }
        }

        let attempts = job.attempt_count;
        match core.job_tx.try_send(Task { job, subscription, origin }) {
            Ok(()) => {
                core.record_state(&key, DeliveryStatus::Queued, attempts, None).await;
                metric_inc("webhook.dispatch.enqueued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                core.release(&key).await;
                metric_inc("webhook.dispatch.backpressure");
                Err(DispatchError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                core.release(&key).await;
                Err(DispatchError::Shutdown)
            }
        }
    }

    async fn dead_letter_unsent(&self, job: &DeliveryJob, subscription: &Subscription, reason: DeadLetterReason) {
        let entry = DlqEntry::new(job, subscription.name.clone(), reason);
        self.store_unsent(entry, DeliveryStatus::Rejected).await;
    }

    /// `Rejected` for jobs that could never be sent; `DeadLettered` for jobs
    /// dropped under backpressure.
    async fn store_unsent(&self, entry: DlqEntry, status: DeliveryStatus) {
        let key = entry.idempotency_key.clone();
        let last_error = entry.last_error.clone();
        match self.dlq_store().upsert(entry).await {
            Ok(_) => metric_inc("webhook.dlq.inserted"),
            Err(err) => tracing::error!(
                target: "webhook_delivery",
                idempotency_key = %key,
                error = %err,
                "Failed to record dead-letter entry"
            ),
        }
        self.core()
            .record_state(&key, status, 0, Some(last_error))
            .await;
    }

    pub async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription, DispatchError> {
        validate_name(&new.name)?;
        validate_url(&new.url)?;
        new.signature.validate()?;

        let mut subscription = Subscription::new(new.name.trim(), new.url, new.trigger);
        subscription.signature = new.signature;
        self.registry().insert(subscription.clone()).await?;

        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %subscription.id,
            name = %subscription.name,
            trigger = %subscription.trigger,
            signature = subscription.signature.as_str(),
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Apply an admin edit.
    ///
    /// Status can only be set to `active` or `paused`; `error` is reserved for
    /// automatic disabling. Leaving `active` cancels pending retries.
    pub async fn update_subscription(
        &self,
        id: &SubscriptionId,
        mut update: SubscriptionUpdate,
    ) -> Result<Subscription, DispatchError> {
        if let Some(name) = update.name.as_mut() {
            validate_name(name.as_str())?;
            *name = name.trim().to_string();
        }
        if let Some(url) = &update.url {
            validate_url(url)?;
        }
        if let Some(signature) = &update.signature {
            signature.validate()?;
        }
        if update.status == Some(SubscriptionStatus::Error) {
            return Err(DispatchError::Validation(
                "status `error` is set automatically and cannot be chosen".to_string(),
            ));
        }

        // Only the fields the admin named are written; status stays whatever
        // the scheduler last stored unless it was asked for.
        let subscription = self
            .registry()
            .update(id, update)
            .await?
            .ok_or(DispatchError::SubscriptionNotFound(*id))?;
        if !subscription.is_active() {
            self.cancel_pending(id);
        }

        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %id,
            status = %subscription.status,
            "Subscription updated"
        );
        Ok(subscription)
    }

    pub async fn set_subscription_status(
        &self,
        id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<Subscription, DispatchError> {
        let update = SubscriptionUpdate {
            status: Some(status),
            ..Default::default()
        };
        self.update_subscription(id, update).await
    }

    /// Remove a subscription with its dead-letter entries and pending retries.
    pub async fn delete_subscription(&self, id: &SubscriptionId) -> Result<Subscription, DispatchError> {
        let removed = self
            .registry()
            .remove(id)
            .await?
            .ok_or(DispatchError::SubscriptionNotFound(*id))?;
        let purged = self.dlq_store().purge_subscription(id).await?;

        self.cancel_pending(id);
        self.core().ctx.drop_lane(id).await;

        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %id,
            name = %removed.name,
            purged_dlq_entries = purged,
            "Subscription deleted"
        );
        Ok(removed)
    }

    pub async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, DispatchError> {
        Ok(self.registry().get(id).await?)
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, DispatchError> {
        Ok(self.registry().list().await?)
    }

    pub async fn stats(&self) -> Result<WebhookStats, DispatchError> {
        let subscriptions = self.registry().list().await?;
        let dlq_depth = self.dlq_store().count().await?;
        Ok(WebhookStats {
            total_subscriptions: subscriptions.len(),
            active_subscriptions: subscriptions.iter().filter(|s| s.is_active()).count(),
            total_deliveries: subscriptions.iter().map(|s| s.total_deliveries).sum(),
            dlq_depth,
        })
    }

    pub fn dlq(&self) -> DlqManager {
        DlqManager::new(self.clone())
    }

    pub async fn delivery_status(&self, key: &IdempotencyKey) -> Option<DeliveryState> {
        self.core().status.read().await.get(key)
    }

    /// Wait until every submitted job has reached a terminal state.
    pub async fn wait_idle(&self) {
        let core = self.core();
        loop {
            let notified = core.idle.notified();
            if core.active.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and cancel in-flight attempts and pending retries.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core().ctx.shutdown.cancel();

        let handles = std::mem::take(&mut *self.shared.handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }

        let abandoned = self.core().abandon_active().await;
        tracing::info!(
            target: "webhook_delivery",
            abandoned,
            "Webhook dispatcher stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn cancel_pending(&self, id: &SubscriptionId) {
        // The scheduler only goes away on shutdown, which cancels everything anyway.
        let _ = self
            .core()
            .ctx
            .report_tx
            .send(SchedulerMsg::CancelSubscription(*id));
    }
}

impl Core {
    async fn record_state(
        &self,
        key: &IdempotencyKey,
        status: DeliveryStatus,
        attempts: u32,
        last_error: Option<String>,
    ) {
        let state = DeliveryState {
            status,
            attempts,
            last_error,
            updated_at: Utc::now(),
        };
        self.status.write().await.record(key, state);
    }

    async fn release(&self, key: &IdempotencyKey) {
        let mut active = self.active.lock().await;
        active.remove(key);
        if active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Record a terminal state and free the key.
    async fn finish(&self, task: &Task, status: DeliveryStatus, last_error: Option<String>) {
        let key = &task.job.idempotency_key;
        self.record_state(key, status, task.job.attempt_count, last_error).await;
        self.release(key).await;
    }

    async fn abandon_active(&self) -> usize {
        let keys: Vec<IdempotencyKey> = self.active.lock().await.drain().collect();
        for key in &keys {
            let attempts = self.status.read().await.get(key).map_or(0, |s| s.attempts);
            self.record_state(
                key,
                DeliveryStatus::Cancelled,
                attempts,
                Some("dispatcher shut down".to_string()),
            )
            .await;
        }
        self.idle.notify_waiters();
        keys.len()
    }

    /// Why a retry should not run any more, if it shouldn't.
    async fn retry_blocker(&self, task: &Task) -> Option<&'static str> {
        match self.registry.get(&task.job.subscription_id).await {
            Ok(None) => Some("subscription deleted"),
            Ok(Some(sub)) if task.origin == JobOrigin::Automatic && !sub.is_active() => {
                Some("subscription not active")
            }
            Ok(Some(_)) => None,
            Err(err) => {
                tracing::warn!(
                    target: "webhook_delivery",
                    subscription_id = %task.job.subscription_id,
                    error = %err,
                    "Registry unavailable, keeping retry"
                );
                None
            }
        }
    }
}

/// Single owner of retry timing, health updates and dead-lettering.
struct Scheduler {
    core: Arc<Core>,
    rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    heap: BinaryHeap<TimedTask>,
    seq: u64,
}

impl Scheduler {
    async fn run(mut self) {
        let shutdown = self.core.ctx.shutdown.clone();
        loop {
            let next_ready = self.heap.peek().map(|t| t.ready_at);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = sleep_until_next(next_ready) => self.release_due().await,
            }
        }
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Report(WorkerReport::Attempted { task, outcome }) => {
                self.on_attempt(task, outcome).await;
            }
            SchedulerMsg::Report(WorkerReport::Deferred(task)) => {
                let ready_at = Instant::now() + self.saturation_delay();
                self.push(ready_at, task);
            }
            SchedulerMsg::Report(WorkerReport::Cancelled { task, reason }) => {
                tracing::debug!(
                    target: "webhook_delivery",
                    idempotency_key = %task.job.idempotency_key,
                    reason,
                    "Delivery cancelled"
                );
                metric_inc("webhook.delivery.cancelled");
                self.core
                    .finish(&task, DeliveryStatus::Cancelled, Some(reason.to_string()))
                    .await;
            }
            SchedulerMsg::CancelSubscription(id) => {
                self.cancel_pending(&id, "subscription paused or deleted").await;
            }
        }
    }

    async fn on_attempt(&mut self, task: Task, outcome: DeliveryOutcome) {
        match self.core.config.backoff.decide(&outcome, task.job.attempt_count) {
            Verdict::Delivered => self.on_delivered(task, outcome.status()).await,
            Verdict::RetryAfter(delay) => {
                if let Some(reason) = self.core.retry_blocker(&task).await {
                    metric_inc("webhook.delivery.cancelled");
                    self.core
                        .finish(&task, DeliveryStatus::Cancelled, Some(reason.to_string()))
                        .await;
                    return;
                }

                let last_error = failure_message(&outcome);
                tracing::info!(
                    target: "webhook_delivery",
                    subscription_id = %task.job.subscription_id,
                    idempotency_key = %task.job.idempotency_key,
                    attempt = task.job.attempt_count,
                    retry_in_ms = delay.as_millis() as u64,
                    error = last_error.as_deref().unwrap_or_default(),
                    "Delivery failed, retry scheduled"
                );
                metric_inc("webhook.delivery.retry_scheduled");
                self.core
                    .record_state(
                        &task.job.idempotency_key,
                        DeliveryStatus::Retrying,
                        task.job.attempt_count,
                        last_error,
                    )
                    .await;
                self.push(Instant::now() + delay, task);
            }
            Verdict::Exhausted(last) => {
                self.dead_letter(task, DeadLetterReason::RetryExhausted { last }).await;
            }
            Verdict::Rejected(reason) => {
                self.dead_letter(task, DeadLetterReason::Rejected { reason }).await;
            }
        }
    }

    async fn on_delivered(&mut self, task: Task, status: Option<u16>) {
        let id = task.job.subscription_id;
        let key = &task.job.idempotency_key;

        if let Err(err) = self.core.registry.record_outcome(&id, true).await {
            tracing::error!(
                target: "webhook_delivery",
                subscription_id = %id,
                error = %err,
                "Failed to record delivery outcome"
            );
        }

        match self.core.dlq_store.remove_by_key(key).await {
            Ok(true) => tracing::info!(
                target: "webhook_delivery",
                subscription_id = %id,
                idempotency_key = %key,
                "Dead-lettered delivery recovered"
            ),
            Ok(false) => {}
            Err(err) => tracing::error!(
                target: "webhook_delivery",
                idempotency_key = %key,
                error = %err,
                "Failed to clear dead-letter entry"
            ),
        }

        metric_inc("webhook.delivery.success");
        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %id,
            idempotency_key = %key,
            attempt = task.job.attempt_count,
            status = status.unwrap_or_default(),
            "Webhook delivered"
        );
        self.core.finish(&task, DeliveryStatus::Delivered, None).await;
    }

    async fn dead_letter(&mut self, task: Task, reason: DeadLetterReason) {
        let id = task.job.subscription_id;

        let health = match self.core.registry.record_outcome(&id, false).await {
            Ok(Some(health)) => Some(health),
            Ok(None) => {
                // Deleted while the attempt was running; its entries are gone too.
                self.core
                    .finish(&task, DeliveryStatus::Cancelled, Some("subscription deleted".to_string()))
                    .await;
                return;
            }
            Err(err) => {
                tracing::error!(
                    target: "webhook_delivery",
                    subscription_id = %id,
                    error = %err,
                    "Failed to record delivery outcome"
                );
                None
            }
        };

        let entry = DlqEntry::new(&task.job, task.subscription.name.clone(), reason);
        let last_error = entry.last_error.clone();
        match self.core.dlq_store.upsert(entry).await {
            Ok(_) => {
                if self.deleted_meanwhile(&task).await {
                    self.core
                        .finish(&task, DeliveryStatus::Cancelled, Some("subscription deleted".to_string()))
                        .await;
                    return;
                }
                metric_inc("webhook.dlq.inserted");
                metric_inc_subscription("webhook.dlq.inserted.subscription", &id);
                tracing::warn!(
                    target: "webhook_delivery",
                    subscription_id = %id,
                    idempotency_key = %task.job.idempotency_key,
                    attempts = task.job.attempt_count,
                    error = %last_error,
                    "Delivery dead-lettered"
                );
            }
            Err(err) => tracing::error!(
                target: "webhook_delivery",
                idempotency_key = %task.job.idempotency_key,
                error = %err,
                "Failed to record dead-letter entry"
            ),
        }

        if let Some(health) = health {
            if health.status == SubscriptionStatus::Active
                && health.consecutive_failures >= self.core.config.failure_threshold
            {
                self.disable(&id, health.consecutive_failures).await;
            }
        }

        self.core
            .finish(&task, DeliveryStatus::DeadLettered, Some(last_error))
            .await;
    }

    /// A delete can land between the outcome write and the upsert, after its
    /// purge already ran. Drop the entry just written if the owner is gone.
    async fn deleted_meanwhile(&self, task: &Task) -> bool {
        let id = task.job.subscription_id;
        match self.core.registry.get(&id).await {
            Ok(None) => {}
            Ok(Some(_)) => return false,
            Err(err) => {
                tracing::warn!(
                    target: "webhook_delivery",
                    subscription_id = %id,
                    error = %err,
                    "Registry unavailable, keeping dead-letter entry"
                );
                return false;
            }
        }

        if let Err(err) = self.core.dlq_store.remove_by_key(&task.job.idempotency_key).await {
            tracing::error!(
                target: "webhook_delivery",
                idempotency_key = %task.job.idempotency_key,
                error = %err,
                "Failed to drop dead-letter entry of deleted subscription"
            );
        }
        true
    }

    async fn disable(&mut self, id: &SubscriptionId, consecutive_failures: u32) {
        match self.core.registry.set_status(id, SubscriptionStatus::Error).await {
            Ok(true) => {
                metric_inc("webhook.subscription.disabled");
                tracing::warn!(
                    target: "webhook_delivery",
                    subscription_id = %id,
                    consecutive_failures,
                    "Subscription disabled after consecutive failures"
                );
                self.cancel_pending(id, "subscription disabled").await;
            }
            Ok(false) => {}
            Err(err) => tracing::error!(
                target: "webhook_delivery",
                subscription_id = %id,
                error = %err,
                "Failed to disable subscription"
            ),
        }
    }

    async fn cancel_pending(&mut self, id: &SubscriptionId, reason: &'static str) {
        let (cancelled, kept): (Vec<TimedTask>, Vec<TimedTask>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|timed| &timed.task.job.subscription_id == id);
        self.heap = BinaryHeap::from(kept);

        if cancelled.is_empty() {
            return;
        }
        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %id,
            count = cancelled.len(),
            reason,
            "Pending retries cancelled"
        );
        for timed in cancelled {
            metric_inc("webhook.delivery.cancelled");
            self.core
                .finish(&timed.task, DeliveryStatus::Cancelled, Some(reason.to_string()))
                .await;
        }
    }

    /// Move due retries back onto the job queue.
    async fn release_due(&mut self) {
        let now = Instant::now();
        while self.heap.peek().map_or(false, |timed| timed.ready_at <= now) {
            let Some(timed) = self.heap.pop() else { break };
            let task = timed.task;

            if let Some(reason) = self.core.retry_blocker(&task).await {
                metric_inc("webhook.delivery.cancelled");
                self.core
                    .finish(&task, DeliveryStatus::Cancelled, Some(reason.to_string()))
                    .await;
                continue;
            }

            match self.core.job_tx.try_send(task) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(task)) => {
                    let ready_at = now + self.saturation_delay();
                    self.push(ready_at, task);
                }
                Err(mpsc::error::TrySendError::Closed(task)) => {
                    self.core
                        .finish(&task, DeliveryStatus::Cancelled, Some("dispatcher shut down".to_string()))
                        .await;
                }
            }
        }
    }

    fn push(&mut self, ready_at: Instant, task: Task) {
        self.seq += 1;
        self.heap.push(TimedTask {
            ready_at,
            seq: self.seq,
            task,
        });
    }

    fn saturation_delay(&self) -> Duration {
        self.core.config.saturation_delay.max(Duration::from_millis(1))
    }
}

async fn sleep_until_next(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn failure_message(outcome: &DeliveryOutcome) -> Option<String> {
    match outcome {
        DeliveryOutcome::Success { .. } => None,
        DeliveryOutcome::RetryableFailure(reason) | DeliveryOutcome::FatalFailure(reason) => {
            Some(reason.to_string())
        }
    }
}

fn validate_name(name: &str) -> Result<(), DispatchError> {
    if name.trim().is_empty() {
        return Err(DispatchError::Validation("name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<(), DispatchError> {
    let parsed = url::Url::parse(raw)
        .map_err(|err| DispatchError::Validation(format!("invalid url `{}`: {}", raw, err)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DispatchError::Validation(format!(
                "unsupported url scheme `{}`",
                other
            )))
        }
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(DispatchError::Validation(format!("url `{}` has no host", raw)));
    }
    Ok(())
}

/// Bounded map of delivery states, oldest key evicted first.
struct StatusBook {
    states: HashMap<IdempotencyKey, DeliveryState>,
    order: VecDeque<IdempotencyKey>,
    capacity: usize,
}

impl StatusBook {
    fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &IdempotencyKey) -> Option<DeliveryState> {
        self.states.get(key).cloned()
    }

    fn record(&mut self, key: &IdempotencyKey, state: DeliveryState) {
        if self.states.insert(key.clone(), state).is_none() {
            self.order.push_back(key.clone());
        }
        while self.states.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.states.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    seq: u64,
    task: Task,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
