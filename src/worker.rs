use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryOutcome, FailureReason};
use crate::executor::DeliveryExecutor;
use crate::registry::SubscriptionRegistry;
use crate::telemetry::{metric_inc, metric_inc_subscription};
use crate::types::{DeliveryJob, Subscription, SubscriptionId};

/// Who asked for a delivery.
///
/// Manual retries from the dead-letter queue ignore the subscription's status;
/// automatic deliveries only run while it is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOrigin {
    Automatic,
    Manual,
}

/// A unit of work consumed by workers.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub job: DeliveryJob,
    /// Last known state of the subscription; refreshed before every attempt.
    pub subscription: Subscription,
    pub origin: JobOrigin,
}

#[derive(Debug)]
pub(crate) enum WorkerReport {
    Attempted { task: Task, outcome: DeliveryOutcome },
    /// The subscription's lane was full; no attempt was made.
    Deferred(Task),
    Cancelled { task: Task, reason: &'static str },
}

#[derive(Debug)]
pub(crate) enum SchedulerMsg {
    Report(WorkerReport),
    /// Drop every pending retry for a subscription.
    CancelSubscription(SubscriptionId),
}

/// Shared, read-mostly context for all workers.
pub(crate) struct WorkerContext {
    pub registry: Arc<dyn SubscriptionRegistry>,
    pub executor: Arc<dyn DeliveryExecutor>,

    /// Per-subscription concurrency limiters.
    pub lanes: RwLock<HashMap<SubscriptionId, Arc<Semaphore>>>,
    pub lane_limit: usize,

    pub attempt_timeout: Duration,

    /// Reports from workers to the scheduler.
    pub report_tx: mpsc::UnboundedSender<SchedulerMsg>,

    pub shutdown: CancellationToken,
}

impl WorkerContext {
    pub async fn lane(&self, id: &SubscriptionId) -> Arc<Semaphore> {
        if let Some(lane) = self.lanes.read().await.get(id) {
            return lane.clone();
        }
        let mut guard = self.lanes.write().await;
        guard
            .entry(*id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.lane_limit)))
            .clone()
    }

    pub async fn drop_lane(&self, id: &SubscriptionId) {
        self.lanes.write().await.remove(id);
    }
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls tasks from the shared queue
/// - Re-reads the subscription and honours pauses
/// - Enforces the per-subscription lane limit
/// - Runs exactly one attempt and reports it to the scheduler
/// - Never holds a permit during backoff
pub(crate) async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => None,
                task = guard.recv() => task,
            }
        };

        let Some(task) = task else { break };

        let Some(report) = process_task(task, &ctx).await else { break };
        if ctx.report_tx.send(SchedulerMsg::Report(report)).is_err() {
            break;
        }
    }
}

/// Process a single delivery attempt. Returns `None` on shutdown.
async fn process_task(mut task: Task, ctx: &WorkerContext) -> Option<WorkerReport> {
    let subscription_id = task.job.subscription_id;

    let subscription = match ctx.registry.get(&subscription_id).await {
        Ok(Some(sub)) => sub,
        Ok(None) => {
            return Some(WorkerReport::Cancelled {
                task,
                reason: "subscription deleted",
            })
        }
        Err(err) => {
            tracing::warn!(
                target: "webhook_delivery",
                subscription_id = %subscription_id,
                error = %err,
                "Registry unavailable, attempting with last known subscription"
            );
            task.subscription.clone()
        }
    };

    if task.origin == JobOrigin::Automatic && !subscription.is_active() {
        return Some(WorkerReport::Cancelled {
            task,
            reason: "subscription not active",
        });
    }

    let lane = ctx.lane(&subscription_id).await;
    let permit = match lane.try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            metric_inc("webhook.delivery.deferred");
            return Some(WorkerReport::Deferred(task));
        }
    };

    let attempt = ctx.executor.attempt(&task.job, &subscription, ctx.attempt_timeout);
    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => return None,
        result = tokio::time::timeout(ctx.attempt_timeout, attempt) => {
            result.unwrap_or(DeliveryOutcome::RetryableFailure(FailureReason::Timeout))
        }
    };

    // Release the lane before the scheduler decides on backoff.
    drop(permit);

    task.job.attempt_count += 1;
    task.subscription = subscription;

    match &outcome {
        DeliveryOutcome::Success { .. } => {
            metric_inc("webhook.attempt.success");
        }
        DeliveryOutcome::RetryableFailure(_) | DeliveryOutcome::FatalFailure(_) => {
            metric_inc("webhook.attempt.failure");
            metric_inc_subscription("webhook.attempt.failure.subscription", &subscription_id);
        }
    }

    tracing::debug!(
        target: "webhook_delivery",
        subscription_id = %subscription_id,
        idempotency_key = %task.job.idempotency_key,
        attempt = task.job.attempt_count,
        outcome = ?outcome,
        "Delivery attempt finished"
    );

    Some(WorkerReport::Attempted { task, outcome })
}
