//! Dead-letter queue for deliveries that will not be retried automatically.
//!
//! Entries are keyed by idempotency key: a delivery that fails again after a
//! manual retry updates its existing entry instead of adding a second one.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::dispatcher::{Dispatcher, JobOrigin};
use crate::error::{DispatchError, StoreError};
use crate::types::{DeadLetterReason, DeliveryJob, DlqEntry, DlqEntryId, IdempotencyKey, SubscriptionId};

#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Insert `entry`, or merge it into the entry holding the same idempotency key.
    async fn upsert(&self, entry: DlqEntry) -> Result<DlqEntry, StoreError>;
    async fn get(&self, id: &DlqEntryId) -> Result<Option<DlqEntry>, StoreError>;
    async fn remove(&self, id: &DlqEntryId) -> Result<bool, StoreError>;
    async fn remove_by_key(&self, key: &IdempotencyKey) -> Result<bool, StoreError>;
    /// Newest failures first.
    async fn list(&self) -> Result<Vec<DlqEntry>, StoreError>;
    async fn list_by_subscription(&self, id: &SubscriptionId) -> Result<Vec<DlqEntry>, StoreError>;
    /// Returns the number of entries removed.
    async fn purge_subscription(&self, id: &SubscriptionId) -> Result<usize, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

/// In-memory dead-letter store.
#[derive(Default)]
pub struct InMemoryDlqStore {
    entries: Mutex<VecDeque<DlqEntry>>,
    capacity: Option<usize>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the store; the entry with the oldest failure is evicted first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn upsert(&self, entry: DlqEntry) -> Result<DlqEntry, StoreError> {
        let mut guard = self.entries.lock().await;

        if let Some(position) = guard
            .iter()
            .position(|existing| existing.idempotency_key == entry.idempotency_key)
        {
            let mut existing = guard.remove(position).ok_or_else(|| {
                StoreError::Corrupt("dead-letter index out of range".to_string())
            })?;
            existing.absorb(&entry);
            guard.push_back(existing.clone());
            return Ok(existing);
        }

        guard.push_back(entry.clone());
        if let Some(capacity) = self.capacity {
            while guard.len() > capacity {
                guard.pop_front();
            }
        }
        Ok(entry)
    }

    async fn get(&self, id: &DlqEntryId) -> Result<Option<DlqEntry>, StoreError> {
        let guard = self.entries.lock().await;
        Ok(guard.iter().find(|entry| &entry.id == id).cloned())
    }

    async fn remove(&self, id: &DlqEntryId) -> Result<bool, StoreError> {
        let mut guard = self.entries.lock().await;
        let before = guard.len();
        guard.retain(|entry| &entry.id != id);
        Ok(guard.len() != before)
    }

    async fn remove_by_key(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let mut guard = self.entries.lock().await;
        let before = guard.len();
        guard.retain(|entry| &entry.idempotency_key != key);
        Ok(guard.len() != before)
    }

    async fn list(&self) -> Result<Vec<DlqEntry>, StoreError> {
        let guard = self.entries.lock().await;
        Ok(guard.iter().rev().cloned().collect())
    }

    async fn list_by_subscription(&self, id: &SubscriptionId) -> Result<Vec<DlqEntry>, StoreError> {
        let guard = self.entries.lock().await;
        Ok(guard
            .iter()
            .rev()
            .filter(|entry| &entry.subscription_id == id)
            .cloned()
            .collect())
    }

    async fn purge_subscription(&self, id: &SubscriptionId) -> Result<usize, StoreError> {
        let mut guard = self.entries.lock().await;
        let before = guard.len();
        guard.retain(|entry| &entry.subscription_id != id);
        Ok(before - guard.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().await.len())
    }
}

/// Admin-facing view of the dead-letter queue.
///
/// Manual retry and delete work regardless of the subscription's status.
#[derive(Clone)]
pub struct DlqManager {
    dispatcher: Dispatcher,
}

impl DlqManager {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Persist a failed job, merging with any entry for the same key.
    pub async fn enqueue(&self, job: &DeliveryJob, reason: DeadLetterReason) -> Result<DlqEntry, DispatchError> {
        let webhook_name = match self.dispatcher.registry().get(&job.subscription_id).await? {
            Some(sub) => sub.name,
            None => job.subscription_id.to_string(),
        };
        let entry = self
            .dispatcher
            .dlq_store()
            .upsert(DlqEntry::new(job, webhook_name, reason))
            .await?;
        Ok(entry)
    }

    /// Re-submit an entry as a fresh job under its original idempotency key.
    ///
    /// The entry stays in place until the delivery succeeds, and is updated
    /// in place if the delivery fails again.
    pub async fn retry(&self, id: &DlqEntryId) -> Result<IdempotencyKey, DispatchError> {
        let entry = self
            .dispatcher
            .dlq_store()
            .get(id)
            .await?
            .ok_or(DispatchError::DlqEntryNotFound(*id))?;

        let subscription = self
            .dispatcher
            .registry()
            .get(&entry.subscription_id)
            .await?
            .ok_or(DispatchError::SubscriptionNotFound(entry.subscription_id))?;
        subscription.signature.validate()?;

        let job = DeliveryJob::from_dlq_entry(&entry);
        let key = job.idempotency_key.clone();
        self.dispatcher.submit(job, subscription, JobOrigin::Manual).await?;

        tracing::info!(
            target: "webhook_delivery",
            dlq_entry_id = %entry.id,
            subscription_id = %entry.subscription_id,
            idempotency_key = %key,
            "Manual retry of dead-lettered delivery queued"
        );
        Ok(key)
    }

    /// Retry every entry of one subscription. Returns how many were queued.
    pub async fn retry_all_for_subscription(&self, id: &SubscriptionId) -> Result<usize, DispatchError> {
        let entries = self.dispatcher.dlq_store().list_by_subscription(id).await?;
        let mut queued = 0usize;
        for entry in entries {
            match self.retry(&entry.id).await {
                Ok(_) => queued += 1,
                Err(DispatchError::AlreadyInFlight(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(queued)
    }

    /// Permanently drop an entry.
    pub async fn delete(&self, id: &DlqEntryId) -> Result<(), DispatchError> {
        if self.dispatcher.dlq_store().remove(id).await? {
            Ok(())
        } else {
            Err(DispatchError::DlqEntryNotFound(*id))
        }
    }

    pub async fn get(&self, id: &DlqEntryId) -> Result<Option<DlqEntry>, DispatchError> {
        Ok(self.dispatcher.dlq_store().get(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<DlqEntry>, DispatchError> {
        Ok(self.dispatcher.dlq_store().list().await?)
    }

    pub async fn list_by_subscription(&self, id: &SubscriptionId) -> Result<Vec<DlqEntry>, DispatchError> {
        Ok(self.dispatcher.dlq_store().list_by_subscription(id).await?)
    }

    pub async fn depth(&self) -> Result<usize, DispatchError> {
        Ok(self.dispatcher.dlq_store().count().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::types::{DomainEvent, TriggerType};

    fn job(event_id: &str, sub: SubscriptionId, attempts: u32) -> DeliveryJob {
        let event = DomainEvent::new(event_id, TriggerType::Postback, serde_json::json!({"e": event_id}));
        let mut job = DeliveryJob::for_event(&event, sub);
        job.attempt_count = attempts;
        job
    }

    fn exhausted() -> DeadLetterReason {
        DeadLetterReason::RetryExhausted {
            last: FailureReason::ServerError { status: 502 },
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_key() {
        let store = InMemoryDlqStore::new();
        let sub = SubscriptionId::new();

        let first = store.upsert(DlqEntry::new(&job("e1", sub, 5), "hook", exhausted())).await.unwrap();
        let second = store.upsert(DlqEntry::new(&job("e1", sub, 5), "hook", exhausted())).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 10);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_that_subscription() {
        let store = InMemoryDlqStore::new();
        let doomed = SubscriptionId::new();
        let kept = SubscriptionId::new();
        store.upsert(DlqEntry::new(&job("e1", doomed, 1), "a", exhausted())).await.unwrap();
        store.upsert(DlqEntry::new(&job("e2", doomed, 1), "a", exhausted())).await.unwrap();
        store.upsert(DlqEntry::new(&job("e3", kept, 1), "b", exhausted())).await.unwrap();

        assert_eq!(store.purge_subscription(&doomed).await.unwrap(), 2);
        assert!(store.list_by_subscription(&doomed).await.unwrap().is_empty());
        assert_eq!(store.list_by_subscription(&kept).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = InMemoryDlqStore::with_capacity(2);
        let sub = SubscriptionId::new();
        for id in ["e1", "e2", "e3"] {
            store.upsert(DlqEntry::new(&job(id, sub, 1), "a", exhausted())).await.unwrap();
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].event_id.0, "e3");
        assert_eq!(listed[1].event_id.0, "e2");
    }

    #[tokio::test]
    async fn remove_by_key_clears_entry() {
        let store = InMemoryDlqStore::new();
        let j = job("e1", SubscriptionId::new(), 2);
        store.upsert(DlqEntry::new(&j, "a", DeadLetterReason::Backpressure)).await.unwrap();

        assert!(store.remove_by_key(&j.idempotency_key).await.unwrap());
        assert!(!store.remove_by_key(&j.idempotency_key).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
