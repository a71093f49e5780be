use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{
    Subscription, SubscriptionHealth, SubscriptionId, SubscriptionStatus, SubscriptionUpdate, TriggerType,
};

/// Read/write contract the dispatcher needs from the subscription store.
///
/// The registry is the only source of truth for who receives an event.
/// `record_outcome` must apply its update atomically per subscription.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn find_active_by_trigger(&self, trigger: TriggerType) -> Result<Vec<Subscription>, StoreError>;
    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError>;
    /// Fold a terminal delivery outcome into the subscription's health.
    /// Returns `None` if the subscription no longer exists.
    async fn record_outcome(&self, id: &SubscriptionId, success: bool) -> Result<Option<SubscriptionHealth>, StoreError>;
    /// Returns `false` if the subscription no longer exists.
    async fn set_status(&self, id: &SubscriptionId, status: SubscriptionStatus) -> Result<bool, StoreError>;
    async fn insert(&self, subscription: Subscription) -> Result<(), StoreError>;
    /// Apply the `Some` fields of an admin edit in one write. Fields left as
    /// `None`, including status and the health counters, keep whatever the
    /// store holds at write time. Returns `None` if the subscription does not
    /// exist.
    async fn update(&self, id: &SubscriptionId, update: SubscriptionUpdate) -> Result<Option<Subscription>, StoreError>;
    async fn remove(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError>;
    async fn list(&self) -> Result<Vec<Subscription>, StoreError>;
}

/// In-memory registry for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionRegistry for InMemoryRegistry {
    async fn find_active_by_trigger(&self, trigger: TriggerType) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.subscriptions.read().await;
        let mut matching: Vec<Subscription> = guard
            .values()
            .filter(|sub| sub.trigger == trigger && sub.is_active())
            .cloned()
            .collect();
        matching.sort_by_key(|sub| sub.created_at);
        Ok(matching)
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn record_outcome(&self, id: &SubscriptionId, success: bool) -> Result<Option<SubscriptionHealth>, StoreError> {
        let mut guard = self.subscriptions.write().await;
        Ok(guard
            .get_mut(id)
            .map(|sub| sub.apply_outcome(success, Utc::now())))
    }

    async fn set_status(&self, id: &SubscriptionId, status: SubscriptionStatus) -> Result<bool, StoreError> {
        let mut guard = self.subscriptions.write().await;
        match guard.get_mut(id) {
            Some(sub) => {
                sub.status = status;
                sub.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription);
        Ok(())
    }

    async fn update(&self, id: &SubscriptionId, update: SubscriptionUpdate) -> Result<Option<Subscription>, StoreError> {
        let mut guard = self.subscriptions.write().await;
        let Some(existing) = guard.get_mut(id) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            existing.name = name;
        }
        if let Some(url) = update.url {
            existing.url = url;
        }
        if let Some(trigger) = update.trigger {
            existing.trigger = trigger;
        }
        if let Some(signature) = update.signature {
            existing.signature = signature;
        }
        if let Some(status) = update.status {
            existing.status = status;
        }
        existing.updated_at = Utc::now();
        Ok(Some(existing.clone()))
    }

    async fn remove(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.write().await.remove(id))
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.subscriptions.read().await;
        let mut all: Vec<Subscription> = guard.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_only_active_matching_trigger() {
        let registry = InMemoryRegistry::new();
        let active = Subscription::new("a", "https://a.example", TriggerType::Conversion);
        let paused = Subscription::new("b", "https://b.example", TriggerType::Conversion)
            .with_status(SubscriptionStatus::Paused);
        let other = Subscription::new("c", "https://c.example", TriggerType::Click);
        registry.insert(active.clone()).await.unwrap();
        registry.insert(paused).await.unwrap();
        registry.insert(other).await.unwrap();

        let found = registry.find_active_by_trigger(TriggerType::Conversion).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);
    }

    #[tokio::test]
    async fn record_outcome_updates_health() {
        let registry = InMemoryRegistry::new();
        let sub = Subscription::new("a", "https://a.example", TriggerType::Fraud);
        registry.insert(sub.clone()).await.unwrap();

        registry.record_outcome(&sub.id, false).await.unwrap();
        let health = registry.record_outcome(&sub.id, false).await.unwrap().unwrap();
        assert_eq!(health.consecutive_failures, 2);
        assert!(health.success_rate < 100.0);

        let missing = registry.record_outcome(&SubscriptionId::new(), true).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_keeps_health_counters() {
        let registry = InMemoryRegistry::new();
        let sub = Subscription::new("a", "https://a.example", TriggerType::Click);
        registry.insert(sub.clone()).await.unwrap();
        registry.record_outcome(&sub.id, false).await.unwrap();

        let rename = SubscriptionUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        let updated = registry.update(&sub.id, rename).await.unwrap().unwrap();
        assert_eq!(updated.name, "renamed");

        let stored = registry.get(&sub.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.consecutive_failures, 1);
        assert_eq!(stored.failed_deliveries, 1);
    }

    #[tokio::test]
    async fn update_without_status_keeps_current_status() {
        let registry = InMemoryRegistry::new();
        let sub = Subscription::new("a", "https://a.example", TriggerType::Click);
        registry.insert(sub.clone()).await.unwrap();
        registry.set_status(&sub.id, SubscriptionStatus::Error).await.unwrap();

        let rename = SubscriptionUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        let updated = registry.update(&sub.id, rename).await.unwrap().unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Error);
        assert!(registry
            .update(&SubscriptionId::new(), SubscriptionUpdate::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn set_status_reports_missing_subscription() {
        let registry = InMemoryRegistry::new();
        let sub = Subscription::new("a", "https://a.example", TriggerType::Postback);
        registry.insert(sub.clone()).await.unwrap();

        assert!(registry.set_status(&sub.id, SubscriptionStatus::Paused).await.unwrap());
        assert!(!registry.set_status(&SubscriptionId::new(), SubscriptionStatus::Paused).await.unwrap());
        assert_eq!(
            registry.get(&sub.id).await.unwrap().unwrap().status,
            SubscriptionStatus::Paused
        );
    }
}
