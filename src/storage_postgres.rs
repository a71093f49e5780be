//! Postgres-backed subscription registry and dead-letter store.
//!
//! Uses the admin console's `webhooks` and `webhook_dlq` tables. Dead-letter
//! rows cascade away with their subscription.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use crate::dlq::DlqStore;
use crate::error::StoreError;
use crate::registry::SubscriptionRegistry;
use crate::types::{
    DlqEntry, DlqEntryId, EventId, IdempotencyKey, SignatureMode, Subscription, SubscriptionHealth,
    SubscriptionId, SubscriptionStatus, SubscriptionUpdate, TriggerType, SUCCESS_RATE_WEIGHT,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        signature_mode TEXT NOT NULL DEFAULT 'none',
        secret TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        success_rate DOUBLE PRECISION NOT NULL DEFAULT 100,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        total_deliveries BIGINT NOT NULL DEFAULT 0,
        failed_deliveries BIGINT NOT NULL DEFAULT 0,
        last_triggered TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS webhooks_trigger_status_idx ON webhooks (trigger_type, status);
    CREATE TABLE IF NOT EXISTS webhook_dlq (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
        webhook_name TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        event_id TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        reason JSONB NOT NULL,
        error TEXT NOT NULL,
        payload JSONB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
";

/// Create both tables if they are missing.
pub async fn ensure_schema(client: &Client) -> Result<(), StoreError> {
    client.batch_execute(SCHEMA).await?;
    Ok(())
}

pub struct PostgresRegistry {
    client: Arc<Client>,
}

impl PostgresRegistry {
    pub async fn new(client: Arc<Client>) -> Result<Self, StoreError> {
        ensure_schema(&client).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SubscriptionRegistry for PostgresRegistry {
    async fn find_active_by_trigger(&self, trigger: TriggerType) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM webhooks
                 WHERE trigger_type = $1 AND status = 'active'
                 ORDER BY created_at",
                &[&trigger.as_str()],
            )
            .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM webhooks WHERE id = $1", &[&id.0])
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn record_outcome(&self, id: &SubscriptionId, success: bool) -> Result<Option<SubscriptionHealth>, StoreError> {
        let sample: f64 = if success { 100.0 } else { 0.0 };
        let row = self
            .client
            .query_opt(
                "UPDATE webhooks SET
                    success_rate = LEAST(100, GREATEST(0, success_rate * (1 - $2::float8) + $3::float8 * $2::float8)),
                    total_deliveries = total_deliveries + 1,
                    failed_deliveries = failed_deliveries + CASE WHEN $4 THEN 0 ELSE 1 END,
                    consecutive_failures = CASE WHEN $4 THEN 0 ELSE consecutive_failures + 1 END,
                    last_triggered = CASE WHEN $4 THEN now() ELSE last_triggered END,
                    updated_at = now()
                 WHERE id = $1
                 RETURNING status, success_rate, consecutive_failures, last_triggered",
                &[&id.0, &SUCCESS_RATE_WEIGHT, &sample, &success],
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(SubscriptionHealth {
            status: parse_status(&row.try_get::<_, String>("status")?)?,
            success_rate: row.try_get("success_rate")?,
            consecutive_failures: row.try_get::<_, i32>("consecutive_failures")?.max(0) as u32,
            last_triggered_at: row.try_get("last_triggered")?,
        }))
    }

    async fn set_status(&self, id: &SubscriptionId, status: SubscriptionStatus) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE webhooks SET status = $2, updated_at = now() WHERE id = $1",
                &[&id.0, &status.as_str()],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn insert(&self, sub: Subscription) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhooks (
                    id, name, url, trigger_type, signature_mode, secret, status,
                    success_rate, consecutive_failures, total_deliveries, failed_deliveries,
                    last_triggered, created_at, updated_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                &[
                    &sub.id.0,
                    &sub.name,
                    &sub.url,
                    &sub.trigger.as_str(),
                    &sub.signature.as_str(),
                    &sub.signature.secret(),
                    &sub.status.as_str(),
                    &sub.success_rate,
                    &(sub.consecutive_failures as i32),
                    &(sub.total_deliveries as i64),
                    &(sub.failed_deliveries as i64),
                    &sub.last_triggered_at,
                    &sub.created_at,
                    &sub.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, id: &SubscriptionId, update: SubscriptionUpdate) -> Result<Option<Subscription>, StoreError> {
        let trigger = update.trigger.map(|trigger| trigger.as_str());
        let mode = update.signature.as_ref().map(|signature| signature.as_str());
        let secret = update.signature.as_ref().and_then(|signature| signature.secret());
        let status = update.status.map(|status| status.as_str());

        // NULL parameters keep the stored value; the secret follows the mode.
        let row = self
            .client
            .query_opt(
                "UPDATE webhooks SET
                    name = COALESCE($2, name),
                    url = COALESCE($3, url),
                    trigger_type = COALESCE($4, trigger_type),
                    signature_mode = COALESCE($5, signature_mode),
                    secret = CASE WHEN $5::TEXT IS NULL THEN secret ELSE $6 END,
                    status = COALESCE($7, status),
                    updated_at = now()
                 WHERE id = $1
                 RETURNING *",
                &[&id.0, &update.name, &update.url, &trigger, &mode, &secret, &status],
            )
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn remove(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let row = self
            .client
            .query_opt("DELETE FROM webhooks WHERE id = $1 RETURNING *", &[&id.0])
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM webhooks ORDER BY created_at DESC", &[])
            .await?;
        rows.iter().map(subscription_from_row).collect()
    }
}

pub struct PostgresDlqStore {
    client: Arc<Client>,
}

impl PostgresDlqStore {
    pub async fn new(client: Arc<Client>) -> Result<Self, StoreError> {
        ensure_schema(&client).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DlqStore for PostgresDlqStore {
    async fn upsert(&self, entry: DlqEntry) -> Result<DlqEntry, StoreError> {
        let reason = serde_json::to_value(&entry.reason)?;
        let row = self
            .client
            .query_one(
                "INSERT INTO webhook_dlq (
                    id, webhook_id, webhook_name, idempotency_key, event_id, trigger_type,
                    reason, error, payload, attempts, last_attempt, created_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (idempotency_key) DO UPDATE SET
                    webhook_name = EXCLUDED.webhook_name,
                    reason = EXCLUDED.reason,
                    error = EXCLUDED.error,
                    payload = EXCLUDED.payload,
                    attempts = webhook_dlq.attempts + EXCLUDED.attempts,
                    last_attempt = EXCLUDED.last_attempt
                 RETURNING *",
                &[
                    &entry.id.0,
                    &entry.subscription_id.0,
                    &entry.webhook_name,
                    &entry.idempotency_key.0,
                    &entry.event_id.0,
                    &entry.trigger.as_str(),
                    &reason,
                    &entry.last_error,
                    &entry.payload,
                    &(entry.attempts as i32),
                    &entry.last_attempt_at,
                    &entry.created_at,
                ],
            )
            .await?;
        dlq_entry_from_row(&row)
    }

    async fn get(&self, id: &DlqEntryId) -> Result<Option<DlqEntry>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM webhook_dlq WHERE id = $1", &[&id.0])
            .await?;
        row.as_ref().map(dlq_entry_from_row).transpose()
    }

    async fn remove(&self, id: &DlqEntryId) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM webhook_dlq WHERE id = $1", &[&id.0])
            .await?;
        Ok(deleted > 0)
    }

    async fn remove_by_key(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM webhook_dlq WHERE idempotency_key = $1", &[&key.0])
            .await?;
        Ok(deleted > 0)
    }

    async fn list(&self) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM webhook_dlq ORDER BY last_attempt DESC", &[])
            .await?;
        rows.iter().map(dlq_entry_from_row).collect()
    }

    async fn list_by_subscription(&self, id: &SubscriptionId) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM webhook_dlq WHERE webhook_id = $1 ORDER BY last_attempt DESC",
                &[&id.0],
            )
            .await?;
        rows.iter().map(dlq_entry_from_row).collect()
    }

    async fn purge_subscription(&self, id: &SubscriptionId) -> Result<usize, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM webhook_dlq WHERE webhook_id = $1", &[&id.0])
            .await?;
        Ok(deleted as usize)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM webhook_dlq", &[])
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as usize)
    }
}

fn parse_status(value: &str) -> Result<SubscriptionStatus, StoreError> {
    SubscriptionStatus::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown subscription status `{}`", value)))
}

fn parse_trigger(value: &str) -> Result<TriggerType, StoreError> {
    TriggerType::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown trigger type `{}`", value)))
}

fn subscription_from_row(row: &Row) -> Result<Subscription, StoreError> {
    let mode: String = row.try_get("signature_mode")?;
    let secret: Option<String> = row.try_get("secret")?;
    let signature = SignatureMode::from_parts(&mode, secret)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown signature mode `{}`", mode)))?;

    Ok(Subscription {
        id: SubscriptionId(row.try_get::<_, Uuid>("id")?),
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        trigger: parse_trigger(&row.try_get::<_, String>("trigger_type")?)?,
        signature,
        status: parse_status(&row.try_get::<_, String>("status")?)?,
        success_rate: row.try_get("success_rate")?,
        consecutive_failures: row.try_get::<_, i32>("consecutive_failures")?.max(0) as u32,
        total_deliveries: row.try_get::<_, i64>("total_deliveries")?.max(0) as u64,
        failed_deliveries: row.try_get::<_, i64>("failed_deliveries")?.max(0) as u64,
        last_triggered_at: row.try_get("last_triggered")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dlq_entry_from_row(row: &Row) -> Result<DlqEntry, StoreError> {
    let reason: serde_json::Value = row.try_get("reason")?;

    Ok(DlqEntry {
        id: DlqEntryId(row.try_get::<_, Uuid>("id")?),
        subscription_id: SubscriptionId(row.try_get::<_, Uuid>("webhook_id")?),
        webhook_name: row.try_get("webhook_name")?,
        idempotency_key: IdempotencyKey(row.try_get("idempotency_key")?),
        event_id: EventId(row.try_get("event_id")?),
        trigger: parse_trigger(&row.try_get::<_, String>("trigger_type")?)?,
        reason: serde_json::from_value(reason)?,
        last_error: row.try_get("error")?,
        attempts: row.try_get::<_, i32>("attempts")?.max(0) as u32,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        last_attempt_at: row.try_get("last_attempt")?,
    })
}
