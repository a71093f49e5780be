use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Weight given to the newest outcome in the rolling success rate.
pub const SUCCESS_RATE_WEIGHT: f64 = 0.1;

/// Domain event category a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Click,
    Conversion,
    Postback,
    Fraud,
    UserSignup,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Click => "click",
            TriggerType::Conversion => "conversion",
            TriggerType::Postback => "postback",
            TriggerType::Fraud => "fraud",
            TriggerType::UserSignup => "user_signup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "click" => Some(TriggerType::Click),
            "conversion" => Some(TriggerType::Conversion),
            "postback" => Some(TriggerType::Postback),
            "fraud" => Some(TriggerType::Fraud),
            "user_signup" => Some(TriggerType::UserSignup),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How outbound requests for a subscription are signed.
///
/// The secret travels inside the variant, so a signing mode can never exist
/// without one. Emptiness is checked by [`SignatureMode::validate`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SignatureMode {
    None,
    HmacSha256 { secret: String },
    Jwt { secret: String },
}

impl SignatureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMode::None => "none",
            SignatureMode::HmacSha256 { .. } => "hmac-sha256",
            SignatureMode::Jwt { .. } => "jwt",
        }
    }

    pub fn secret(&self) -> Option<&str> {
        match self {
            SignatureMode::None => None,
            SignatureMode::HmacSha256 { secret } | SignatureMode::Jwt { secret } => Some(secret),
        }
    }

    /// Rebuild a mode from its stored name and optional secret.
    pub fn from_parts(mode: &str, secret: Option<String>) -> Option<Self> {
        let secret = secret.unwrap_or_default();
        match mode {
            "none" => Some(SignatureMode::None),
            "hmac-sha256" | "hmac" => Some(SignatureMode::HmacSha256 { secret }),
            "jwt" => Some(SignatureMode::Jwt { secret }),
            _ => None,
        }
    }

    /// Fails when a signing mode carries an empty secret.
    pub fn validate(&self) -> Result<(), crate::error::SigningError> {
        match self.secret() {
            Some(secret) if secret.is_empty() => Err(crate::error::SigningError::MissingSecret {
                mode: self.as_str(),
            }),
            _ => Ok(()),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for SignatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secret() {
            Some(_) => write!(f, "{}(<redacted>)", self.as_str()),
            None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Error,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            "error" => Some(SubscriptionStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier assigned to a domain event by its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DlqEntryId(pub Uuid);

impl DlqEntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DlqEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DlqEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier for one (event, subscription) delivery.
///
/// Sent as `X-Idempotency-Key` on every attempt, including manual retries
/// from the dead-letter queue, so receivers can deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn derive(event_id: &EventId, subscription_id: &SubscriptionId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(event_id.0.as_bytes());
        hasher.update(b":");
        hasher.update(subscription_id.0.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A webhook registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    pub url: String,
    pub trigger: TriggerType,
    pub signature: SignatureMode,
    pub status: SubscriptionStatus,
    /// Rolling success rate in percent.
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub total_deliveries: u64,
    pub failed_deliveries: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Create an active, unsigned subscription with a fresh id and full health.
    pub fn new(name: impl Into<String>, url: impl Into<String>, trigger: TriggerType) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            name: name.into(),
            url: url.into(),
            trigger,
            signature: SignatureMode::None,
            status: SubscriptionStatus::Active,
            success_rate: 100.0,
            consecutive_failures: 0,
            total_deliveries: 0,
            failed_deliveries: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: SubscriptionId) -> Self {
        self.id = id;
        self
    }

    pub fn with_hmac_secret(mut self, secret: impl Into<String>) -> Self {
        self.signature = SignatureMode::HmacSha256 { secret: secret.into() };
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.signature = SignatureMode::Jwt { secret: secret.into() };
        self
    }

    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Fold one terminal delivery outcome into the health fields.
    pub fn apply_outcome(&mut self, success: bool, at: DateTime<Utc>) -> SubscriptionHealth {
        let sample = if success { 100.0 } else { 0.0 };
        self.success_rate =
            (self.success_rate * (1.0 - SUCCESS_RATE_WEIGHT) + sample * SUCCESS_RATE_WEIGHT)
                .clamp(0.0, 100.0);
        self.total_deliveries += 1;
        if success {
            self.consecutive_failures = 0;
            self.last_triggered_at = Some(at);
        } else {
            self.consecutive_failures += 1;
            self.failed_deliveries += 1;
        }
        self.updated_at = at;
        self.health()
    }

    pub fn health(&self) -> SubscriptionHealth {
        SubscriptionHealth {
            status: self.status,
            success_rate: self.success_rate,
            consecutive_failures: self.consecutive_failures,
            last_triggered_at: self.last_triggered_at,
        }
    }
}

/// Health snapshot returned after recording an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionHealth {
    pub status: SubscriptionStatus,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// Admin input for creating a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub name: String,
    pub url: String,
    pub trigger: TriggerType,
    pub signature: SignatureMode,
}

/// Admin edit. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub trigger: Option<TriggerType>,
    pub signature: Option<SignatureMode>,
    pub status: Option<SubscriptionStatus>,
}

/// Something that happened on the platform and may need to be announced.
///
/// The payload is delivered verbatim as the JSON request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: EventId,
    pub trigger: TriggerType,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(id: impl Into<String>, trigger: TriggerType, payload: serde_json::Value) -> Self {
        Self {
            id: EventId(id.into()),
            trigger,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Unit of work driven through attempts until it is delivered or dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub trigger: TriggerType,
    pub payload: serde_json::Value,
    pub idempotency_key: IdempotencyKey,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn for_event(event: &DomainEvent, subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            event_id: event.id.clone(),
            trigger: event.trigger,
            payload: event.payload.clone(),
            idempotency_key: IdempotencyKey::derive(&event.id, &subscription_id),
            attempt_count: 0,
            created_at: Utc::now(),
        }
    }

    /// A fresh job replaying a dead-letter entry under its original key.
    pub fn from_dlq_entry(entry: &DlqEntry) -> Self {
        Self {
            subscription_id: entry.subscription_id,
            event_id: entry.event_id.clone(),
            trigger: entry.trigger,
            payload: entry.payload.clone(),
            idempotency_key: entry.idempotency_key.clone(),
            attempt_count: 0,
            created_at: Utc::now(),
        }
    }

    /// JSON request body.
    pub fn body(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }
}

/// Why a job ended up in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Every scheduled attempt failed with a retryable error.
    RetryExhausted { last: crate::error::FailureReason },
    /// The receiver rejected the request deterministically.
    Rejected { reason: crate::error::FailureReason },
    /// The subscription cannot be signed; nothing was sent.
    Configuration { message: String },
    /// The job queue was full when the event fanned out.
    Backpressure,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::RetryExhausted { last } =>
                write!(f, "retries exhausted: {}", last),
            DeadLetterReason::Rejected { reason } =>
                write!(f, "rejected by receiver: {}", reason),
            DeadLetterReason::Configuration { message } =>
                write!(f, "configuration error: {}", message),
            DeadLetterReason::Backpressure =>
                write!(f, "dropped: delivery queue at capacity"),
        }
    }
}

/// Dead-letter queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: DlqEntryId,
    pub subscription_id: SubscriptionId,
    pub webhook_name: String,
    pub idempotency_key: IdempotencyKey,
    pub event_id: EventId,
    pub trigger: TriggerType,
    pub reason: DeadLetterReason,
    pub last_error: String,
    pub attempts: u32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(job: &DeliveryJob, webhook_name: impl Into<String>, reason: DeadLetterReason) -> Self {
        let now = Utc::now();
        Self {
            id: DlqEntryId::new(),
            subscription_id: job.subscription_id,
            webhook_name: webhook_name.into(),
            idempotency_key: job.idempotency_key.clone(),
            event_id: job.event_id.clone(),
            trigger: job.trigger,
            last_error: reason.to_string(),
            reason,
            attempts: job.attempt_count,
            payload: job.payload.clone(),
            created_at: now,
            last_attempt_at: now,
        }
    }

    /// Merge a renewed failure of the same delivery into this entry.
    pub fn absorb(&mut self, newer: &DlqEntry) {
        self.reason = newer.reason.clone();
        self.last_error = newer.last_error.clone();
        self.attempts = self.attempts.saturating_add(newer.attempts);
        self.payload = newer.payload.clone();
        self.webhook_name = newer.webhook_name.clone();
        self.last_attempt_at = newer.last_attempt_at;
    }
}

/// Delivery lifecycle status for one idempotency key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    Retrying,
    Delivered,
    DeadLettered,
    Cancelled,
    Rejected,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Queued | DeliveryStatus::Retrying)
    }
}

/// Delivery status details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryState {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate figures for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    pub total_deliveries: u64,
    pub dlq_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_per_pair() {
        let sub = SubscriptionId(Uuid::from_u128(1));
        let event = EventId("evt_1".to_string());

        let key = IdempotencyKey::derive(&event, &sub);
        assert_eq!(key, IdempotencyKey::derive(&event, &sub));
        assert_eq!(
            key.as_str(),
            "2d3c6713b7003b6365374855c3a7ed1525fb5f756ae5045a08b12d7b95245121"
        );

        let other = IdempotencyKey::derive(&EventId("evt_2".to_string()), &sub);
        assert_ne!(key, other);
    }

    #[test]
    fn success_rate_moves_as_moving_average() {
        let mut sub = Subscription::new("a", "https://example.com", TriggerType::Click);
        let health = sub.apply_outcome(false, Utc::now());
        assert!((health.success_rate - 90.0).abs() < 1e-9);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_triggered_at.is_none());

        let health = sub.apply_outcome(true, Utc::now());
        assert!((health.success_rate - 91.0).abs() < 1e-9);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_triggered_at.is_some());
        assert_eq!(sub.total_deliveries, 2);
        assert_eq!(sub.failed_deliveries, 1);
    }

    #[test]
    fn empty_secret_fails_validation() {
        assert!(SignatureMode::None.validate().is_ok());
        assert!(SignatureMode::HmacSha256 { secret: "x".into() }.validate().is_ok());
        assert!(SignatureMode::Jwt { secret: String::new() }.validate().is_err());
    }

    #[test]
    fn signature_mode_debug_redacts_secret() {
        let mode = SignatureMode::HmacSha256 { secret: "hunter2".into() };
        assert!(!format!("{:?}", mode).contains("hunter2"));
    }

    #[test]
    fn dlq_entry_absorbs_renewed_failure() {
        let event = DomainEvent::new("evt", TriggerType::Fraud, serde_json::json!({"a": 1}));
        let mut job = DeliveryJob::for_event(&event, SubscriptionId::new());
        job.attempt_count = 5;
        let mut entry = DlqEntry::new(&job, "hook", DeadLetterReason::Backpressure);

        job.attempt_count = 2;
        let newer = DlqEntry::new(
            &job,
            "hook",
            DeadLetterReason::Rejected {
                reason: crate::error::FailureReason::ClientError { status: 410 },
            },
        );
        let id = entry.id;
        entry.absorb(&newer);

        assert_eq!(entry.id, id);
        assert_eq!(entry.attempts, 7);
        assert!(entry.last_error.contains("410"));
    }
}
