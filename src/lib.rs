//! Webhook notifications for the affiliate admin console.
//!
//! Platform events (clicks, conversions, postbacks, fraud flags, signups) are
//! fanned out to every active subscription registered for that trigger and
//! delivered over HTTP in the background, so event emission never waits on a
//! receiver.
//!
//! ## Guarantees
//! - At-least-once delivery per (event, subscription), with a stable
//!   `X-Idempotency-Key` for receiver-side deduplication
//! - Fixed retry schedule, then a dead-letter queue with manual retry
//! - Bounded in-flight work: a worker pool plus a per-subscription lane limit
//! - Pausing or deleting a subscription cancels its pending retries
//! - Subscriptions failing repeatedly are moved to `error` automatically
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between events for the same subscription
//! - Survival of pending retries across restarts (the dead-letter queue and
//!   registry persist only if their stores do)

mod backoff;
mod config;
mod dispatcher;
mod dlq;
mod error;
mod executor;
mod registry;
mod signing;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use backoff::{BackoffPolicy, Verdict, DEFAULT_MAX_ATTEMPTS, DEFAULT_SCHEDULE};
pub use config::DispatcherConfig;
pub use dispatcher::{DispatchReceipt, Dispatcher};
pub use dlq::{DlqManager, DlqStore, InMemoryDlqStore};
pub use error::{
    ConfigError,
    DeliveryOutcome,
    DispatchError,
    FailureReason,
    SigningError,
    StoreError,
};
pub use executor::{build_request, DeliveryExecutor, HttpExecutor, OutboundRequest};
pub use registry::{InMemoryRegistry, SubscriptionRegistry};
pub use signing::{
    compute_signature,
    is_timestamp_fresh,
    parse_signature_headers,
    sign,
    verify_jwt_signature,
    verify_signature,
    verify_webhook_request,
    DeliveryClaims,
    ParsedSignature,
    VerificationError,
    IDEMPOTENCY_HEADER,
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use types::{
    DeadLetterReason,
    DeliveryJob,
    DeliveryState,
    DeliveryStatus,
    DlqEntry,
    DlqEntryId,
    DomainEvent,
    EventId,
    IdempotencyKey,
    NewSubscription,
    SignatureMode,
    Subscription,
    SubscriptionHealth,
    SubscriptionId,
    SubscriptionStatus,
    SubscriptionUpdate,
    TriggerType,
    WebhookStats,
    SUCCESS_RATE_WEIGHT,
};

#[cfg(feature = "postgres")]
pub use storage_postgres::{PostgresDlqStore, PostgresRegistry};
