use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{DeliveryOutcome, FailureReason, SigningError};
use crate::signing::{self, IDEMPOTENCY_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::{DeliveryJob, Subscription};

/// Performs a single delivery attempt.
///
/// Implementations must be stateless with respect to jobs: the dispatcher
/// calls `attempt` concurrently for independent jobs.
#[async_trait]
pub trait DeliveryExecutor: Send + Sync {
    async fn attempt(&self, job: &DeliveryJob, subscription: &Subscription, timeout: Duration) -> DeliveryOutcome;
}

/// A fully built outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Build the signed request for one attempt.
pub fn build_request(
    job: &DeliveryJob,
    subscription: &Subscription,
    timestamp: u64,
) -> Result<OutboundRequest, SigningError> {
    let body = job.body();
    let signature = signing::sign(&subscription.signature, timestamp, &body)?;

    let mut headers = vec![
        ("Content-Type", "application/json".to_string()),
        (TIMESTAMP_HEADER, timestamp.to_string()),
        (IDEMPOTENCY_HEADER, job.idempotency_key.0.clone()),
    ];
    if let Some(signature) = signature {
        headers.push((SIGNATURE_HEADER, signature));
    }

    Ok(OutboundRequest {
        url: subscription.url.clone(),
        headers,
        body,
    })
}

/// Delivers over HTTP with `reqwest`. Redirects are never followed.
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("webhook-notifier/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryExecutor for HttpExecutor {
    async fn attempt(&self, job: &DeliveryJob, subscription: &Subscription, timeout: Duration) -> DeliveryOutcome {
        let timestamp = Utc::now().timestamp().max(0) as u64;
        let request = match build_request(job, subscription, timestamp) {
            Ok(request) => request,
            Err(err) => return DeliveryOutcome::FatalFailure(err.into()),
        };

        let mut builder = self
            .client
            .post(&request.url)
            .timeout(timeout)
            .body(request.body);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => DeliveryOutcome::from_status(response.status().as_u16()),
            Err(err) => DeliveryOutcome::RetryableFailure(classify_error(&err)),
        }
    }
}

fn classify_error(err: &reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else if err.is_connect() {
        FailureReason::Connect { message: err.to_string() }
    } else {
        FailureReason::Network { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DomainEvent, TriggerType};

    fn job_for(subscription: &Subscription) -> DeliveryJob {
        let event = DomainEvent::new("evt_1", TriggerType::Conversion, serde_json::json!({"a": 1}));
        DeliveryJob::for_event(&event, subscription.id)
    }

    #[test]
    fn builds_hmac_signed_request() {
        let sub = Subscription::new("hook", "https://example.com/hook", TriggerType::Conversion)
            .with_hmac_secret("s3cr3t");
        let job = job_for(&sub);

        let request = build_request(&job, &sub, 1_700_000_000).unwrap();
        assert_eq!(request.url, "https://example.com/hook");
        assert_eq!(request.body, br#"{"a":1}"#.to_vec());
        assert_eq!(request.header("x-timestamp"), Some("1700000000"));
        assert_eq!(request.header("x-idempotency-key"), Some(job.idempotency_key.as_str()));
        assert_eq!(
            request.header("x-signature"),
            Some("8dbbbbf4523b10bbb793e74d854144c45acccc2d233667b1c06b805b6ded8a84")
        );
    }

    #[test]
    fn unsigned_request_has_no_signature_header() {
        let sub = Subscription::new("hook", "https://example.com/hook", TriggerType::Click);
        let request = build_request(&job_for(&sub), &sub, 1).unwrap();
        assert!(request.header(SIGNATURE_HEADER).is_none());
        assert!(request.header(IDEMPOTENCY_HEADER).is_some());
    }

    #[test]
    fn missing_secret_refuses_to_build() {
        let sub = Subscription::new("hook", "https://example.com/hook", TriggerType::Click)
            .with_jwt_secret("");
        assert!(build_request(&job_for(&sub), &sub, 1).is_err());
    }
}
