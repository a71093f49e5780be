use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SigningError;
use crate::types::SignatureMode;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Claims carried by a `jwt` signature.
///
/// `body_sha256` binds the token to one specific request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryClaims {
    pub iat: u64,
    pub body_sha256: String,
}

/// Compute the `X-Signature` value for a request body.
///
/// Returns `Ok(None)` when the subscription is unsigned.
pub fn sign(mode: &SignatureMode, timestamp: u64, body: &[u8]) -> Result<Option<String>, SigningError> {
    mode.validate()?;
    match mode {
        SignatureMode::None => Ok(None),
        SignatureMode::HmacSha256 { secret } => {
            compute_signature(secret.as_bytes(), timestamp, body).map(Some)
        }
        SignatureMode::Jwt { secret } => sign_jwt(secret.as_bytes(), timestamp, body).map(Some),
    }
}

/// `hex(HMAC-SHA256(secret, "{timestamp}.{body}"))`.
pub fn compute_signature(secret: &[u8], timestamp: u64, payload: &[u8]) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SigningError::Token(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn sign_jwt(secret: &[u8], timestamp: u64, body: &[u8]) -> Result<String, SigningError> {
    let claims = DeliveryClaims {
        iat: timestamp,
        body_sha256: hex::encode(Sha256::digest(body)),
    };
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| SigningError::Token(e.to_string()))
}

/// Verify an HMAC signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}

/// Verify a `jwt` signature and that it was issued for this exact body.
pub fn verify_jwt_signature(secret: &[u8], payload: &[u8], token: &str) -> Option<DeliveryClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<DeliveryClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &validation,
    )
    .ok()?;

    if data.claims.body_sha256 == hex::encode(Sha256::digest(payload)) {
        Some(data.claims)
    } else {
        None
    }
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Pick the delivery headers out of a header list, ignoring case.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            parsed.timestamp = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(IDEMPOTENCY_HEADER) {
            parsed.idempotency_key = Some(value.to_string());
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp is not a unix time")]
    InvalidTimestamp,
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
}

/// Verify an incoming HMAC-signed webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, &timestamp_str, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
