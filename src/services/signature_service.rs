//! Webhook authenticity checks.
//!
//! Three checks live here, all pure:
//! - `verify`: a two-part signed token `signature.payload` (Meta `signed_request`),
//!   HMAC-SHA256 over the payload segment.
//! - `verify_body_signature`: the `X-Hub-Signature-256: sha256=<hex>` header on
//!   webhook POST deliveries.
//! - `verify_handshake`: the GET subscription challenge.

use base64::{
    alphabet,
    engine::{general_purpose::GeneralPurpose, DecodePaddingMode, GeneralPurposeConfig},
    Engine,
};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::VerificationError;

type HmacSha256 = Hmac<Sha256>;

/// base64url that accepts both padded and unpadded input
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Verify a `signature.payload` token and return the decoded JSON payload.
///
/// Both segments are base64url. Segment count is checked before any decoding,
/// and the comparison runs through `Mac::verify_slice`, which is constant time
/// and rejects length mismatches.
pub fn verify(raw: &str, app_secret: &str) -> Result<Value, VerificationError> {
    let segments: Vec<&str> = raw.trim().split('.').collect();
    let [signature_segment, payload_segment] = segments.as_slice() else {
        return Err(VerificationError::MalformedToken);
    };
    if signature_segment.is_empty() || payload_segment.is_empty() {
        return Err(VerificationError::MalformedToken);
    }

    let signature = URL_SAFE_LENIENT
        .decode(signature_segment)
        .map_err(|_| VerificationError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .map_err(|_| VerificationError::InvalidSignature)?;
    mac.update(payload_segment.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| VerificationError::InvalidSignature)?;

    let decoded = URL_SAFE_LENIENT
        .decode(payload_segment)
        .map_err(|e| VerificationError::InvalidPayload(format!("payload is not base64url: {e}")))?;

    let payload: Value = serde_json::from_slice(&decoded)
        .map_err(|e| VerificationError::InvalidPayload(e.to_string()))?;

    if !payload.is_object() {
        return Err(VerificationError::InvalidPayload(
            "payload must be a JSON object".to_string(),
        ));
    }

    Ok(payload)
}

/// Build a signed token for `payload`. Counterpart of [`verify`].
pub fn sign(payload: &Value, app_secret: &str) -> String {
    let payload_segment = URL_SAFE_LENIENT.encode(payload.to_string());
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload_segment.as_bytes());
    let signature_segment = URL_SAFE_LENIENT.encode(mac.finalize().into_bytes());
    format!("{signature_segment}.{payload_segment}")
}

/// Verify the `X-Hub-Signature-256` header over the raw request body
pub fn verify_body_signature(
    body: &[u8],
    signature_header: &str,
    app_secret: &str,
) -> Result<(), VerificationError> {
    let hex_sig = signature_header
        .trim()
        .strip_prefix("sha256=")
        .ok_or(VerificationError::MalformedToken)?;

    let expected = hex::decode(hex_sig).map_err(|_| VerificationError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .map_err(|_| VerificationError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| VerificationError::InvalidSignature)
}

/// Compute the `X-Hub-Signature-256` header value for a body
pub fn body_signature_header(body: &[u8], app_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Outcome of the GET subscription handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Echo this challenge verbatim with 200
    Accept(String),
    Forbidden,
}

/// Accept only `mode == "subscribe"` with an exactly matching token.
/// The challenge is returned untouched.
pub fn verify_handshake(
    mode: Option<&str>,
    verify_token: Option<&str>,
    challenge: Option<&str>,
    expected_token: &str,
) -> HandshakeOutcome {
    if expected_token.is_empty() || mode != Some("subscribe") {
        return HandshakeOutcome::Forbidden;
    }

    let token_matches = verify_token.is_some_and(|t| constant_time_eq(t.as_bytes(), expected_token.as_bytes()));

    match (token_matches, challenge) {
        (true, Some(challenge)) => HandshakeOutcome::Accept(challenge.to_string()),
        _ => HandshakeOutcome::Forbidden,
    }
}

/// Length-checked constant-time byte comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
