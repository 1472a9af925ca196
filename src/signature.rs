use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::RejectionReason;
use crate::types::WebhookEnvelope;

/// Borrowed view of an envelope's signed parts. Exists only during
/// validation.
#[derive(Debug, Clone, Copy)]
pub struct SignedPayload<'a> {
    pub signature: &'a str,
    pub claimed_timestamp: u64,
    pub body: &'a [u8],
}

/// Header names the validator reads from an envelope.
#[derive(Debug, Clone)]
pub struct SignatureOptions {
    pub signature_header: String,
    pub timestamp_header: String,
}

impl Default for SignatureOptions {
    fn default() -> Self {
        Self {
            signature_header: "X-Webhook-Signature".to_string(),
            timestamp_header: "X-Webhook-Timestamp".to_string(),
        }
    }
}

/// Compute the hex HMAC-SHA256 signature for a payload.
///
/// When a timestamp is supplied it is bound into the digest, so a replayed
/// body cannot be re-stamped without invalidating the signature.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
///
/// Malformed hex is simply a mismatch, never an error.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);

    mac.verify_slice(&signature).is_ok()
}

/// Extract and check the signed parts of an envelope.
///
/// Returns the parsed view on success so the origin validator can reuse
/// the claimed timestamp without re-parsing headers. Missing or malformed
/// headers reject the envelope; nothing here panics on provider input.
pub fn verify_envelope<'a>(
    envelope: &'a WebhookEnvelope,
    secret: &[u8],
    options: &SignatureOptions,
) -> Result<SignedPayload<'a>, RejectionReason> {
    let signature = envelope
        .header(&options.signature_header)
        .ok_or(RejectionReason::MissingSignature)?;
    let timestamp_str = envelope
        .header(&options.timestamp_header)
        .ok_or(RejectionReason::MissingTimestamp)?;
    let claimed_timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| RejectionReason::InvalidTimestamp)?;

    if !verify_signature(secret, &envelope.raw_body, Some(timestamp_str), signature) {
        return Err(RejectionReason::InvalidSignature);
    }

    Ok(SignedPayload {
        signature,
        claimed_timestamp,
        body: &envelope.raw_body,
    })
}
