use std::time::{SystemTime, UNIX_EPOCH};

use webhook_ingest::{
    compute_signature, verify_envelope, verify_signature, RejectionReason, SignatureOptions,
    WebhookEnvelope,
};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn signed_envelope(secret: &[u8], body: &[u8]) -> WebhookEnvelope {
    let timestamp = now_secs().to_string();
    let signature = compute_signature(secret, body, Some(&timestamp));
    WebhookEnvelope::new("wh-1", body)
        .with_header("X-Webhook-Signature", signature)
        .with_header("X-Webhook-Timestamp", timestamp)
}

#[test]
fn test_compute_verify_roundtrip() {
    let secret = b"shared-secret";
    let payload = br#"{"type":"bounced"}"#;
    let signature = compute_signature(secret, payload, Some("1700000000"));

    assert!(verify_signature(secret, payload, Some("1700000000"), &signature));
}

#[test]
fn test_payload_bit_flip_invalidates() {
    let secret = b"shared-secret";
    let payload = b"payload bytes".to_vec();
    let signature = compute_signature(secret, &payload, None);

    let mut mutated = payload.clone();
    mutated[0] ^= 0x01;
    assert!(!verify_signature(secret, &mutated, None, &signature));
}

#[test]
fn test_signature_bit_flip_invalidates() {
    let secret = b"shared-secret";
    let payload = b"payload bytes";
    let signature = compute_signature(secret, payload, None);

    // Flip one hex digit.
    let mut chars: Vec<char> = signature.chars().collect();
    chars[0] = if chars[0] == '0' { '1' } else { '0' };
    let tampered: String = chars.into_iter().collect();
    assert!(!verify_signature(secret, payload, None, &tampered));
}

#[test]
fn test_malformed_hex_is_just_invalid() {
    assert!(!verify_signature(b"secret", b"payload", None, "not hex at all"));
    assert!(!verify_signature(b"secret", b"payload", None, ""));
}

#[test]
fn test_wrong_secret_invalidates() {
    let payload = b"payload";
    let signature = compute_signature(b"right-secret", payload, None);
    assert!(!verify_signature(b"wrong-secret", payload, None, &signature));
}

#[test]
fn test_verify_envelope_accepts_valid() {
    let secret = b"shared-secret";
    let body = br#"{"type":"bounced","data":{},"timestamp":"2026-08-07T00:00:00Z"}"#;
    let envelope = signed_envelope(secret, body);

    let signed = verify_envelope(&envelope, secret, &SignatureOptions::default()).unwrap();
    assert_eq!(signed.body, body);
    assert!(signed.claimed_timestamp > 0);
}

#[test]
fn test_verify_envelope_missing_signature() {
    let envelope = WebhookEnvelope::new("wh-1", b"body".to_vec())
        .with_header("X-Webhook-Timestamp", now_secs().to_string());

    let result = verify_envelope(&envelope, b"secret", &SignatureOptions::default());
    assert_eq!(result.unwrap_err(), RejectionReason::MissingSignature);
}

#[test]
fn test_verify_envelope_missing_timestamp() {
    let envelope = WebhookEnvelope::new("wh-1", b"body".to_vec())
        .with_header("X-Webhook-Signature", "deadbeef");

    let result = verify_envelope(&envelope, b"secret", &SignatureOptions::default());
    assert_eq!(result.unwrap_err(), RejectionReason::MissingTimestamp);
}

#[test]
fn test_verify_envelope_non_numeric_timestamp() {
    let envelope = WebhookEnvelope::new("wh-1", b"body".to_vec())
        .with_header("X-Webhook-Signature", "deadbeef")
        .with_header("X-Webhook-Timestamp", "yesterday");

    let result = verify_envelope(&envelope, b"secret", &SignatureOptions::default());
    assert_eq!(result.unwrap_err(), RejectionReason::InvalidTimestamp);
}

#[test]
fn test_verify_envelope_tampered_body() {
    let secret = b"shared-secret";
    let mut envelope = signed_envelope(secret, b"original body");
    envelope.raw_body[0] ^= 0x01;

    let result = verify_envelope(&envelope, secret, &SignatureOptions::default());
    assert_eq!(result.unwrap_err(), RejectionReason::InvalidSignature);
}

#[test]
fn test_header_lookup_is_case_insensitive() {
    let secret = b"shared-secret";
    let body = b"body";
    let timestamp = now_secs().to_string();
    let signature = compute_signature(secret, body, Some(&timestamp));
    let envelope = WebhookEnvelope::new("wh-1", body.to_vec())
        .with_header("x-webhook-signature", signature)
        .with_header("X-WEBHOOK-TIMESTAMP", timestamp);

    assert!(verify_envelope(&envelope, secret, &SignatureOptions::default()).is_ok());
}
