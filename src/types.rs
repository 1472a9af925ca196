use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Inbound webhook as handed over by the transport layer.
///
/// A `WebhookEnvelope` is immutable once constructed. Every downstream
/// stage reads it; none mutates it. The transport layer (not part of this
/// crate) is responsible for draining the request body and collecting
/// headers before building the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Identifier assigned at ingress, unique per physical delivery.
    pub webhook_id: WebhookId,

    /// Event type as claimed by the provider at ingress (e.g. a header).
    /// The authoritative type is re-read from the validated body.
    pub event_type: String,

    /// Unix seconds at which the envelope was accepted.
    pub received_at_secs: u64,

    /// Raw request body, opaque until validation has passed.
    pub raw_body: Vec<u8>,

    /// Request headers as received, original casing preserved.
    pub headers: Vec<(String, String)>,

    /// Peer network address, if the transport layer knows it.
    pub source_address: Option<IpAddr>,
}

impl WebhookEnvelope {
    /// Create a new envelope for a raw delivery.
    pub fn new(webhook_id: impl Into<String>, raw_body: impl Into<Vec<u8>>) -> Self {
        Self {
            webhook_id: WebhookId(webhook_id.into()),
            event_type: String::new(),
            received_at_secs: now_secs(),
            raw_body: raw_body.into(),
            headers: Vec::new(),
            source_address: None,
        }
    }

    /// Set the provider-claimed event type.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Append a single header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the peer address.
    pub fn with_source_address(mut self, address: IpAddr) -> Self {
        self.source_address = Some(address);
        self
    }

    /// Override the receipt timestamp (unix seconds).
    pub fn with_received_at_secs(mut self, secs: u64) -> Self {
        self.received_at_secs = secs;
        self
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| key.to_ascii_lowercase() == wanted)
            .map(|(_, value)| value.as_str())
    }
}

/// Body of a webhook after validation, deserialized from JSON.
///
/// The `timestamp` field is the provider's ISO-8601 string and is carried
/// opaquely; freshness is enforced on the signed header timestamp instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Provider event type, e.g. `"bounced"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Event-specific data handed to the resolved handler.
    pub data: serde_json::Value,

    /// Provider-side event timestamp, ISO-8601.
    pub timestamp: String,
}

/// Unique identifier for one physical webhook delivery.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of delivery IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(pub String);

/// Typed event kind resolved from the payload's `type` field.
///
/// The closed variants cover the provider's mail callbacks; `Other` is the
/// extension point for additional types registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Received,
    Bounced,
    Complained,
    Delivered,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Received => "received",
            EventType::Bounced => "bounced",
            EventType::Complained => "complained",
            EventType::Delivered => "delivered",
            EventType::Other(name) => name.as_str(),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "received" => EventType::Received,
            "bounced" => EventType::Bounced,
            "complained" => EventType::Complained,
            "delivered" => EventType::Delivered,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplication key for one logical event.
///
/// Derived, not assigned: two physically distinct events must never
/// collide, and retried deliveries of the same event must always agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Derive the key from an event's stable identity.
    ///
    /// Each part is length-prefixed before hashing so that no choice of
    /// event type, message id, or timestamp can produce the digest of a
    /// different triple.
    pub fn derive(event_type: &str, provider_message_id: &str, timestamp: &str) -> Self {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for part in [event_type, provider_message_id, timestamp] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }
}

/// Lifecycle status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

/// Record of one logical event's processing, kept in the idempotency store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub status: RecordStatus,
    /// Present iff `status` is `Completed`.
    pub result: Option<serde_json::Value>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl IdempotencyRecord {
    /// Fresh pending record claiming `key` for `ttl_ms` from now.
    pub fn pending(key: IdempotencyKey, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            key,
            status: RecordStatus::Pending,
            result: None,
            created_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Structured result returned by an event handler.
///
/// This is what the idempotency coordinator commits and what duplicate
/// deliveries observe instead of a second execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub processed: bool,
    pub summary: String,
}

impl HandlerOutcome {
    pub fn processed(summary: impl Into<String>) -> Self {
        Self {
            processed: true,
            summary: summary.into(),
        }
    }
}

/// Identifier returned by a dead-letter sink for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DlqMessageId(pub u64);

/// Dead-letter entry for an event that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: DlqMessageId,
    pub webhook_id: WebhookId,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub failure: String,
    pub created_at_secs: u64,
}

/// Unix seconds right now.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unix milliseconds right now.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
