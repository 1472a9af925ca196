use std::fmt;
use std::time::Duration;

/// Reasons an envelope is rejected at ingress, before any dispatch.
///
/// Ingress rejections are terminal: they are reported synchronously to the
/// caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// Signature header absent.
    MissingSignature,

    /// Timestamp header absent.
    MissingTimestamp,

    /// Timestamp header present but not a unix-seconds integer.
    InvalidTimestamp,

    /// Timestamp outside the configured freshness window.
    StaleTimestamp,

    /// Signature present but does not match the payload.
    InvalidSignature,

    /// Source address or credential matched no configured rule.
    OriginDenied,

    /// Body exceeds the configured size limit.
    PayloadTooLarge { size: usize, limit: usize },

    /// Content type is present and not JSON.
    UnsupportedContentType { content_type: String },

    /// Body is not valid JSON or lacks the expected shape.
    MalformedPayload,

    /// No handler is registered for the payload's event type.
    UnsupportedEventType { event_type: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::MissingSignature =>
                write!(f, "missing signature header"),
            RejectionReason::MissingTimestamp =>
                write!(f, "missing timestamp header"),
            RejectionReason::InvalidTimestamp =>
                write!(f, "timestamp header is not a unix timestamp"),
            RejectionReason::StaleTimestamp =>
                write!(f, "timestamp outside freshness window"),
            RejectionReason::InvalidSignature =>
                write!(f, "signature mismatch"),
            RejectionReason::OriginDenied =>
                write!(f, "origin matched no allow rule"),
            RejectionReason::PayloadTooLarge { size, limit } =>
                write!(f, "payload of {} bytes exceeds limit of {}", size, limit),
            RejectionReason::UnsupportedContentType { content_type } =>
                write!(f, "unsupported content type: {}", content_type),
            RejectionReason::MalformedPayload =>
                write!(f, "payload is not a valid webhook body"),
            RejectionReason::UnsupportedEventType { event_type } =>
                write!(f, "no handler registered for event type: {}", event_type),
        }
    }
}

impl std::error::Error for RejectionReason {}

impl RejectionReason {
    /// True for rejections worth flagging as security-relevant in logs.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            RejectionReason::InvalidSignature
                | RejectionReason::MissingSignature
                | RejectionReason::StaleTimestamp
                | RejectionReason::OriginDenied
        )
    }
}

/// Failure reported by an event handler or its downstream dependency.
///
/// Classification drives the retry orchestrator: transient failures are
/// retried per policy, permanent failures go straight to the dead-letter
/// sink without another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Downstream timeout or temporary unavailability.
    Transient(String),

    /// Handler-determined unrecoverable condition.
    Permanent(String),
}

impl ProcessingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessingError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProcessingError::Transient(msg) | ProcessingError::Permanent(msg) => msg,
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingError::Transient(msg) =>
                write!(f, "transient processing error: {}", msg),
            ProcessingError::Permanent(msg) =>
                write!(f, "permanent processing error: {}", msg),
        }
    }
}

impl std::error::Error for ProcessingError {}

/// Synthetic failure returned when a circuit breaker refuses a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenError {
    pub service: String,
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit open for service: {}", self.service)
    }
}

impl std::error::Error for CircuitOpenError {}

/// Terminal failure of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub kind: RetryFailureKind,
    /// Whether the envelope was handed to the dead-letter sink.
    pub sent_to_dlq: bool,
}

/// Why a retry loop gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailureKind {
    /// The breaker for the downstream service refused the call.
    CircuitOpen(CircuitOpenError),

    /// All allowed attempts failed with transient errors.
    Exhausted { last_error: ProcessingError },

    /// The handler reported an unrecoverable condition.
    Permanent { error: ProcessingError },

    /// The caller-supplied deadline elapsed between attempts.
    DeadlineExceeded,
}

impl fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RetryFailureKind::CircuitOpen(err) =>
                write!(f, "{}", err),
            RetryFailureKind::Exhausted { last_error } =>
                write!(f, "retries exhausted: {}", last_error),
            RetryFailureKind::Permanent { error } =>
                write!(f, "{}", error),
            RetryFailureKind::DeadlineExceeded =>
                write!(f, "deadline exceeded during retry"),
        }
    }
}

impl std::error::Error for RetryFailure {}

/// Outcome of one attempt inside a retry loop. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,

    /// Backoff scheduled after this attempt; zero for the last one.
    pub delay_applied: Duration,

    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(String),
}

/// Final outcome of ingesting one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The event was processed, now or by an earlier delivery.
    Completed {
        result: serde_json::Value,
        was_duplicate: bool,
    },

    /// Rejected at ingress; never dispatched, never retried.
    Rejected(RejectionReason),

    /// Processing failed after retry and circuit-breaking policy ran out.
    Failed {
        reason: String,
        sent_to_dlq: bool,
    },
}

impl ProcessOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessOutcome::Completed { .. })
    }
}
