//! A single-process webhook ingestion engine.
//!
//! This crate provides the **receiving half** of webhook reliability:
//! it accepts inbound event notifications from an upstream provider,
//! authenticates and validates them, and processes each one
//! effectively-once despite retried and concurrent deliveries.
//!
//! ## Guarantees
//! - Signature and origin validation before any processing
//! - At-most-once successful handler execution per idempotency key
//! - Bounded retries with exponential backoff and jitter
//! - Failure isolation per downstream service via circuit breaking
//! - Every terminal outcome traced and measured
//!
//! ## Non-Guarantees
//! - HTTP transport (listener, TLS, routing) — bring your own
//! - Durability of in-memory stores across restarts
//! - Business semantics past handler hand-off
//!
//! The pipeline runs one task per delivery; the only cross-task state is
//! the idempotency store and the circuit breaker registry, both injected
//! and claim-based rather than pipeline-wide locks.

mod breaker;
mod dispatch;
mod error;
mod idempotency;
mod observe;
mod origin;
mod pipeline;
mod retry;
mod signature;
mod types;

#[cfg(feature = "redis")]
mod store_redis;

pub use breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use dispatch::{EventDispatcher, EventHandler, HandlerRegistry};
pub use error::{
    AttemptOutcome,
    CircuitOpenError,
    ProcessOutcome,
    ProcessingError,
    RejectionReason,
    RetryAttempt,
    RetryFailure,
    RetryFailureKind,
};
pub use idempotency::{
    IdempotencyConfig, IdempotencyCoordinator, IdempotencyStore, InMemoryIdempotencyStore,
    ProcessOnce,
};
pub use observe::{
    Alert, LatencyStats, MetricSample, ObservabilityCollector, ObservabilityConfig,
    OutcomeCounters, SampleOutcome, Span, TraceId, TraceRecord,
};
pub use origin::OriginPolicy;
pub use pipeline::{IngestPipeline, PipelineConfig, ProcessReport};
pub use retry::{
    DeadLetterSink, InMemoryDeadLetterSink, RetryOrchestrator, RetryPolicy, RetryRun,
};
pub use signature::{
    compute_signature, verify_envelope, verify_signature, SignatureOptions, SignedPayload,
};
pub use types::{
    DlqEntry, DlqMessageId, EventType, HandlerOutcome, IdempotencyKey, IdempotencyRecord,
    RecordStatus, WebhookEnvelope, WebhookId, WebhookPayload,
};

#[cfg(feature = "redis")]
pub use store_redis::RedisIdempotencyStore;
