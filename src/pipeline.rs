use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::dispatch::{EventDispatcher, HandlerRegistry};
use crate::error::{ProcessOutcome, RejectionReason, RetryAttempt};
use crate::idempotency::{
    IdempotencyConfig, IdempotencyCoordinator, IdempotencyStore, InMemoryIdempotencyStore,
};
use crate::observe::{ObservabilityCollector, ObservabilityConfig, SampleOutcome, TraceId};
use crate::origin::OriginPolicy;
use crate::retry::{DeadLetterSink, InMemoryDeadLetterSink, RetryOrchestrator, RetryPolicy};
use crate::signature::{verify_envelope, SignatureOptions};
use crate::types::{
    now_secs, EventType, IdempotencyKey, WebhookEnvelope, WebhookId, WebhookPayload,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_warn(message: &'static str) {
    tracing::warn!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_warn(_message: &'static str) {}

/// Everything the pipeline needs to know, in one injected value.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Shared secret for signature verification.
    pub shared_secret: Vec<u8>,

    /// Names of the signature and timestamp headers.
    pub signature: SignatureOptions,

    /// Freshness and allow-list rules.
    pub origin: OriginPolicy,

    /// Bodies larger than this are rejected before parsing.
    pub max_body_bytes: usize,

    /// How long a processed event's record shields it from reprocessing.
    /// Replays beyond this window legitimately run again.
    pub idempotency_ttl: Duration,

    pub idempotency: IdempotencyConfig,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,

    /// Downstream name the circuit breaker tracks handler calls under.
    pub downstream_service: String,

    /// Overall processing deadline per envelope, checked between retry
    /// attempts.
    pub overall_deadline: Option<Duration>,

    pub observability: ObservabilityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shared_secret: Vec::new(),
            signature: SignatureOptions::default(),
            origin: OriginPolicy::new().with_max_age(Duration::from_secs(300)),
            max_body_bytes: 1024 * 1024,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            idempotency: IdempotencyConfig::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            downstream_service: "event-handler".to_string(),
            overall_deadline: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Result of ingesting one envelope, returned to the transport layer.
#[derive(Debug)]
pub struct ProcessReport {
    pub webhook_id: WebhookId,
    pub trace_id: TraceId,
    pub outcome: ProcessOutcome,

    /// Attempt log from the retry loop; empty for rejections and joins.
    pub attempts: Vec<RetryAttempt>,
}

impl ProcessReport {
    pub fn was_duplicate(&self) -> bool {
        matches!(
            self.outcome,
            ProcessOutcome::Completed {
                was_duplicate: true,
                ..
            }
        )
    }
}

/// The full ingestion pipeline.
///
/// Stage order: signature → origin → decode → idempotency claim →
/// dispatch under retry and circuit breaking → commit. Each envelope is
/// processed on its caller's task; unrelated envelopes share no locks
/// beyond the idempotency store and breaker registry, both of which are
/// claim-based rather than pipeline-wide.
pub struct IngestPipeline {
    config: PipelineConfig,
    coordinator: IdempotencyCoordinator,
    orchestrator: RetryOrchestrator,
    dispatcher: EventDispatcher,
    observer: Arc<ObservabilityCollector>,
}

impl IngestPipeline {
    /// Build a pipeline with in-memory store and dead-letter sink.
    pub fn new(config: PipelineConfig, registry: HandlerRegistry) -> Self {
        let store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
        let dlq: Arc<dyn DeadLetterSink> = Arc::new(InMemoryDeadLetterSink::default());
        Self::with_components(config, registry, store, dlq)
    }

    /// Build a pipeline around caller-supplied store and sink.
    pub fn with_components(
        config: PipelineConfig,
        registry: HandlerRegistry,
        store: Arc<dyn IdempotencyStore>,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let coordinator = IdempotencyCoordinator::new(store, config.idempotency.clone());
        let orchestrator = RetryOrchestrator::new(breakers, dlq);
        let observer = Arc::new(ObservabilityCollector::new(config.observability.clone()));

        Self {
            config,
            coordinator,
            orchestrator,
            dispatcher: EventDispatcher::new(registry),
            observer,
        }
    }

    pub fn observer(&self) -> Arc<ObservabilityCollector> {
        self.observer.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.orchestrator.breakers()
    }

    pub fn dlq(&self) -> Arc<dyn DeadLetterSink> {
        self.orchestrator.dlq()
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        self.coordinator.store()
    }

    /// Ingest one envelope end to end.
    pub async fn ingest(&self, envelope: WebhookEnvelope) -> ProcessReport {
        let started = Instant::now();
        let trace_id = self.observer.start_trace(&envelope.webhook_id).await;
        let deadline = self.config.overall_deadline.map(|d| started + d);

        let stage = Instant::now();
        let signed = verify_envelope(&envelope, &self.config.shared_secret, &self.config.signature);
        self.observer
            .add_span(&trace_id, "signature", stage.elapsed())
            .await;
        let claimed_timestamp = match signed {
            Ok(signed) => signed.claimed_timestamp,
            Err(reason) => return self.reject(&envelope, trace_id, started, reason).await,
        };

        let stage = Instant::now();
        let origin = self
            .config
            .origin
            .validate(&envelope, claimed_timestamp, now_secs());
        self.observer
            .add_span(&trace_id, "origin", stage.elapsed())
            .await;
        if let Err(reason) = origin {
            return self.reject(&envelope, trace_id, started, reason).await;
        }

        let stage = Instant::now();
        let decoded = self.decode(&envelope);
        self.observer
            .add_span(&trace_id, "decode", stage.elapsed())
            .await;
        let (payload, event_type) = match decoded {
            Ok(decoded) => decoded,
            Err(reason) => return self.reject(&envelope, trace_id, started, reason).await,
        };

        if let Err(reason) = self.dispatcher.ensure_registered(&event_type) {
            return self.reject(&envelope, trace_id, started, reason).await;
        }

        // Key identity: the provider's message id when present, else this
        // delivery's id. Retried deliveries repeat the message id, so they
        // dedup; distinct events never share one.
        let message_id = payload
            .data
            .get("message_id")
            .and_then(|value| value.as_str())
            .unwrap_or(envelope.webhook_id.0.as_str());
        let key = IdempotencyKey::derive(event_type.as_str(), message_id, &payload.timestamp);

        let mut attempt_log: Vec<RetryAttempt> = Vec::new();
        let claim_started = Instant::now();
        let result = {
            let attempt_log = &mut attempt_log;
            let envelope = &envelope;
            let event_type = &event_type;
            let data = &payload.data;
            let trace_id = &trace_id;
            self.coordinator
                .process_once(&key, self.config.idempotency_ttl, move || async move {
                    let stage = Instant::now();
                    let run = self
                        .orchestrator
                        .run(
                            &self.config.downstream_service,
                            envelope,
                            &self.config.retry,
                            deadline,
                            || async move { self.dispatcher.dispatch(event_type, data).await },
                        )
                        .await;
                    self.observer
                        .add_span(trace_id, "dispatch", stage.elapsed())
                        .await;
                    *attempt_log = run.attempts;
                    match run.outcome {
                        Ok(outcome) => Ok(serde_json::to_value(&outcome)
                            .unwrap_or(serde_json::Value::Null)),
                        Err(failure) => Err(failure),
                    }
                })
                .await
        };

        self.observer
            .add_span(&trace_id, "idempotency", claim_started.elapsed())
            .await;
        self.observer.finish_trace(&trace_id).await;
        let latency = started.elapsed();

        match result {
            Ok(once) => {
                self.observer
                    .record_sample(event_type.as_str(), SampleOutcome::Success, latency)
                    .await;
                metric_inc("webhook.ingest.completed");
                ProcessReport {
                    webhook_id: envelope.webhook_id,
                    trace_id,
                    outcome: ProcessOutcome::Completed {
                        result: once.result,
                        was_duplicate: once.was_duplicate,
                    },
                    attempts: attempt_log,
                }
            }
            Err(failure) => {
                self.observer
                    .record_sample(event_type.as_str(), SampleOutcome::Failure, latency)
                    .await;
                metric_inc("webhook.ingest.failed");
                ProcessReport {
                    webhook_id: envelope.webhook_id,
                    trace_id,
                    outcome: ProcessOutcome::Failed {
                        reason: failure.to_string(),
                        sent_to_dlq: failure.sent_to_dlq,
                    },
                    attempts: attempt_log,
                }
            }
        }
    }

    fn decode(
        &self,
        envelope: &WebhookEnvelope,
    ) -> Result<(WebhookPayload, EventType), RejectionReason> {
        if envelope.raw_body.len() > self.config.max_body_bytes {
            return Err(RejectionReason::PayloadTooLarge {
                size: envelope.raw_body.len(),
                limit: self.config.max_body_bytes,
            });
        }

        if let Some(content_type) = envelope.header("Content-Type") {
            if !content_type
                .to_ascii_lowercase()
                .starts_with("application/json")
            {
                return Err(RejectionReason::UnsupportedContentType {
                    content_type: content_type.to_string(),
                });
            }
        }

        let payload: WebhookPayload = serde_json::from_slice(&envelope.raw_body)
            .map_err(|_| RejectionReason::MalformedPayload)?;
        let event_type = EventType::from(payload.kind.as_str());
        Ok((payload, event_type))
    }

    async fn reject(
        &self,
        envelope: &WebhookEnvelope,
        trace_id: TraceId,
        started: Instant,
        reason: RejectionReason,
    ) -> ProcessReport {
        self.observer.finish_trace(&trace_id).await;

        let event_type = if envelope.event_type.is_empty() {
            "unknown"
        } else {
            envelope.event_type.as_str()
        };
        self.observer
            .record_sample(event_type, SampleOutcome::Rejected, started.elapsed())
            .await;

        metric_inc("webhook.ingest.rejected");
        if reason.is_security_relevant() {
            trace_warn("webhook.ingest.security_rejection");
        }

        ProcessReport {
            webhook_id: envelope.webhook_id.clone(),
            trace_id,
            outcome: ProcessOutcome::Rejected(reason),
            attempts: Vec::new(),
        }
    }
}
