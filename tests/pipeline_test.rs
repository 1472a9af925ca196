use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use webhook_ingest::{
    compute_signature, CircuitBreakerConfig, DeadLetterSink, EventHandler, EventType,
    HandlerOutcome, HandlerRegistry, IdempotencyStore, InMemoryDeadLetterSink,
    InMemoryIdempotencyStore, IngestPipeline, PipelineConfig, ProcessOutcome, ProcessingError,
    RejectionReason, RetryPolicy, WebhookEnvelope,
};

const SECRET: &[u8] = b"shared-secret";

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn signed_envelope(webhook_id: &str, body: &str) -> WebhookEnvelope {
    let timestamp = now_secs().to_string();
    let signature = compute_signature(SECRET, body.as_bytes(), Some(&timestamp));
    WebhookEnvelope::new(webhook_id, body.as_bytes().to_vec())
        .with_event_type("bounced")
        .with_header("X-Webhook-Signature", signature)
        .with_header("X-Webhook-Timestamp", timestamp)
        .with_header("Content-Type", "application/json")
}

fn bounce_body(message_id: &str) -> String {
    format!(
        r#"{{"type":"bounced","data":{{"message_id":"{}","recipient":"user@example.com"}},"timestamp":"2026-08-07T00:00:00Z"}}"#,
        message_id
    )
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        shared_secret: SECRET.to_vec(),
        retry: RetryPolicy::default()
            .with_delays(Duration::from_millis(5), Duration::from_millis(50))
            .with_jitter(false),
        downstream_service: "email-processor".to_string(),
        ..Default::default()
    }
}

struct CountingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _data: &serde_json::Value) -> Result<HandlerOutcome, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutcome::processed("bounce recorded"))
    }
}

struct FailingHandler {
    calls: Arc<AtomicU32>,
    error: ProcessingError,
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _data: &serde_json::Value) -> Result<HandlerOutcome, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

fn counting_pipeline(config: PipelineConfig) -> (IngestPipeline, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new().with_handler(
        EventType::Bounced,
        Arc::new(CountingHandler {
            calls: calls.clone(),
        }),
    );
    (IngestPipeline::new(config, registry), calls)
}

#[tokio::test]
async fn test_first_delivery_dispatches_once() {
    let (pipeline, calls) = counting_pipeline(test_config());
    let report = pipeline
        .ingest(signed_envelope("wh-1", &bounce_body("msg-1")))
        .await;

    match &report.outcome {
        ProcessOutcome::Completed {
            result,
            was_duplicate,
        } => {
            assert!(!was_duplicate);
            assert_eq!(result["processed"], serde_json::json!(true));
            assert_eq!(result["summary"], serde_json::json!("bounce recorded"));
        }
        other => panic!("expected completion, got {:?}", other),
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let trace = pipeline.observer().trace(&report.trace_id).await.unwrap();
    assert!(!trace.spans.is_empty());
    assert!(trace.spans.iter().any(|span| span.name == "dispatch"));

    let counters = pipeline.observer().counters("bounced").await;
    assert_eq!(counters.success, 1);
    assert_eq!(counters.failure, 0);
}

#[tokio::test]
async fn test_duplicate_delivery_joins_original_result() {
    let (pipeline, calls) = counting_pipeline(test_config());
    let body = bounce_body("msg-1");

    let first = pipeline.ingest(signed_envelope("wh-1", &body)).await;
    // Same logical event, retried by the provider under a new delivery id.
    let second = pipeline.ingest(signed_envelope("wh-2", &body)).await;

    assert!(!first.was_duplicate());
    assert!(second.was_duplicate());

    let (first_result, second_result) = match (&first.outcome, &second.outcome) {
        (
            ProcessOutcome::Completed { result: a, .. },
            ProcessOutcome::Completed { result: b, .. },
        ) => (a, b),
        other => panic!("expected two completions, got {:?}", other),
    };
    assert_eq!(first_result, second_result);

    // The side-effecting handler ran exactly once.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_distinct_events_process_independently() {
    let (pipeline, calls) = counting_pipeline(test_config());

    pipeline
        .ingest(signed_envelope("wh-1", &bounce_body("msg-1")))
        .await;
    pipeline
        .ingest(signed_envelope("wh-2", &bounce_body("msg-2")))
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_signature_rejected_before_dispatch() {
    let (pipeline, calls) = counting_pipeline(test_config());

    let mut envelope = signed_envelope("wh-1", &bounce_body("msg-1"));
    envelope.raw_body[0] ^= 0x01;
    let report = pipeline.ingest(envelope).await;

    assert_eq!(
        report.outcome,
        ProcessOutcome::Rejected(RejectionReason::InvalidSignature)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let counters = pipeline.observer().counters("bounced").await;
    assert_eq!(counters.rejected, 1);
}

#[tokio::test]
async fn test_stale_timestamp_rejected() {
    let (pipeline, calls) = counting_pipeline(test_config());

    let body = bounce_body("msg-1");
    let timestamp = (now_secs() - 4_000).to_string();
    let signature = compute_signature(SECRET, body.as_bytes(), Some(&timestamp));
    let envelope = WebhookEnvelope::new("wh-1", body.as_bytes().to_vec())
        .with_event_type("bounced")
        .with_header("X-Webhook-Signature", signature)
        .with_header("X-Webhook-Timestamp", timestamp);

    let report = pipeline.ingest(envelope).await;
    assert_eq!(
        report.outcome,
        ProcessOutcome::Rejected(RejectionReason::StaleTimestamp)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_event_type_rejected() {
    let (pipeline, calls) = counting_pipeline(test_config());

    let body = r#"{"type":"subscribed","data":{},"timestamp":"2026-08-07T00:00:00Z"}"#;
    let report = pipeline.ingest(signed_envelope("wh-1", body)).await;

    assert_eq!(
        report.outcome,
        ProcessOutcome::Rejected(RejectionReason::UnsupportedEventType {
            event_type: "subscribed".to_string()
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_payload_rejected() {
    let (pipeline, calls) = counting_pipeline(test_config());

    let report = pipeline.ingest(signed_envelope("wh-1", "not json")).await;
    assert_eq!(
        report.outcome,
        ProcessOutcome::Rejected(RejectionReason::MalformedPayload)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_origin_allow_list_enforced_end_to_end() {
    let mut config = test_config();
    config.origin = config.origin.with_allowed_network("10.0.0.0/8");
    let (pipeline, calls) = counting_pipeline(config);

    let denied = pipeline
        .ingest(signed_envelope("wh-1", &bounce_body("msg-1")))
        .await;
    assert_eq!(
        denied.outcome,
        ProcessOutcome::Rejected(RejectionReason::OriginDenied)
    );

    let admitted = pipeline
        .ingest(
            signed_envelope("wh-2", &bounce_body("msg-2"))
                .with_source_address("10.1.2.3".parse().unwrap()),
        )
        .await;
    assert!(admitted.outcome.is_completed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_the_envelope() {
    let mut config = test_config();
    config.retry = config.retry.with_max_retries(3);

    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new().with_handler(
        EventType::Bounced,
        Arc::new(FailingHandler {
            calls: calls.clone(),
            error: ProcessingError::Transient("downstream timeout".to_string()),
        }),
    );
    let store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
    let dlq = Arc::new(InMemoryDeadLetterSink::new(100));
    let pipeline = IngestPipeline::with_components(
        config,
        registry,
        store,
        dlq.clone() as Arc<dyn DeadLetterSink>,
    );

    let report = pipeline
        .ingest(signed_envelope("wh-1", &bounce_body("msg-1")))
        .await;

    match &report.outcome {
        ProcessOutcome::Failed {
            sent_to_dlq,
            reason,
        } => {
            assert!(sent_to_dlq);
            assert!(reason.contains("retries exhausted"));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.attempts.len(), 4);
    assert_eq!(dlq.len().await, 1);

    let counters = pipeline.observer().counters("bounced").await;
    assert_eq!(counters.failure, 1);
}

#[tokio::test]
async fn test_breaker_fails_fast_after_consecutive_failures() {
    let mut config = test_config();
    config.retry = config.retry.with_max_retries(0).with_dlq_on_exhaustion(false);
    config.breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(60),
    };

    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new().with_handler(
        EventType::Bounced,
        Arc::new(FailingHandler {
            calls: calls.clone(),
            error: ProcessingError::Transient("downstream timeout".to_string()),
        }),
    );
    let pipeline = IngestPipeline::new(config, registry);

    for n in 1..=3 {
        let report = pipeline
            .ingest(signed_envelope(
                &format!("wh-{}", n),
                &bounce_body(&format!("msg-{}", n)),
            ))
            .await;
        assert!(matches!(report.outcome, ProcessOutcome::Failed { .. }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Fourth event fails fast; the handler is never invoked.
    let report = pipeline
        .ingest(signed_envelope("wh-4", &bounce_body("msg-4")))
        .await;
    match &report.outcome {
        ProcessOutcome::Failed { reason, .. } => {
            assert!(reason.contains("circuit open for service: email-processor"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_replay_outside_ttl_reprocesses() {
    let mut config = test_config();
    config.idempotency_ttl = Duration::from_millis(50);
    let (pipeline, calls) = counting_pipeline(config);
    let body = bounce_body("msg-1");

    let first = pipeline.ingest(signed_envelope("wh-1", &body)).await;
    assert!(!first.was_duplicate());

    tokio::time::sleep(Duration::from_millis(120)).await;

    // Outside the window the same physical event is a fresh claim.
    let second = pipeline.ingest(signed_envelope("wh-2", &body)).await;
    assert!(!second.was_duplicate());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_duplicate_deliveries_share_one_execution() {
    let (pipeline, calls) = counting_pipeline(test_config());
    let pipeline = Arc::new(pipeline);
    let body = bounce_body("msg-1");

    let mut handles = Vec::new();
    for n in 0..6 {
        let pipeline = pipeline.clone();
        let envelope = signed_envelope(&format!("wh-{}", n), &body);
        handles.push(tokio::spawn(async move { pipeline.ingest(envelope).await }));
    }

    let mut completions = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        assert!(report.outcome.is_completed());
        completions += 1;
    }

    assert_eq!(completions, 6);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
