use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::{now_ms, WebhookId};

/// How a sample ended: dispatched successfully, failed in processing, or
/// rejected at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOutcome {
    Success,
    Failure,
    Rejected,
}

/// One recorded measurement of a finished webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub event_type: String,
    pub outcome: SampleOutcome,
    pub latency: Duration,
    pub timestamp_ms: u64,
}

/// Success/failure/rejection tallies for one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub success: u64,
    pub failure: u64,
    pub rejected: u64,
}

/// Latency digest over the retained reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub min: Duration,
    pub median: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// One timed stage of a webhook's journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub duration: Duration,
    pub started_at_ms: u64,
}

/// Identifier of one trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

/// Full record of one webhook's path through the pipeline.
///
/// Spans are an explicit append-only list rather than call-stack context,
/// so concurrent tasks recording into the same collector cannot interleave
/// each other's traces. `total_duration` is the sum of span durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub webhook_id: WebhookId,
    pub spans: Vec<Span>,
    pub total_duration: Duration,
}

/// Alert raised by a rolling-window evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// Windowed throughput exceeded the configured ceiling.
    RateExceeded { count: u64, threshold: u64 },

    /// Failure fraction over the window exceeded the configured ceiling.
    ErrorRateExceeded { fraction: f64, threshold: f64 },
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Latency samples retained for percentile computation.
    pub latency_reservoir: usize,

    /// Finished traces retained before the oldest are evicted.
    pub max_traces: usize,

    /// Width of the rolling window the alert evaluators look at.
    pub alert_window: Duration,

    /// Fire `RateExceeded` past this many events per window.
    pub rate_alert_threshold: Option<u64>,

    /// Fire `ErrorRateExceeded` past this failure fraction (0.0–1.0).
    pub error_rate_alert_threshold: Option<f64>,

    /// Error-rate alerting stays quiet below this sample count, so one
    /// early failure does not read as a 100% error rate.
    pub min_samples_for_error_rate: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            latency_reservoir: 1_024,
            max_traces: 1_024,
            alert_window: Duration::from_secs(60),
            rate_alert_threshold: None,
            error_rate_alert_threshold: None,
            min_samples_for_error_rate: 10,
        }
    }
}

struct WindowSample {
    at: Instant,
    sample: MetricSample,
}

impl WindowSample {
    fn failed(&self) -> bool {
        self.sample.outcome != SampleOutcome::Success
    }
}

#[derive(Default)]
struct CollectorState {
    counters: HashMap<String, OutcomeCounters>,
    latencies: VecDeque<Duration>,
    window: VecDeque<WindowSample>,
    traces: HashMap<TraceId, TraceRecord>,
    trace_order: VecDeque<TraceId>,
}

/// In-process metrics, alerts, and traces for the whole pipeline.
///
/// Pipeline stages only ever write here; reporting surfaces only read.
/// No stage reads its own metrics back to alter behavior.
pub struct ObservabilityCollector {
    state: Mutex<CollectorState>,
    config: ObservabilityConfig,
    next_trace: AtomicU64,
}

impl ObservabilityCollector {
    pub fn new(config: ObservabilityConfig) -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
            config,
            next_trace: AtomicU64::new(1),
        }
    }

    /// Open a trace for one webhook.
    pub async fn start_trace(&self, webhook_id: &WebhookId) -> TraceId {
        let seq = self.next_trace.fetch_add(1, Ordering::Relaxed);
        let trace_id = TraceId(format!("trace-{}-{}", webhook_id.0, seq));

        let mut guard = self.state.lock().await;
        guard.traces.insert(
            trace_id.clone(),
            TraceRecord {
                trace_id: trace_id.clone(),
                webhook_id: webhook_id.clone(),
                spans: Vec::new(),
                total_duration: Duration::ZERO,
            },
        );
        guard.trace_order.push_back(trace_id.clone());
        while guard.trace_order.len() > self.config.max_traces {
            if let Some(evicted) = guard.trace_order.pop_front() {
                guard.traces.remove(&evicted);
            }
        }
        trace_id
    }

    /// Append a span to an open trace. Unknown trace ids are ignored.
    pub async fn add_span(&self, trace_id: &TraceId, name: &str, duration: Duration) {
        let started_at_ms = now_ms();
        let mut guard = self.state.lock().await;
        if let Some(trace) = guard.traces.get_mut(trace_id) {
            trace.spans.push(Span {
                name: name.to_string(),
                duration,
                started_at_ms,
            });
        }
    }

    /// Close a trace, fixing its total duration as the sum of its spans.
    pub async fn finish_trace(&self, trace_id: &TraceId) {
        let mut guard = self.state.lock().await;
        if let Some(trace) = guard.traces.get_mut(trace_id) {
            trace.total_duration = trace.spans.iter().map(|span| span.duration).sum();
        }
    }

    pub async fn trace(&self, trace_id: &TraceId) -> Option<TraceRecord> {
        let guard = self.state.lock().await;
        guard.traces.get(trace_id).cloned()
    }

    /// Record one finished webhook.
    pub async fn record_sample(&self, event_type: &str, outcome: SampleOutcome, latency: Duration) {
        let mut guard = self.state.lock().await;

        let counters = guard.counters.entry(event_type.to_string()).or_default();
        match outcome {
            SampleOutcome::Success => counters.success += 1,
            SampleOutcome::Failure => counters.failure += 1,
            SampleOutcome::Rejected => counters.rejected += 1,
        }

        guard.latencies.push_back(latency);
        while guard.latencies.len() > self.config.latency_reservoir {
            guard.latencies.pop_front();
        }

        guard.window.push_back(WindowSample {
            at: Instant::now(),
            sample: MetricSample {
                event_type: event_type.to_string(),
                outcome,
                latency,
                timestamp_ms: now_ms(),
            },
        });
        Self::prune_window(&mut guard.window, self.config.alert_window);
    }

    pub async fn counters(&self, event_type: &str) -> OutcomeCounters {
        let guard = self.state.lock().await;
        guard.counters.get(event_type).copied().unwrap_or_default()
    }

    pub async fn counters_all(&self) -> HashMap<String, OutcomeCounters> {
        let guard = self.state.lock().await;
        guard.counters.clone()
    }

    /// Samples currently inside the alert window, oldest first.
    pub async fn recent_samples(&self) -> Vec<MetricSample> {
        let mut guard = self.state.lock().await;
        Self::prune_window(&mut guard.window, self.config.alert_window);
        guard.window.iter().map(|s| s.sample.clone()).collect()
    }

    /// Percentiles over the retained latency reservoir. None when empty.
    pub async fn latency_stats(&self) -> Option<LatencyStats> {
        let guard = self.state.lock().await;
        if guard.latencies.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = guard.latencies.iter().copied().collect();
        sorted.sort();

        let at = |q: f64| {
            let index = ((sorted.len() - 1) as f64 * q).round() as usize;
            sorted[index.min(sorted.len() - 1)]
        };

        Some(LatencyStats {
            min: sorted[0],
            median: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        })
    }

    /// Evaluate the rolling-window alerts against current state.
    pub async fn evaluate_alerts(&self) -> Vec<Alert> {
        let mut guard = self.state.lock().await;
        Self::prune_window(&mut guard.window, self.config.alert_window);

        let mut alerts = Vec::new();
        let total = guard.window.len() as u64;

        if let Some(threshold) = self.config.rate_alert_threshold {
            if total > threshold {
                alerts.push(Alert::RateExceeded {
                    count: total,
                    threshold,
                });
            }
        }

        if let Some(threshold) = self.config.error_rate_alert_threshold {
            if guard.window.len() >= self.config.min_samples_for_error_rate {
                let failed = guard.window.iter().filter(|s| s.failed()).count() as f64;
                let fraction = failed / total as f64;
                if fraction > threshold {
                    alerts.push(Alert::ErrorRateExceeded {
                        fraction,
                        threshold,
                    });
                }
            }
        }

        alerts
    }

    fn prune_window(window: &mut VecDeque<WindowSample>, width: Duration) {
        while window
            .front()
            .map(|sample| sample.at.elapsed() > width)
            .unwrap_or(false)
        {
            window.pop_front();
        }
    }
}
