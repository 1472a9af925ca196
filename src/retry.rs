use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::breaker::CircuitBreakerRegistry;
use crate::error::{
    AttemptOutcome, ProcessingError, RetryAttempt, RetryFailure, RetryFailureKind,
};
use crate::types::{now_secs, DlqEntry, DlqMessageId, WebhookEnvelope};

/// Retry behavior for one downstream call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Backoff before the first retry.
    pub initial_delay: Duration,

    /// Backoff cap.
    pub max_delay: Duration,

    /// Multiplier applied per retry.
    pub exponential_base: f64,

    /// Scale each delay by a uniform factor in [0.5, 1.5) so many
    /// concurrent webhooks do not retry in lockstep.
    pub use_jitter: bool,

    /// Hand the envelope to the dead-letter sink when retries run out.
    pub send_to_dlq_on_exhaustion: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
            use_jitter: true,
            send_to_dlq_on_exhaustion: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub fn with_dlq_on_exhaustion(mut self, send: bool) -> Self {
        self.send_to_dlq_on_exhaustion = send;
        self
    }

    /// Unjittered backoff before retry number `attempt` (0-based):
    /// `min(max_delay, initial_delay * base^attempt)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let exp = initial_ms * self.exponential_base.powi(attempt.min(64) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff with jitter applied, if enabled.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.use_jitter {
            return base;
        }
        base.mul_f64(0.5 + fastrand::f64())
    }
}

/// Terminal store for envelopes that exhausted their retry budget.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn submit(&self, envelope: &WebhookEnvelope, error: &str) -> DlqMessageId;
}

/// Bounded in-memory dead-letter sink. Oldest entries are evicted first.
pub struct InMemoryDeadLetterSink {
    entries: Mutex<VecDeque<DlqEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl InMemoryDeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn snapshot(&self) -> Vec<DlqEntry> {
        let guard = self.entries.lock().await;
        guard.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Remove and return one entry for manual replay.
    pub async fn take(&self, id: DlqMessageId) -> Option<DlqEntry> {
        let mut guard = self.entries.lock().await;
        let index = guard.iter().position(|entry| entry.id == id)?;
        guard.remove(index)
    }
}

impl Default for InMemoryDeadLetterSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn submit(&self, envelope: &WebhookEnvelope, error: &str) -> DlqMessageId {
        let id = DlqMessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = DlqEntry {
            id,
            webhook_id: envelope.webhook_id.clone(),
            event_type: envelope.event_type.clone(),
            payload: envelope.raw_body.clone(),
            failure: error.to_string(),
            created_at_secs: now_secs(),
        };

        let mut guard = self.entries.lock().await;
        guard.push_back(entry);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        id
    }
}

/// A finished retry loop: the terminal outcome plus the per-attempt log.
#[derive(Debug)]
pub struct RetryRun<T> {
    pub outcome: Result<T, RetryFailure>,
    pub attempts: Vec<RetryAttempt>,
}

impl<T> RetryRun<T> {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Drives a processing call through retries, circuit breaking, and
/// dead-lettering.
///
/// Every attempt outcome is reported to the breaker for the named
/// downstream service; an open breaker short-circuits before any work or
/// sleeping. Attempts within one run are strictly sequential, and backoff
/// suspends only the task handling this event.
pub struct RetryOrchestrator {
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<dyn DeadLetterSink>,
}

impl RetryOrchestrator {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, dlq: Arc<dyn DeadLetterSink>) -> Self {
        Self { breakers, dlq }
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    pub fn dlq(&self) -> Arc<dyn DeadLetterSink> {
        self.dlq.clone()
    }

    /// Run `work` under `policy` against downstream `service`.
    ///
    /// The caller-supplied `deadline` is honored between attempts and
    /// during backoff; an in-flight `work` call is never interrupted, so
    /// a deadline can only fire at an attempt boundary. Idempotency
    /// commits made by the caller after this returns are therefore never
    /// racing a half-finished attempt from the same task.
    pub async fn run<T, F, Fut>(
        &self,
        service: &str,
        envelope: &WebhookEnvelope,
        policy: &RetryPolicy,
        deadline: Option<Instant>,
        work: F,
    ) -> RetryRun<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let mut attempts = Vec::new();

        for attempt in 0..=policy.max_retries {
            if let Err(open) = self.breakers.try_admit(service).await {
                let sent_to_dlq = policy.send_to_dlq_on_exhaustion;
                if sent_to_dlq {
                    self.dlq.submit(envelope, &open.to_string()).await;
                }
                return RetryRun {
                    outcome: Err(RetryFailure {
                        kind: RetryFailureKind::CircuitOpen(open),
                        sent_to_dlq,
                    }),
                    attempts,
                };
            }

            match work().await {
                Ok(value) => {
                    self.breakers.record_success(service).await;
                    attempts.push(RetryAttempt {
                        attempt_number: attempt + 1,
                        delay_applied: Duration::ZERO,
                        outcome: AttemptOutcome::Success,
                    });
                    return RetryRun {
                        outcome: Ok(value),
                        attempts,
                    };
                }
                Err(error) => {
                    self.breakers.record_failure(service).await;

                    if !error.is_transient() {
                        attempts.push(RetryAttempt {
                            attempt_number: attempt + 1,
                            delay_applied: Duration::ZERO,
                            outcome: AttemptOutcome::Failed(error.to_string()),
                        });
                        self.dlq.submit(envelope, error.message()).await;
                        return RetryRun {
                            outcome: Err(RetryFailure {
                                kind: RetryFailureKind::Permanent { error },
                                sent_to_dlq: true,
                            }),
                            attempts,
                        };
                    }

                    if attempt == policy.max_retries {
                        attempts.push(RetryAttempt {
                            attempt_number: attempt + 1,
                            delay_applied: Duration::ZERO,
                            outcome: AttemptOutcome::Failed(error.to_string()),
                        });
                        let sent_to_dlq = policy.send_to_dlq_on_exhaustion;
                        if sent_to_dlq {
                            self.dlq.submit(envelope, error.message()).await;
                        }
                        return RetryRun {
                            outcome: Err(RetryFailure {
                                kind: RetryFailureKind::Exhausted { last_error: error },
                                sent_to_dlq,
                            }),
                            attempts,
                        };
                    }

                    let delay = policy.jittered_delay(attempt);
                    attempts.push(RetryAttempt {
                        attempt_number: attempt + 1,
                        delay_applied: delay,
                        outcome: AttemptOutcome::Failed(error.to_string()),
                    });

                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            return RetryRun {
                                outcome: Err(RetryFailure {
                                    kind: RetryFailureKind::DeadlineExceeded,
                                    sent_to_dlq: false,
                                }),
                                attempts,
                            };
                        }
                    }

                    sleep(delay).await;
                }
            }
        }

        // The loop always returns from its last iteration.
        RetryRun {
            outcome: Err(RetryFailure {
                kind: RetryFailureKind::DeadlineExceeded,
                sent_to_dlq: false,
            }),
            attempts,
        }
    }
}
