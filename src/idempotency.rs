use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::types::{now_ms, IdempotencyKey, IdempotencyRecord, RecordStatus};

/// Capability required from an idempotency store.
///
/// All three operations must be individually atomic; the coordinator's
/// claim protocol is built on `insert_if_absent` as its compare-and-set
/// primitive. A record past its expiry must behave as absent.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` iff no live record exists for its key.
    /// Returns true when this caller won the insert.
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> bool;

    /// Fetch the live record for `key`, if any.
    async fn get(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord>;

    /// Overwrite the record for `record.key`.
    async fn update(&self, record: &IdempotencyRecord);
}

/// In-memory store for single-process deployments and tests.
///
/// Expiry is lazy: expired entries are dropped when the key is next
/// touched.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> bool {
        let mut guard = self.records.lock().await;
        let now = now_ms();
        if let Some(existing) = guard.get(&record.key) {
            if !existing.is_expired(now) {
                return false;
            }
        }
        guard.insert(record.key.clone(), record.clone());
        true
    }

    async fn get(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        let mut guard = self.records.lock().await;
        let now = now_ms();
        match guard.get(key) {
            Some(record) if record.is_expired(now) => {
                guard.remove(key);
                None
            }
            Some(record) => Some(record.clone()),
            None => None,
        }
    }

    async fn update(&self, record: &IdempotencyRecord) {
        let mut guard = self.records.lock().await;
        guard.insert(record.key.clone(), record.clone());
    }
}

/// Tuning for the wait-for-owner phase of `process_once`.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How often a waiter re-reads the owner's record.
    pub poll_interval: Duration,

    /// How long a waiter watches a pending record before presuming the
    /// owner dead and re-claiming.
    pub wait_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a `process_once` call.
#[derive(Debug, Clone)]
pub struct ProcessOnce {
    pub result: serde_json::Value,
    pub was_duplicate: bool,
}

enum Claim {
    Owner,
    Joined(serde_json::Value),
}

enum WaitResult {
    Completed(serde_json::Value),
    Reclaim,
    TimedOut,
}

/// Single-flight execution keyed by idempotency key.
///
/// For each key, at most one caller (the owner) runs the work; every
/// concurrent or later delivery of the same key joins the owner's
/// committed result instead of executing again. Failed records count as
/// absent for claiming, so a later delivery may retry a failed event.
///
/// A waiter whose owner never commits re-claims after `wait_timeout`.
/// That takeover, and the takeover of a failed record, overwrite the
/// record without a compare-and-set, which opens a rare double-execution
/// window when the presumed-dead owner is merely slow. This is the
/// accepted tradeoff for bounding worst-case latency; the at-most-once
/// guarantee covers successful executions.
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        self.store.clone()
    }

    /// Run `work` at most once per `key` within `ttl`.
    ///
    /// The owner executes `work`, commits its outcome, and returns it with
    /// `was_duplicate=false`. Everyone else observes the committed result
    /// with `was_duplicate=true`. The commit happens regardless of how the
    /// work turned out, so waiters never watch a record that will not
    /// settle while its owner is alive.
    pub async fn process_once<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
        work: F,
    ) -> Result<ProcessOnce, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        match self.claim_or_join(key, ttl).await {
            Claim::Joined(result) => Ok(ProcessOnce {
                result,
                was_duplicate: true,
            }),
            Claim::Owner => {
                let outcome = work().await;

                let ttl_ms = ttl.as_millis() as u64;
                let mut record = IdempotencyRecord::pending(key.clone(), now_ms(), ttl_ms);
                match &outcome {
                    Ok(value) => {
                        record.status = RecordStatus::Completed;
                        record.result = Some(value.clone());
                    }
                    Err(_) => record.status = RecordStatus::Failed,
                }
                self.store.update(&record).await;

                outcome.map(|result| ProcessOnce {
                    result,
                    was_duplicate: false,
                })
            }
        }
    }

    async fn claim_or_join(&self, key: &IdempotencyKey, ttl: Duration) -> Claim {
        let ttl_ms = ttl.as_millis() as u64;
        loop {
            let pending = IdempotencyRecord::pending(key.clone(), now_ms(), ttl_ms);
            if self.store.insert_if_absent(&pending).await {
                return Claim::Owner;
            }

            match self.store.get(key).await {
                // Raced with expiry between insert and get; claim again.
                None => continue,
                Some(record) if record.status == RecordStatus::Completed => {
                    return Claim::Joined(record.result.unwrap_or(serde_json::Value::Null));
                }
                Some(record) if record.status == RecordStatus::Failed => {
                    self.store.update(&pending).await;
                    return Claim::Owner;
                }
                Some(_) => match self.wait_for_owner(key).await {
                    WaitResult::Completed(result) => return Claim::Joined(result),
                    WaitResult::Reclaim => continue,
                    WaitResult::TimedOut => {
                        // Owner presumed dead; take the claim over.
                        self.store
                            .update(&IdempotencyRecord::pending(key.clone(), now_ms(), ttl_ms))
                            .await;
                        return Claim::Owner;
                    }
                },
            }
        }
    }

    async fn wait_for_owner(&self, key: &IdempotencyKey) -> WaitResult {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            sleep(self.config.poll_interval).await;

            match self.store.get(key).await {
                None => return WaitResult::Reclaim,
                Some(record) if record.status == RecordStatus::Completed => {
                    return WaitResult::Completed(
                        record.result.unwrap_or(serde_json::Value::Null),
                    );
                }
                Some(record) if record.status == RecordStatus::Failed => {
                    return WaitResult::Reclaim;
                }
                Some(_) => {
                    if Instant::now() >= deadline {
                        return WaitResult::TimedOut;
                    }
                }
            }
        }
    }
}
