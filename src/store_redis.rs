#[cfg(feature = "redis")]
use async_trait::async_trait;

#[cfg(feature = "redis")]
use crate::idempotency::IdempotencyStore;
#[cfg(feature = "redis")]
use crate::types::{now_ms, IdempotencyKey, IdempotencyRecord};

/// Idempotency store backed by Redis, for multi-instance deployments.
///
/// The claim primitive maps onto `SET NX PX`: Redis arbitrates which
/// instance wins a concurrent insert, and key expiry replaces lazy
/// record expiry. A store outage degrades claiming to at-least-once
/// rather than wedging ingestion.
#[cfg(feature = "redis")]
pub struct RedisIdempotencyStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn record_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:idem:{}", self.prefix, key.0)
    }

    fn ttl_ms(record: &IdempotencyRecord) -> u64 {
        record.expires_at_ms.saturating_sub(now_ms()).max(1)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> bool {
        let mut conn = match self.client.get_tokio_connection().await {
            Ok(conn) => conn,
            Err(_) => return true,
        };
        let payload = serde_json::to_string(record).unwrap_or_default();
        let reply: Result<Option<String>, _> = redis::cmd("SET")
            .arg(self.record_key(&record.key))
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_ms(record))
            .query_async(&mut conn)
            .await;
        matches!(reply, Ok(Some(_)))
    }

    async fn get(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        let mut conn = match self.client.get_tokio_connection().await {
            Ok(conn) => conn,
            Err(_) => return None,
        };
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.record_key(key))
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        payload.and_then(|value| serde_json::from_str(&value).ok())
    }

    async fn update(&self, record: &IdempotencyRecord) {
        let mut conn = match self.client.get_tokio_connection().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let payload = serde_json::to_string(record).unwrap_or_default();
        let _: Result<(), _> = redis::cmd("SET")
            .arg(self.record_key(&record.key))
            .arg(payload)
            .arg("PX")
            .arg(Self::ttl_ms(record))
            .query_async(&mut conn)
            .await;
    }
}
