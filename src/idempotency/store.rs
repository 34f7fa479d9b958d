//! Storage backends for idempotency records.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;

use crate::backend::{BackendError, RedisConnector};
use crate::idempotency::record::IdempotencyRecord;

/// Where recorded responses live. At most one record per key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch a live record; expired records are reported as absent.
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<IdempotencyRecord>, BackendError>;

    /// Store `record`, replacing any previous one for `key`.
    async fn put(&self, key: &str, record: IdempotencyRecord, now_ms: u64) -> Result<(), BackendError>;

    fn purge_expired(&self, _now_ms: u64) -> usize {
        0
    }
}

/// Process-local record map.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<IdempotencyRecord>, BackendError> {
        let live = self
            .records
            .get(key)
            .map(|r| r.value().clone())
            .filter(|r| !r.is_expired(now_ms));
        if live.is_none() {
            self.records.remove_if(key, |_, r| r.is_expired(now_ms));
        }
        Ok(live)
    }

    async fn put(&self, key: &str, record: IdempotencyRecord, _now_ms: u64) -> Result<(), BackendError> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now_ms));
        before - self.records.len()
    }
}

/// Records serialized as JSON under `PSETEX`.
pub struct RedisIdempotencyStore {
    connector: RedisConnector,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(connector: RedisConnector, key_prefix: impl Into<String>) -> Self {
        Self {
            connector,
            key_prefix: key_prefix.into(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str, now_ms: u64) -> Result<Option<IdempotencyRecord>, BackendError> {
        let mut conn = self.connector.connection().await?;
        let raw: Option<String> = conn.get(self.storage_key(key)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: IdempotencyRecord = serde_json::from_str(&raw)?;
        Ok((!record.is_expired(now_ms)).then_some(record))
    }

    async fn put(&self, key: &str, record: IdempotencyRecord, now_ms: u64) -> Result<(), BackendError> {
        let ttl_ms = record.ttl_remaining_ms(now_ms);
        if ttl_ms == 0 {
            return Ok(());
        }
        let encoded = serde_json::to_string(&record)?;
        let mut conn = self.connector.connection().await?;
        let _: () = conn.pset_ex(self.storage_key(key), encoded, ttl_ms).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at_ms: u64) -> IdempotencyRecord {
        IdempotencyRecord {
            status: 201,
            content_type: Some("application/json".into()),
            body: br#"{"id":1}"#.to_vec(),
            expires_at_ms,
        }
    }

    #[tokio::test]
    async fn test_memory_put_get_and_overwrite() {
        let store = MemoryIdempotencyStore::new();
        store.put("acme:k", record(100), 0).await.unwrap();
        assert_eq!(store.get("acme:k", 50).await.unwrap(), Some(record(100)));

        store.put("acme:k", record(200), 60).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("acme:k", 150).await.unwrap().unwrap().expires_at_ms, 200);
    }

    #[tokio::test]
    async fn test_memory_expired_is_absent_and_removed() {
        let store = MemoryIdempotencyStore::new();
        store.put("k", record(100), 0).await.unwrap();
        assert_eq!(store.get("k", 100).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_purge() {
        let store = MemoryIdempotencyStore::new();
        store.put("a", record(10), 0).await.unwrap();
        store.put("b", record(1_000), 0).await.unwrap();
        assert_eq!(store.purge_expired(500), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_record_json_shape() {
        let encoded = serde_json::to_string(&record(5)).unwrap();
        let decoded: IdempotencyRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record(5));
    }

    #[tokio::test]
    async fn test_redis_store_unreachable_errors() {
        let store = RedisIdempotencyStore::new(RedisConnector::new("redis://127.0.0.1:1/").unwrap(), "idem:");
        assert!(store.get("k", 0).await.is_err());
        assert!(store.put("k", record(10), 0).await.is_err());
    }
}
