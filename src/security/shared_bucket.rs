//! Token buckets in a shared Redis deployment.
//!
//! The whole read-refill-debit-write sequence runs as one Lua script, so
//! every gateway process sees a single total order of decrements per key.
//! The script applies the same arithmetic as [`TokenBucket::try_acquire`]
//! and sets a `PEXPIRE` of one window on every write.
//!
//! [`TokenBucket::try_acquire`]: crate::security::rate_limit::TokenBucket::try_acquire

use async_trait::async_trait;
use redis::Script;

use crate::backend::{BackendError, RedisConnector};
use crate::security::rate_limit::{BucketPolicy, BucketStore, Decision};

/// KEYS[1] = bucket key
/// ARGV[1] = capacity, ARGV[2] = window ms, ARGV[3] = now ms
/// Returns { allowed (0|1), retry_after_ms, tokens as string }.
const CONSUME_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

if now > last then
  tokens = math.min(capacity, tokens + (now - last) * capacity / window)
  last = now
end

local allowed = 0
local retry_after = 0
if tokens < 1 then
  local rate = capacity / window
  retry_after = math.max(1, math.ceil((1 - tokens) / rate))
  while tokens + retry_after * capacity / window < 1 do
    retry_after = retry_after + 1
  end
else
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(last))
redis.call('PEXPIRE', KEYS[1], window)
return { allowed, retry_after, tostring(tokens) }
"#;

/// Bucket store backed by a Redis script.
pub struct SharedBucketStore {
    connector: RedisConnector,
    script: Script,
    key_prefix: String,
}

impl SharedBucketStore {
    pub fn new(connector: RedisConnector, key_prefix: impl Into<String>) -> Self {
        Self {
            connector,
            script: Script::new(CONSUME_SCRIPT),
            key_prefix: key_prefix.into(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// Interpret the script's reply.
fn decode_reply(reply: (i64, i64, String)) -> Result<Decision, BackendError> {
    let (allowed, retry_after_ms, tokens) = reply;
    tokens
        .parse::<f64>()
        .map_err(|_| BackendError::Protocol(format!("non-numeric token count {tokens:?}")))?;
    match allowed {
        1 => Ok(Decision::allowed()),
        0 if retry_after_ms > 0 => Ok(Decision::rejected(retry_after_ms as u64)),
        _ => Err(BackendError::Protocol(format!(
            "bad consume reply ({allowed}, {retry_after_ms})"
        ))),
    }
}

#[async_trait]
impl BucketStore for SharedBucketStore {
    async fn consume(
        &self,
        key: &str,
        policy: &BucketPolicy,
        now_ms: u64,
    ) -> Result<Decision, BackendError> {
        let mut conn = self.connector.connection().await?;
        let reply: (i64, i64, String) = self
            .script
            .key(self.storage_key(key))
            .arg(policy.capacity)
            .arg(policy.window_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        decode_reply(reply)
    }
}
