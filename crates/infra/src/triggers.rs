use std::time::Duration;

use playbook_domain::ports::BoxFuture;
use playbook_domain::ports::triggers::{
    CasOutcome, PutOutcome, TriggerRecordStore, TriggerStoreError,
};
use playbook_domain::triggers::{TriggerKey, TriggerRecord, TriggerStatus};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "playbook:trigger";
const PUT_RETRY_LIMIT: usize = 2;

/// Swaps the record only while it still carries the expected status and run.
const COMPARE_AND_SET: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if not current then
        return 0
    end
    local decoded = cjson.decode(current)
    if decoded['status'] ~= ARGV[1] or decoded['run_id'] ~= ARGV[2] then
        return 0
    end
    redis.call('SET', KEYS[1], ARGV[3], 'PX', tonumber(ARGV[4]))
    return 1
"#;

/// Trigger records as JSON strings. Every write refreshes the retention TTL,
/// so a key is only forgotten after a full retention period of inactivity.
#[derive(Clone)]
pub struct RedisTriggerRecordStore {
    manager: ConnectionManager,
    prefix: String,
    retention: Duration,
}

impl RedisTriggerRecordStore {
    pub async fn connect(redis_url: &str, retention: Duration) -> Result<Self, TriggerStoreError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX, retention).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
        retention: Duration,
    ) -> Result<Self, TriggerStoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| TriggerStoreError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| TriggerStoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            retention,
        })
    }

    fn cache_key(&self, key: &TriggerKey) -> String {
        key.cache_key(&self.prefix)
    }

    fn retention_ms(&self) -> u64 {
        (self.retention.as_millis() as u64).max(1)
    }

    fn serialize(record: &TriggerRecord) -> Result<String, TriggerStoreError> {
        serde_json::to_string(record)
            .map_err(|err| TriggerStoreError::Serialization(err.to_string()))
    }

    fn deserialize(value: &str) -> Result<TriggerRecord, TriggerStoreError> {
        serde_json::from_str(value).map_err(|err| TriggerStoreError::Serialization(err.to_string()))
    }

    async fn read(
        conn: &mut ConnectionManager,
        cache_key: &str,
    ) -> Result<Option<TriggerRecord>, TriggerStoreError> {
        let value: Option<String> = conn.get(cache_key).await.map_err(store_error)?;
        value.as_deref().map(Self::deserialize).transpose()
    }
}

fn store_error(err: redis::RedisError) -> TriggerStoreError {
    TriggerStoreError::Store(err.to_string())
}

impl TriggerRecordStore for RedisTriggerRecordStore {
    fn get(
        &self,
        key: &TriggerKey,
    ) -> BoxFuture<'_, Result<Option<TriggerRecord>, TriggerStoreError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            Self::read(&mut conn, &cache_key).await
        })
    }

    fn put_if_absent(
        &self,
        key: &TriggerKey,
        record: &TriggerRecord,
    ) -> BoxFuture<'_, Result<PutOutcome, TriggerStoreError>> {
        let cache_key = self.cache_key(key);
        let payload = Self::serialize(record);
        Box::pin(async move {
            let payload = payload?;
            let retention_ms = self.retention_ms();
            let mut conn = self.manager.clone();
            for _ in 0..PUT_RETRY_LIMIT {
                let stored: Option<String> = redis::cmd("SET")
                    .arg(&cache_key)
                    .arg(&payload)
                    .arg("NX")
                    .arg("PX")
                    .arg(retention_ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(store_error)?;
                if stored.is_some() {
                    return Ok(PutOutcome::Stored);
                }
                // The holder may have expired between SET NX and GET.
                if let Some(existing) = Self::read(&mut conn, &cache_key).await? {
                    return Ok(PutOutcome::Existing(existing));
                }
            }
            Err(TriggerStoreError::Store(
                "failed to claim trigger record key".into(),
            ))
        })
    }

    fn compare_and_set(
        &self,
        key: &TriggerKey,
        expected_status: TriggerStatus,
        expected_run_id: &str,
        record: &TriggerRecord,
    ) -> BoxFuture<'_, Result<CasOutcome, TriggerStoreError>> {
        let cache_key = self.cache_key(key);
        let expected_run_id = expected_run_id.to_string();
        let payload = Self::serialize(record);
        Box::pin(async move {
            let payload = payload?;
            let mut conn = self.manager.clone();
            let updated: i64 = redis::Script::new(COMPARE_AND_SET)
                .key(&cache_key)
                .arg(expected_status.as_str())
                .arg(&expected_run_id)
                .arg(payload)
                .arg(self.retention_ms())
                .invoke_async(&mut conn)
                .await
                .map_err(store_error)?;
            if updated == 1 {
                return Ok(CasOutcome::Updated);
            }
            Ok(CasOutcome::Mismatch(Self::read(&mut conn, &cache_key).await?))
        })
    }
}
