use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use tracing::instrument;

use super::InfraError;
use crate::{
    app_error::{AppError, AppResult},
    application::ports::cache::BillingCache,
};

/// HSET + EXPIRE in one round trip so an entry never outlives the TTL.
/// Skipped when the shop's generation moved since the caller read it.
const SET_IF_GENERATION_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[4]) then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// DEL the entries and bump the generation together.
const INVALIDATE_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
return redis.call('INCR', KEYS[2])
"#;

/// Redis-backed read-through cache. One hash per shop, so invalidation is a
/// single DEL.
#[derive(Clone)]
pub struct RedisBillingCache {
    manager: ConnectionManager,
    ttl_secs: u64,
    set_script: Script,
    invalidate_script: Script,
}

impl RedisBillingCache {
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, InfraError> {
        let client = redis::Client::open(redis_url).map_err(InfraError::RedisConnection)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(InfraError::RedisConnection)?;
        Ok(Self {
            manager,
            ttl_secs,
            set_script: Script::new(SET_IF_GENERATION_SCRIPT),
            invalidate_script: Script::new(INVALIDATE_SCRIPT),
        })
    }
}

fn shop_key(shop: &str) -> String {
    format!("billing:{shop}")
}

fn generation_key(shop: &str) -> String {
    format!("billing:{shop}:gen")
}

fn cache_error(e: redis::RedisError) -> AppError {
    AppError::Internal(format!("billing cache: {e}"))
}

#[async_trait]
impl BillingCache for RedisBillingCache {
    async fn get(&self, shop: &str, resource: &str) -> AppResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.hget(shop_key(shop), resource)
            .await
            .map_err(cache_error)
    }

    async fn generation(&self, shop: &str) -> AppResult<u64> {
        let mut conn = self.manager.clone();
        let generation: Option<u64> = conn
            .get(generation_key(shop))
            .await
            .map_err(cache_error)?;
        Ok(generation.unwrap_or(0))
    }

    async fn set(
        &self,
        shop: &str,
        resource: &str,
        value: &str,
        generation: u64,
    ) -> AppResult<bool> {
        let mut conn = self.manager.clone();
        let stored: i64 = self
            .set_script
            .key(shop_key(shop))
            .key(generation_key(shop))
            .arg(resource)
            .arg(value)
            .arg(self.ttl_secs)
            .arg(generation)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(stored == 1)
    }

    #[instrument(skip(self))]
    async fn invalidate_shop(&self, shop: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = self
            .invalidate_script
            .key(shop_key(shop))
            .key(generation_key(shop))
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}
