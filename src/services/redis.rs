//! Redis service for short-lived action tokens

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, Script};

use crate::{
    error::{AppError, AppResult},
    models::ActionToken,
    repository::TokenStore,
};

/// Store the token under KEYS[1] unless one is live, plus its digest index
/// under KEYS[2]; both keys are written or neither is.
const ISSUE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    redis.call('SET', KEYS[2], KEYS[1], 'EX', ARGV[2])
    return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisService {
    client: Client,
}

impl RedisService {
    /// Create a new Redis service
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        // Test connection
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;

        Ok(Self { client })
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn token_key(token: &ActionToken) -> String {
        format!(
            "token:{}:{}",
            token.action.as_str(),
            token.email.to_lowercase()
        )
    }

    fn digest_key(digest: &str) -> String {
        format!("token:digest:{}", digest)
    }
}

#[async_trait]
impl TokenStore for RedisService {
    async fn issue(&self, token: &ActionToken, ttl_seconds: u64) -> AppResult<bool> {
        let mut conn = self.connection().await?;
        let key = Self::token_key(token);
        let value = serde_json::to_string(token)
            .map_err(|e| AppError::Internal(format!("Failed to serialize token: {}", e)))?;

        // NX keeps the first live token; a second request has to wait for expiry
        let stored: i64 = Script::new(ISSUE_SCRIPT)
            .key(&key)
            .key(Self::digest_key(&token.digest))
            .arg(&value)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await?;

        Ok(stored == 1)
    }

    async fn consume(&self, digest: &str) -> AppResult<Option<ActionToken>> {
        let mut conn = self.connection().await?;

        let key: Option<String> = redis::cmd("GETDEL")
            .arg(Self::digest_key(digest))
            .query_async(&mut conn)
            .await?;
        let Some(key) = key else {
            return Ok(None);
        };

        let value: Option<String> = redis::cmd("GETDEL").arg(&key).query_async(&mut conn).await?;
        let Some(value) = value else {
            return Ok(None);
        };

        let token: ActionToken = serde_json::from_str(&value)
            .map_err(|e| AppError::Internal(format!("Corrupt token under {}: {}", key, e)))?;

        Ok((token.digest == digest).then_some(token))
    }
}
