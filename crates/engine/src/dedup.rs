//! Dedup cache: Redis-backed suppression of repeat sends.
//!
//! A message is identified by its first recipient and its subject. Two markers
//! hang off that identity:
//! - `email:queued:*` is claimed by the producer right before publishing, so a
//!   second request for the same pair is reported as a duplicate even before
//!   the first one is delivered.
//! - `email:sent:*` is written by the consumer after a successful send and
//!   checked by both sides.
//!
//! Uses Redis `SET NX EX` for atomic check-and-set with automatic TTL expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use postbox_common::error::AppError;

/// How long both markers live (24 hours).
pub const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SENT_PREFIX: &str = "email:sent:";
const CLAIM_PREFIX: &str = "email:queued:";

/// Key-value store with TTL and atomic set-if-absent.
#[async_trait]
pub trait DedupCache: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    /// Set `key` only if it does not exist yet.
    ///
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, AppError>;

    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

/// Identity used to suppress repeat sends: `(first recipient, subject)`.
///
/// Two unrelated messages that share a first recipient and subject collapse
/// onto the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKey {
    recipient: String,
    subject: String,
}

impl DedupKey {
    /// Returns `None` when there is no recipient to key on.
    pub fn for_message(to: &[String], subject: &str) -> Option<Self> {
        to.first().map(|recipient| Self {
            recipient: recipient.clone(),
            subject: subject.to_string(),
        })
    }

    pub fn sent_key(&self) -> String {
        format!("{}{}:{}", SENT_PREFIX, self.recipient, self.subject)
    }

    pub fn claim_key(&self) -> String {
        format!("{}{}:{}", CLAIM_PREFIX, self.recipient, self.subject)
    }
}

/// Redis-backed dedup cache.
#[derive(Clone)]
pub struct RedisDedupCache {
    redis: ConnectionManager,
}

impl RedisDedupCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl DedupCache for RedisDedupCache {
    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();
        let exists: bool = redis.exists(key).await?;
        Ok(exists)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();

        // SET key value NX EX ttl
        // Returns Some("OK") if key was set, None if it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut redis)
            .await?;

        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut redis = self.redis.clone();
        let value: Option<String> = redis.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        match ttl {
            Some(ttl) => {
                redis
                    .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?
            }
            None => redis.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.del::<_, ()>(key).await?;
        Ok(())
    }
}
