//! Message broker: topic publish/subscribe between producer and consumer.
//!
//! The production broker is a Redis Stream per topic:
//! - `publish` is `XADD topic * key <key> payload <bytes>`
//! - `subscribe` joins a consumer group (`XGROUP CREATE ... 0 MKSTREAM`, so a
//!   new group starts from the beginning of the stream) and reads with
//!   `XREADGROUP`, first walking this consumer's own pending entries once,
//!   then new ones
//! - delivered entries are acknowledged in batches on a fixed interval, not
//!   per message, so a crash between delivery and the next commit leads to
//!   redelivery (at-least-once)

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use postbox_common::error::AppError;

/// How often delivered entries are acknowledged.
const COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Longest a single `XREADGROUP` blocks waiting for new entries.
const READ_BLOCK_MS: usize = 500;

const READ_BATCH: usize = 16;

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";

/// A message as handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish one message to `topic`, keyed by `key`.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), AppError>;

    /// Join `group_id` on `topic` and stream its messages until `cancel` fires.
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BrokerMessage>, AppError>;
}

/// Redis Streams broker.
#[derive(Clone)]
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    /// Stable per-process name inside the consumer group; pending entries are
    /// tracked against it and replayed after a restart.
    consumer_name: String,
    buffer: usize,
}

impl RedisStreamBroker {
    pub fn new(redis: ConnectionManager, consumer_name: impl Into<String>) -> Self {
        Self {
            redis,
            consumer_name: consumer_name.into(),
            buffer: READ_BATCH * 2,
        }
    }

    async fn ensure_group(&self, topic: &str, group_id: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let created: redis::RedisResult<()> =
            redis.xgroup_create_mkstream(topic, group_id, "0").await;

        match created {
            Ok(()) => {
                tracing::info!(topic, group_id, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(AppError::Broker(format!(
                "failed to create consumer group {} on {}: {}",
                group_id, topic, e
            ))),
        }
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let _id: String = redis
            .xadd(
                topic,
                "*",
                &[(FIELD_KEY, key.as_bytes()), (FIELD_PAYLOAD, payload)],
            )
            .await
            .map_err(|e| AppError::Broker(format!("failed to publish to {}: {}", topic, e)))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BrokerMessage>, AppError> {
        self.ensure_group(topic, group_id).await?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let reader = StreamReader {
            redis: self.redis.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            consumer_name: self.consumer_name.clone(),
            uncommitted: Vec::new(),
        };

        tokio::spawn(reader.run(tx, cancel));

        tracing::info!(
            topic,
            group_id,
            consumer = %self.consumer_name,
            "Subscribed to topic"
        );
        Ok(rx)
    }
}

/// Position of the next `XREADGROUP`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Walking our pending entries list after the given id
    Pending(String),
    /// Only entries never delivered to the group (`>`)
    New,
}

impl ReadCursor {
    fn start() -> Self {
        ReadCursor::Pending("0".to_string())
    }

    fn id(&self) -> &str {
        match self {
            ReadCursor::Pending(id) => id,
            ReadCursor::New => ">",
        }
    }

    /// Move past the last entry of a batch. An empty pending batch means the
    /// backlog is drained.
    fn advance(&mut self, last_id: Option<&str>) {
        if *self == ReadCursor::New {
            return;
        }
        *self = match last_id {
            Some(id) => ReadCursor::Pending(id.to_string()),
            None => ReadCursor::New,
        };
    }
}

/// Background task feeding one subscription.
struct StreamReader {
    redis: ConnectionManager,
    topic: String,
    group_id: String,
    consumer_name: String,
    uncommitted: Vec<String>,
}

impl StreamReader {
    async fn run(mut self, tx: mpsc::Sender<BrokerMessage>, cancel: CancellationToken) {
        let mut cursor = ReadCursor::start();
        let mut last_commit = Instant::now();

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.read_batch(cursor.id()) => batch,
            };

            match batch {
                Ok(entries) => {
                    cursor.advance(entries.last().map(|(id, _)| id.as_str()));
                    for (id, message) in entries {
                        if let Some(message) = message {
                            let sent = tokio::select! {
                                _ = cancel.cancelled() => false,
                                sent = tx.send(message) => sent.is_ok(),
                            };
                            if !sent {
                                self.commit().await;
                                return;
                            }
                        }
                        self.uncommitted.push(id);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        error = %e,
                        "Broker read failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(COMMIT_INTERVAL) => {}
                    }
                }
            }

            if last_commit.elapsed() >= COMMIT_INTERVAL {
                self.commit().await;
                last_commit = Instant::now();
            }
        }

        self.commit().await;
        tracing::info!(topic = %self.topic, "Broker subscription closed");
    }

    async fn read_batch(
        &mut self,
        cursor: &str,
    ) -> redis::RedisResult<Vec<(String, Option<BrokerMessage>)>> {
        let options = StreamReadOptions::default()
            .group(&self.group_id, &self.consumer_name)
            .count(READ_BATCH)
            .block(READ_BLOCK_MS);

        let reply: Option<StreamReadReply> = self
            .redis
            .xread_options(&[&self.topic], &[cursor], &options)
            .await?;

        let entries = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|stream| stream.ids)
                    .map(|entry| {
                        let message = match (
                            entry.get::<String>(FIELD_KEY),
                            entry.get::<Vec<u8>>(FIELD_PAYLOAD),
                        ) {
                            (Some(key), Some(payload)) => Some(BrokerMessage { key, payload }),
                            _ => {
                                tracing::warn!(
                                    entry_id = %entry.id,
                                    "Dropping stream entry without payload"
                                );
                                None
                            }
                        };
                        (entry.id, message)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }

    async fn commit(&mut self) {
        if self.uncommitted.is_empty() {
            return;
        }

        let ids = std::mem::take(&mut self.uncommitted);
        let acked: redis::RedisResult<usize> =
            self.redis.xack(&self.topic, &self.group_id, &ids).await;

        match acked {
            Ok(count) => tracing::debug!(topic = %self.topic, count, "Committed broker offsets"),
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "Failed to commit broker offsets");
                self.uncommitted = ids;
            }
        }
    }
}
