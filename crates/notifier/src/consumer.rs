//! Email consumer: broker subscription feeding a bounded pool of delivery tasks.
//!
//! A dispatcher task pulls messages off the subscription and spawns one task
//! per message into a `JoinSet`, holding a semaphore permit for the task's
//! lifetime. Each task runs the full delivery pipeline, backoff included, so a
//! slow retry only ever occupies its own permit.
//!
//! Per message:
//! 1. Parse the wire payload (malformed payloads are logged and dropped)
//! 2. Skip if the `(first recipient, subject)` pair is already marked sent
//! 3. Send through the mail relay, up to three times with backoff
//! 4. Success: mark the log `sent` and write the sent marker (24h TTL)
//! 5. Exhaustion: mark the log `failed` with the last error, release the claim
//! 6. Shutdown during backoff: release the claim, leave the log as it is

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use postbox_common::error::AppError;
use postbox_common::types::{EmailStatus, QueuedEmail};
use postbox_engine::broker::{BrokerMessage, MessageBroker};
use postbox_engine::dedup::{DEDUP_TTL, DedupCache, DedupKey};
use postbox_engine::email_log::EmailLogStore;

use crate::relay::MailRelay;
use crate::retry::RetryPolicy;

/// What happened to one broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { attempts: u32 },
    /// Already delivered within the dedup window
    Skipped,
    Failed { attempts: u32, error: String },
    /// Shutdown arrived during backoff; the log keeps its status and the
    /// claim is released so the email can be requested again
    Interrupted,
    Malformed,
}

pub struct DeliveryPipeline {
    logs: Arc<dyn EmailLogStore>,
    cache: Arc<dyn DedupCache>,
    relay: Arc<dyn MailRelay>,
    policy: RetryPolicy,
}

impl DeliveryPipeline {
    pub fn new(
        logs: Arc<dyn EmailLogStore>,
        cache: Arc<dyn DedupCache>,
        relay: Arc<dyn MailRelay>,
    ) -> Self {
        Self {
            logs,
            cache,
            relay,
            policy: RetryPolicy::default(),
        }
    }

    pub async fn handle(
        &self,
        message: &BrokerMessage,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        match serde_json::from_slice::<QueuedEmail>(&message.payload) {
            Ok(email) => self.deliver(&email, cancel).await,
            Err(e) => {
                tracing::warn!(key = %message.key, error = %e, "Dropping malformed email message");
                DeliveryOutcome::Malformed
            }
        }
    }

    pub async fn deliver(
        &self,
        email: &QueuedEmail,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let key = DedupKey::for_message(&email.to, &email.subject);

        if let Some(key) = &key {
            match self.cache.exists(&key.sent_key()).await {
                Ok(true) => {
                    tracing::debug!(email_id = %email.email_id, "Email already sent, skipping");
                    return DeliveryOutcome::Skipped;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(email_id = %email.email_id, error = %e, "Dedup cache check failed")
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let error = match self.relay.send(email).await {
                Ok(()) => {
                    self.mark_sent(email, key.as_ref()).await;
                    tracing::info!(email_id = %email.email_id, attempt, "Email sent");
                    return DeliveryOutcome::Sent { attempts: attempt };
                }
                Err(e) => e.to_string(),
            };

            let Some(delay) = self.policy.delay_after(attempt) else {
                self.mark_failed(email, key.as_ref(), &error).await;
                tracing::error!(
                    email_id = %email.email_id,
                    attempts = attempt,
                    error = %error,
                    "Email delivery failed"
                );
                return DeliveryOutcome::Failed {
                    attempts: attempt,
                    error,
                };
            };

            tracing::warn!(
                email_id = %email.email_id,
                attempt,
                retry_in_secs = delay.as_secs(),
                error = %error,
                "Send attempt failed"
            );

            if let Err(e) = self.logs.increment_retry_count(email.email_id).await {
                tracing::warn!(email_id = %email.email_id, error = %e, "Failed to increment retry count");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(email_id = %email.email_id, attempt, "Delivery interrupted by shutdown");
                    self.release_claim(email, key.as_ref()).await;
                    return DeliveryOutcome::Interrupted;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn mark_sent(&self, email: &QueuedEmail, key: Option<&DedupKey>) {
        if let Err(e) = self
            .logs
            .update_status(email.email_id, EmailStatus::Sent, None)
            .await
        {
            tracing::warn!(email_id = %email.email_id, error = %e, "Failed to mark email sent");
        }

        if let Some(key) = key {
            if let Err(e) = self.cache.set(&key.sent_key(), "1", Some(DEDUP_TTL)).await {
                tracing::warn!(email_id = %email.email_id, error = %e, "Failed to write sent marker");
            }
        }
    }

    async fn mark_failed(&self, email: &QueuedEmail, key: Option<&DedupKey>, error: &str) {
        if let Err(e) = self
            .logs
            .update_status(email.email_id, EmailStatus::Failed, Some(error))
            .await
        {
            tracing::warn!(email_id = %email.email_id, error = %e, "Failed to mark email failed");
        }

        self.release_claim(email, key).await;
    }

    /// Drop the producer's claim so the same pair can be queued again.
    async fn release_claim(&self, email: &QueuedEmail, key: Option<&DedupKey>) {
        if let Some(key) = key {
            if let Err(e) = self.cache.delete(&key.claim_key()).await {
                tracing::warn!(email_id = %email.email_id, error = %e, "Failed to release dedup claim");
            }
        }
    }
}

pub struct EmailConsumer {
    broker: Arc<dyn MessageBroker>,
    pipeline: Arc<DeliveryPipeline>,
    topic: String,
    group_id: String,
    workers: usize,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EmailConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        pipeline: DeliveryPipeline,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        workers: usize,
    ) -> Self {
        Self {
            broker,
            pipeline: Arc::new(pipeline),
            topic: topic.into(),
            group_id: group_id.into(),
            workers: workers.max(1),
            cancel: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Subscribe and start dispatching. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<(), AppError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Ok(());
        }

        let rx = self
            .broker
            .subscribe(&self.topic, &self.group_id, self.cancel.child_token())
            .await?;

        *dispatcher = Some(tokio::spawn(dispatch(
            rx,
            self.pipeline.clone(),
            self.workers,
            self.cancel.clone(),
        )));

        tracing::info!(
            topic = %self.topic,
            group_id = %self.group_id,
            workers = self.workers,
            "Email consumer started"
        );
        Ok(())
    }

    /// Cancel, then wait for the dispatcher and every in-flight delivery.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Email consumer dispatcher panicked");
            }
        }

        tracing::info!(topic = %self.topic, "Email consumer stopped");
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<BrokerMessage>,
    pipeline: Arc<DeliveryPipeline>,
    workers: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!("Broker subscription closed");
                    break;
                }
            },
        };

        while let Some(joined) = tasks.try_join_next() {
            log_join_error(joined);
        }

        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let outcome = pipeline.handle(&message, &cancel).await;
            tracing::debug!(key = %message.key, outcome = ?outcome, "Message processed");
        });
    }

    while let Some(joined) = tasks.join_next().await {
        log_join_error(joined);
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Delivery task panicked");
    }
}
