//! Delivery pipeline and consumer tests against the in-memory backends.
//!
//! Time is paused, so backoff sleeps complete instantly once every task idles.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{EmailStatus, QueueStatus, QueuedEmail};
use postbox_engine::broker::{BrokerMessage, MessageBroker};
use postbox_engine::dedup::{DedupCache, DedupKey};
use postbox_engine::email_log::EmailLogStore;
use postbox_engine::memory::{InMemoryBroker, InMemoryDedupCache, InMemoryEmailLogStore};
use postbox_engine::producer::{EmailProducer, SendEmailRequest};
use postbox_engine::templates::TemplateRegistry;
use postbox_notifier::consumer::{DeliveryOutcome, DeliveryPipeline, EmailConsumer};
use postbox_notifier::relay::MailRelay;

const TOPIC: &str = "email-notifications";
const GROUP: &str = "email-service-group";

// ============================================================
// Shared helpers
// ============================================================

/// Relay that replays a script of results, then falls back to a default.
struct ScriptedRelay {
    script: Mutex<VecDeque<Result<(), String>>>,
    fallback: Result<(), String>,
    sent: Mutex<Vec<QueuedEmail>>,
    attempts: Mutex<u32>,
}

impl ScriptedRelay {
    fn new(script: Vec<Result<(), String>>, fallback: Result<(), String>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
        }
    }

    fn always_ok() -> Self {
        Self::new(vec![], Ok(()))
    }

    fn always_failing() -> Self {
        Self::new(vec![], Err("connection refused".to_string()))
    }

    async fn attempts(&self) -> u32 {
        *self.attempts.lock().await
    }

    async fn sent(&self) -> Vec<QueuedEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MailRelay for ScriptedRelay {
    async fn send(&self, email: &QueuedEmail) -> Result<(), AppError> {
        *self.attempts.lock().await += 1;
        let result = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match result {
            Ok(()) => {
                self.sent.lock().await.push(email.clone());
                Ok(())
            }
            Err(e) => Err(AppError::Mail(e)),
        }
    }
}

struct Harness {
    logs: Arc<InMemoryEmailLogStore>,
    cache: Arc<InMemoryDedupCache>,
    broker: Arc<InMemoryBroker>,
    producer: EmailProducer,
}

fn harness() -> Harness {
    let logs = Arc::new(InMemoryEmailLogStore::new());
    let cache = Arc::new(InMemoryDedupCache::new());
    let broker = Arc::new(InMemoryBroker::new());
    let producer = EmailProducer::new(
        logs.clone(),
        cache.clone(),
        Some(broker.clone()),
        Arc::new(TemplateRegistry::with_builtin()),
        TOPIC,
    );

    Harness {
        logs,
        cache,
        broker,
        producer,
    }
}

impl Harness {
    fn pipeline(&self, relay: Arc<ScriptedRelay>) -> DeliveryPipeline {
        DeliveryPipeline::new(self.logs.clone(), self.cache.clone(), relay)
    }

    /// Queue an email through the producer and return its wire message.
    async fn queue(&self, to: &str, subject: &str) -> (Uuid, BrokerMessage) {
        let response = self
            .producer
            .queue_email(&SendEmailRequest {
                to: vec![to.to_string()],
                subject: subject.to_string(),
                body: Some("hi".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = response.id.unwrap();

        let published = self.broker.published(TOPIC).await;
        let message = published
            .into_iter()
            .find(|m| m.key == id.to_string())
            .unwrap();
        (id, message)
    }

    async fn status(&self, id: Uuid) -> EmailStatus {
        self.logs.get_by_id(id).await.unwrap().unwrap().status
    }
}

/// Poll until `id` reaches `status`, letting paused time advance.
async fn wait_for_status(h: &Harness, id: Uuid, status: EmailStatus) {
    for _ in 0..200 {
        if h.status(id).await == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("email {} never reached {}", id, status);
}

// ============================================================
// Delivery pipeline
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_success_marks_sent_and_writes_marker() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_ok());
    let pipeline = h.pipeline(relay.clone());
    let (id, message) = h.queue("a@x.com", "Hello").await;

    let outcome = pipeline.handle(&message, &CancellationToken::new()).await;

    assert_eq!(outcome, DeliveryOutcome::Sent { attempts: 1 });
    let record = h.logs.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, EmailStatus::Sent);
    assert!(record.sent_at.is_some());
    assert_eq!(record.retry_count, 0);

    let key = DedupKey::for_message(&["a@x.com".to_string()], "Hello").unwrap();
    assert!(h.cache.exists(&key.sent_key()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_send_is_attempted_three_times() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_failing());
    let pipeline = h.pipeline(relay.clone());
    let (id, message) = h.queue("a@x.com", "Hello").await;

    let started = tokio::time::Instant::now();
    let outcome = pipeline.handle(&message, &CancellationToken::new()).await;

    assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 3, .. }));
    assert_eq!(relay.attempts().await, 3);
    // 5s then 10s of backoff between the three attempts
    assert!(started.elapsed() >= Duration::from_secs(15));

    let record = h.logs.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, EmailStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert!(record.retry_count <= record.max_retries);
    assert!(record.error.unwrap().contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_releases_claim() {
    let h = harness();
    let pipeline = h.pipeline(Arc::new(ScriptedRelay::always_failing()));
    let (_, message) = h.queue("a@x.com", "Hello").await;

    pipeline.handle(&message, &CancellationToken::new()).await;

    let key = DedupKey::for_message(&["a@x.com".to_string()], "Hello").unwrap();
    assert!(!h.cache.exists(&key.claim_key()).await.unwrap());
    assert!(!h.cache.exists(&key.sent_key()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failure() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::new(
        vec![Err("timeout".to_string())],
        Ok(()),
    ));
    let pipeline = h.pipeline(relay.clone());
    let (id, message) = h.queue("a@x.com", "Hello").await;

    let outcome = pipeline.handle(&message, &CancellationToken::new()).await;

    assert_eq!(outcome, DeliveryOutcome::Sent { attempts: 2 });
    let record = h.logs.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, EmailStatus::Sent);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_already_sent_is_skipped() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_ok());
    let pipeline = h.pipeline(relay.clone());
    let (id, message) = h.queue("a@x.com", "Hello").await;

    let key = DedupKey::for_message(&["a@x.com".to_string()], "Hello").unwrap();
    h.cache.set(&key.sent_key(), "1", None).await.unwrap();

    let outcome = pipeline.handle(&message, &CancellationToken::new()).await;

    assert_eq!(outcome, DeliveryOutcome::Skipped);
    assert_eq!(relay.attempts().await, 0);
    assert_eq!(h.status(id).await, EmailStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_after_success_is_skipped() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_ok());
    let pipeline = h.pipeline(relay.clone());
    let (_, message) = h.queue("a@x.com", "Hello").await;

    pipeline.handle(&message, &CancellationToken::new()).await;
    let again = pipeline.handle(&message, &CancellationToken::new()).await;

    assert_eq!(again, DeliveryOutcome::Skipped);
    assert_eq!(relay.sent().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_dropped() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_ok());
    let pipeline = h.pipeline(relay.clone());

    let message = BrokerMessage {
        key: "junk".to_string(),
        payload: b"{not json".to_vec(),
    };
    let outcome = pipeline.handle(&message, &CancellationToken::new()).await;

    assert_eq!(outcome, DeliveryOutcome::Malformed);
    assert_eq!(relay.attempts().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_leaves_status_untouched() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_failing());
    let pipeline = h.pipeline(relay.clone());
    let (id, message) = h.queue("a@x.com", "Hello").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = pipeline.handle(&message, &cancel).await;

    assert_eq!(outcome, DeliveryOutcome::Interrupted);
    assert_eq!(relay.attempts().await, 1);
    assert_eq!(h.status(id).await, EmailStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_allows_requeue() {
    let h = harness();
    let pipeline = h.pipeline(Arc::new(ScriptedRelay::always_failing()));
    let (_, message) = h.queue("a@x.com", "Hello").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = pipeline.handle(&message, &cancel).await;
    assert_eq!(outcome, DeliveryOutcome::Interrupted);

    let key = DedupKey::for_message(&["a@x.com".to_string()], "Hello").unwrap();
    assert!(!h.cache.exists(&key.claim_key()).await.unwrap());

    let again = h
        .producer
        .queue_email(&SendEmailRequest {
            to: vec!["a@x.com".to_string()],
            subject: "Hello".to_string(),
            body: Some("hi".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(again.status, QueueStatus::Queued);
}

// ============================================================
// Consumer
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_consumer_delivers_published_messages() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_ok());
    let consumer = EmailConsumer::new(
        h.broker.clone(),
        h.pipeline(relay.clone()),
        TOPIC,
        GROUP,
        4,
    );

    let (first, _) = h.queue("a@x.com", "One").await;
    consumer.start().await.unwrap();
    let (second, _) = h.queue("b@x.com", "Two").await;

    wait_for_status(&h, first, EmailStatus::Sent).await;
    wait_for_status(&h, second, EmailStatus::Sent).await;
    assert_eq!(relay.sent().await.len(), 2);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_retry_does_not_block_other_messages() {
    let h = harness();
    // First attempt fails, everything after succeeds
    let relay = Arc::new(ScriptedRelay::new(vec![Err("busy".to_string())], Ok(())));
    let consumer = EmailConsumer::new(
        h.broker.clone(),
        h.pipeline(relay.clone()),
        TOPIC,
        GROUP,
        2,
    );

    let (slow, _) = h.queue("a@x.com", "One").await;
    let (fast, _) = h.queue("b@x.com", "Two").await;
    consumer.start().await.unwrap();

    wait_for_status(&h, fast, EmailStatus::Sent).await;
    // The first message is still in its 5s backoff
    assert_eq!(h.status(slow).await, EmailStatus::Queued);

    wait_for_status(&h, slow, EmailStatus::Sent).await;
    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_delivery() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_failing());
    let consumer = EmailConsumer::new(
        h.broker.clone(),
        h.pipeline(relay.clone()),
        TOPIC,
        GROUP,
        1,
    );

    let (id, _) = h.queue("a@x.com", "Hello").await;
    consumer.start().await.unwrap();

    while relay.attempts().await == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    consumer.stop().await;

    // Stopped during the first backoff: one attempt, no terminal status
    assert_eq!(relay.attempts().await, 1);
    assert_eq!(h.status(id).await, EmailStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_subscribes_once() {
    let h = harness();
    let relay = Arc::new(ScriptedRelay::always_ok());
    let consumer = EmailConsumer::new(
        h.broker.clone(),
        h.pipeline(relay.clone()),
        TOPIC,
        GROUP,
        4,
    );

    consumer.start().await.unwrap();
    consumer.start().await.unwrap();
    let (id, _) = h.queue("a@x.com", "Hello").await;

    wait_for_status(&h, id, EmailStatus::Sent).await;
    assert_eq!(relay.attempts().await, 1);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_is_returned() {
    struct DownBroker;

    #[async_trait]
    impl MessageBroker for DownBroker {
        async fn publish(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<(), AppError> {
            Err(AppError::Broker("down".to_string()))
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _group_id: &str,
            _cancel: CancellationToken,
        ) -> Result<tokio::sync::mpsc::Receiver<BrokerMessage>, AppError> {
            Err(AppError::Broker("down".to_string()))
        }
    }

    let h = harness();
    let consumer = EmailConsumer::new(
        Arc::new(DownBroker),
        h.pipeline(Arc::new(ScriptedRelay::always_ok())),
        TOPIC,
        GROUP,
        1,
    );

    assert!(matches!(consumer.start().await, Err(AppError::Broker(_))));
    consumer.stop().await;
}
