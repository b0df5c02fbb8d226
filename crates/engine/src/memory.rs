//! In-memory backends for every port.
//!
//! Used by the test suites and for running the pipeline without Postgres or
//! Redis. Cache expiry uses `tokio::time`, so paused-clock tests see TTLs move.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{
    Campaign, CampaignChanges, CampaignStatus, EmailMessage, EmailStatus, Page,
};

use crate::broker::{BrokerMessage, MessageBroker};
use crate::campaign_store::CampaignStore;
use crate::dedup::DedupCache;
use crate::email_log::EmailLogStore;

const SUBSCRIBER_BUFFER: usize = 1024;

// ============================================================
// Dedup cache
// ============================================================

#[derive(Default)]
pub struct InMemoryDedupCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl InMemoryDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &(String, Option<Instant>)) -> bool {
        entry.1.is_none_or(|expires| Instant::now() < expires)
    }
}

#[async_trait]
impl DedupCache for InMemoryDedupCache {
    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(Self::live) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if Self::live(entry) => Ok(Some(entry.0.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

// ============================================================
// Broker
// ============================================================

type RejectFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Default)]
struct Topic {
    published: Vec<BrokerMessage>,
    subscribers: Vec<mpsc::Sender<BrokerMessage>>,
}

/// Broker that keeps every published message and fans it out to subscribers.
///
/// A new subscriber first receives everything already published to its topic.
/// Consumer groups are not modelled.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
    reject: Option<RejectFn>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that fails any publish whose payload matches `predicate`.
    pub fn rejecting(predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self {
            topics: Mutex::default(),
            reject: Some(Box::new(predicate)),
        }
    }

    pub async fn published(&self, topic: &str) -> Vec<BrokerMessage> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), AppError> {
        if self.reject.as_ref().is_some_and(|reject| reject(payload)) {
            return Err(AppError::Broker(format!("publish to {} rejected", topic)));
        }

        let message = BrokerMessage {
            key: key.to_string(),
            payload: payload.to_vec(),
        };

        let mut topics = self.topics.lock().await;
        let topic = topics.entry(topic.to_string()).or_default();
        topic.subscribers.retain(|tx| !tx.is_closed());
        for tx in &topic.subscribers {
            if tx.try_send(message.clone()).is_err() {
                tracing::warn!(key, "In-memory subscriber is full, message dropped");
            }
        }
        topic.published.push(message);

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _group_id: &str,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BrokerMessage>, AppError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut topics = self.topics.lock().await;
        let topic = topics.entry(topic.to_string()).or_default();
        for message in &topic.published {
            tx.try_send(message.clone())
                .map_err(|_| AppError::Broker("subscriber backlog too large".to_string()))?;
        }
        topic.subscribers.push(tx);

        Ok(rx)
    }
}

// ============================================================
// Email log store
// ============================================================

#[derive(Default)]
pub struct InMemoryEmailLogStore {
    records: Mutex<Vec<EmailMessage>>,
}

impl InMemoryEmailLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in insertion order.
    pub async fn all(&self) -> Vec<EmailMessage> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EmailLogStore for InMemoryEmailLogStore {
    async fn save(&self, message: &EmailMessage) -> Result<(), AppError> {
        self.records.lock().await.push(message.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if !status.can_follow(record.status) {
            return Ok(false);
        }

        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        if let Some(error) = error {
            record.error = Some(error.to_string());
        }
        if status == EmailStatus::Sent {
            record.sent_at = Some(now);
        }
        Ok(true)
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<(), AppError> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            record.retry_count = (record.retry_count + 1).min(record.max_retries);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<EmailMessage>, AppError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_paged(&self, page: Page) -> Result<(Vec<EmailMessage>, i64), AppError> {
        let records = self.records.lock().await;
        let mut sorted: Vec<EmailMessage> = records.iter().rev().cloned().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok((paginate(sorted, page), records.len() as i64))
    }
}

// ============================================================
// Campaign store
// ============================================================

#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: Mutex<Vec<Campaign>>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a campaign as-is, bypassing creation rules (e.g. a past schedule).
    pub async fn insert(&self, campaign: Campaign) {
        self.campaigns.lock().await.push(campaign);
    }

    pub async fn all(&self) -> Vec<Campaign> {
        self.campaigns.lock().await.clone()
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn create(&self, campaign: &Campaign) -> Result<(), AppError> {
        self.campaigns.lock().await.push(campaign.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Campaign>, AppError> {
        Ok(self
            .campaigns
            .lock()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update(&self, id: Uuid, changes: &CampaignChanges) -> Result<(), AppError> {
        let mut campaigns = self.campaigns.lock().await;
        if let Some(campaign) = campaigns.iter_mut().find(|c| c.id == id) {
            changes.apply_to(campaign);
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let mut campaigns = self.campaigns.lock().await;
        if let Some(campaign) = campaigns.iter_mut().find(|c| c.id == id) {
            let now = Utc::now();
            campaign.status = status;
            campaign.updated_at = now;
            if let Some(error) = error {
                campaign.error = Some(error.to_string());
            }
            if matches!(status, CampaignStatus::Completed | CampaignStatus::Failed) {
                campaign.processed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool, AppError> {
        let mut campaigns = self.campaigns.lock().await;
        match campaigns.iter_mut().find(|c| c.id == id) {
            Some(campaign) if campaign.status == from => {
                campaign.status = to;
                campaign.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_counts(
        &self,
        id: Uuid,
        total: i32,
        sent: i32,
        failed: i32,
    ) -> Result<(), AppError> {
        let mut campaigns = self.campaigns.lock().await;
        if let Some(campaign) = campaigns.iter_mut().find(|c| c.id == id) {
            campaign.total_emails = total;
            campaign.sent_emails = sent;
            campaign.failed_emails = failed;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_paged(&self, page: Page) -> Result<(Vec<Campaign>, i64), AppError> {
        let campaigns = self.campaigns.lock().await;
        let mut sorted: Vec<Campaign> = campaigns.iter().rev().cloned().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok((paginate(sorted, page), campaigns.len() as i64))
    }

    async fn get_pending(&self, before: DateTime<Utc>) -> Result<Vec<Campaign>, AppError> {
        let mut due: Vec<Campaign> = self
            .campaigns
            .lock()
            .await
            .iter()
            .filter(|c| c.status == CampaignStatus::Pending && c.scheduled_at <= before)
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        Ok(due)
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset().max(0) as usize)
        .take(page.limit.max(0) as usize)
        .collect()
}
