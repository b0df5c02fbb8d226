//! Producer and campaign orchestrator tests against the in-memory backends.
//!
//! ```bash
//! cargo test -p postbox-engine --test pipeline
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{
    Campaign, CampaignStatus, EmailStatus, Page, QueueStatus, QueuedEmail,
};
use postbox_engine::campaign::{CampaignService, CreateCampaignParams, UpdateCampaignParams};
use postbox_engine::dedup::{DedupCache, DedupKey};
use postbox_engine::memory::{
    InMemoryBroker, InMemoryCampaignStore, InMemoryDedupCache, InMemoryEmailLogStore,
};
use postbox_engine::producer::{EmailProducer, SendBulkEmailRequest, SendEmailRequest};
use postbox_engine::templates::TemplateRegistry;

const TOPIC: &str = "email-notifications";

// ============================================================
// Shared helpers
// ============================================================

struct Harness {
    logs: Arc<InMemoryEmailLogStore>,
    cache: Arc<InMemoryDedupCache>,
    broker: Arc<InMemoryBroker>,
    campaigns: Arc<InMemoryCampaignStore>,
    producer: Arc<EmailProducer>,
    service: CampaignService,
}

fn harness() -> Harness {
    harness_with(InMemoryBroker::new())
}

fn harness_with(broker: InMemoryBroker) -> Harness {
    let logs = Arc::new(InMemoryEmailLogStore::new());
    let cache = Arc::new(InMemoryDedupCache::new());
    let broker = Arc::new(broker);
    let campaigns = Arc::new(InMemoryCampaignStore::new());

    let producer = Arc::new(EmailProducer::new(
        logs.clone(),
        cache.clone(),
        Some(broker.clone()),
        Arc::new(TemplateRegistry::with_builtin()),
        TOPIC,
    ));
    let service = CampaignService::new(campaigns.clone(), producer.clone());

    Harness {
        logs,
        cache,
        broker,
        campaigns,
        producer,
        service,
    }
}

fn email(to: &str, subject: &str) -> SendEmailRequest {
    SendEmailRequest {
        to: vec![to.to_string()],
        subject: subject.to_string(),
        html_body: Some("<p>hi</p>".to_string()),
        ..Default::default()
    }
}

/// A pending campaign that is already due.
fn due_campaign(test_emails: &[&str]) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        subject: "Launch".to_string(),
        html_body: "<p>We launched</p>".to_string(),
        scheduled_at: now - Duration::minutes(1),
        status: CampaignStatus::Pending,
        test_emails: test_emails.iter().map(ToString::to_string).collect(),
        total_emails: 0,
        sent_emails: 0,
        failed_emails: 0,
        created_by: None,
        created_at: now,
        updated_at: now,
        processed_at: None,
        error: None,
    }
}

fn users(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("user{}@example.com", i)).collect()
}

// ============================================================
// Producer
// ============================================================

#[tokio::test]
async fn test_queue_email_publishes_once() {
    let h = harness();

    let response = h
        .producer
        .queue_email(&email("a@x.com", "Hello"))
        .await
        .unwrap();

    assert_eq!(response.status, QueueStatus::Queued);
    let id = response.id.unwrap();

    let published = h.broker.published(TOPIC).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, id.to_string());

    let wire: QueuedEmail = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(wire.email_id, id);
    assert_eq!(wire.to, vec!["a@x.com".to_string()]);
    assert_eq!(wire.subject, "Hello");

    let record = h.producer.get_email(id).await.unwrap();
    assert_eq!(record.status, EmailStatus::Queued);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.max_retries, 3);
}

#[tokio::test]
async fn test_second_identical_request_is_duplicate() {
    let h = harness();

    let first = h
        .producer
        .queue_email(&email("a@x.com", "Hello"))
        .await
        .unwrap();
    let second = h
        .producer
        .queue_email(&email("a@x.com", "Hello"))
        .await
        .unwrap();

    assert_eq!(first.status, QueueStatus::Queued);
    assert_eq!(second.status, QueueStatus::Duplicate);
    assert_eq!(h.broker.published(TOPIC).await.len(), 1);

    // Both requests are logged; only the first was handed to the broker
    let records = h.logs.all().await;
    assert_eq!(records.len(), 2);
    let dup = records.iter().find(|r| Some(r.id) == second.id).unwrap();
    assert_eq!(dup.status, EmailStatus::Pending);
}

#[tokio::test]
async fn test_already_sent_pair_is_duplicate() {
    let h = harness();
    let key = DedupKey::for_message(&["a@x.com".to_string()], "Hello").unwrap();
    h.cache.set(&key.sent_key(), "1", None).await.unwrap();

    let response = h
        .producer
        .queue_email(&email("a@x.com", "Hello"))
        .await
        .unwrap();

    assert_eq!(response.status, QueueStatus::Duplicate);
    assert!(h.broker.published(TOPIC).await.is_empty());
}

#[tokio::test]
async fn test_different_subject_is_not_duplicate() {
    let h = harness();

    h.producer
        .queue_email(&email("a@x.com", "Hello"))
        .await
        .unwrap();
    let other = h
        .producer
        .queue_email(&email("a@x.com", "Goodbye"))
        .await
        .unwrap();

    assert_eq!(other.status, QueueStatus::Queued);
    assert_eq!(h.broker.published(TOPIC).await.len(), 2);
}

#[tokio::test]
async fn test_invalid_requests_persist_nothing() {
    let h = harness();

    let cases = [
        SendEmailRequest {
            to: vec![],
            ..email("a@x.com", "Hello")
        },
        email("not-an-address", "Hello"),
        email("a@x.com", "   "),
        SendEmailRequest {
            html_body: None,
            ..email("a@x.com", "Hello")
        },
        SendEmailRequest {
            template: Some("missing".to_string()),
            ..email("a@x.com", "Hello")
        },
    ];

    for request in &cases {
        let result = h.producer.queue_email(request).await;
        assert!(
            matches!(result, Err(AppError::Validation(_))),
            "expected validation error for {:?}",
            request
        );
    }

    assert!(h.logs.all().await.is_empty());
    assert!(h.broker.published(TOPIC).await.is_empty());
}

#[tokio::test]
async fn test_template_renders_into_html_body() {
    let h = harness();
    let request = SendEmailRequest {
        to: vec!["ada@x.com".to_string()],
        subject: "Welcome aboard".to_string(),
        template: Some("welcome".to_string()),
        template_data: Some(serde_json::json!({"name": "Ada", "login_url": "https://x.com"})),
        ..Default::default()
    };

    let response = h.producer.queue_email(&request).await.unwrap();
    let record = h.producer.get_email(response.id.unwrap()).await.unwrap();

    let html = record.html_body.unwrap();
    assert!(html.contains("Welcome, Ada!"));
    assert_eq!(record.template.as_deref(), Some("welcome"));
}

#[tokio::test]
async fn test_publish_failure_releases_claim() {
    let h = harness_with(InMemoryBroker::rejecting(|_| true));

    let result = h.producer.queue_email(&email("a@x.com", "Hello")).await;
    assert!(matches!(result, Err(AppError::Broker(_))));

    let key = DedupKey::for_message(&["a@x.com".to_string()], "Hello").unwrap();
    assert!(!h.cache.exists(&key.claim_key()).await.unwrap());

    // The record stays pending; it was never handed to the broker
    let records = h.logs.all().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, EmailStatus::Pending);
}

#[tokio::test]
async fn test_no_broker_refuses_before_persisting() {
    let logs = Arc::new(InMemoryEmailLogStore::new());
    let producer = EmailProducer::new(
        logs.clone(),
        Arc::new(InMemoryDedupCache::new()),
        None,
        Arc::new(TemplateRegistry::with_builtin()),
        TOPIC,
    );

    let result = producer.queue_email(&email("a@x.com", "Hello")).await;

    assert!(matches!(result, Err(AppError::Unavailable(_))));
    assert!(logs.all().await.is_empty());
}

#[tokio::test]
async fn test_bulk_reports_each_request() {
    let h = harness();
    let request = SendBulkEmailRequest {
        emails: vec![
            email("a@x.com", "One"),
            email("bad", "Two"),
            email("a@x.com", "One"),
            email("b@x.com", "Three"),
        ],
    };

    let responses = h.producer.queue_bulk_emails(&request).await;
    let statuses: Vec<QueueStatus> = responses.iter().map(|r| r.status).collect();

    assert_eq!(
        statuses,
        vec![
            QueueStatus::Queued,
            QueueStatus::Failed,
            QueueStatus::Duplicate,
            QueueStatus::Queued,
        ]
    );
    assert!(responses[1].id.is_none());
    assert!(!responses[1].message.is_empty());
}

#[tokio::test]
async fn test_email_logs_are_paged_newest_first() {
    let h = harness();
    for i in 0..12 {
        h.producer
            .queue_email(&email("a@x.com", &format!("Subject {}", i)))
            .await
            .unwrap();
    }

    let first = h.producer.get_email_logs(Page::new(1, 5)).await.unwrap();
    assert_eq!(first.total, 12);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.emails.len(), 5);
    assert!(first.emails[0].created_at >= first.emails[4].created_at);

    let last = h.producer.get_email_logs(Page::new(3, 5)).await.unwrap();
    assert_eq!(last.emails.len(), 2);
}

#[tokio::test]
async fn test_get_unknown_email_is_not_found() {
    let h = harness();
    let result = h.producer.get_email(Uuid::new_v4()).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

// ============================================================
// Campaigns
// ============================================================

#[tokio::test]
async fn test_create_campaign_in_the_past_persists_nothing() {
    let h = harness();
    let params = CreateCampaignParams {
        subject: "Launch".to_string(),
        html_body: "<p>hi</p>".to_string(),
        scheduled_at: Utc::now().timestamp() - 60,
        test_emails: vec![],
    };

    let result = h.service.create_campaign(&params, None).await;

    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(h.campaigns.all().await.is_empty());
}

#[tokio::test]
async fn test_create_campaign_is_pending() {
    let h = harness();
    let creator = Uuid::new_v4();
    let params = CreateCampaignParams {
        subject: "Launch".to_string(),
        html_body: "<p>hi</p>".to_string(),
        scheduled_at: Utc::now().timestamp() + 3600,
        test_emails: vec!["qa@x.com".to_string()],
    };

    let created = h.service.create_campaign(&params, Some(creator)).await.unwrap();

    assert_eq!(created.status, CampaignStatus::Pending);
    assert!(created.test_mode);
    assert_eq!(created.created_by, Some(creator));
    assert_eq!(created.total_emails, 0);

    let fetched = h.service.get_campaign(created.id).await.unwrap();
    assert_eq!(fetched.subject, "Launch");
}

#[tokio::test]
async fn test_process_test_mode_campaign_uses_test_emails() {
    let h = harness();
    let campaign = due_campaign(&["qa1@x.com", "qa2@x.com"]);
    h.campaigns.insert(campaign.clone()).await;

    let outcome = h
        .service
        .process_campaign(&campaign, &users(50))
        .await
        .unwrap();

    assert_eq!(outcome.status, CampaignStatus::Completed);
    assert_eq!((outcome.total, outcome.sent, outcome.failed), (2, 2, 0));
    assert_eq!(h.broker.published(TOPIC).await.len(), 2);

    let stored = h.service.get_campaign(campaign.id).await.unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.sent_emails, 2);
    assert!(stored.processed_at.is_some());
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn test_process_campaign_fans_out_to_every_user() {
    let h = harness();
    let campaign = due_campaign(&[]);
    h.campaigns.insert(campaign.clone()).await;

    let outcome = h
        .service
        .process_campaign(&campaign, &users(50))
        .await
        .unwrap();

    assert_eq!((outcome.total, outcome.sent, outcome.failed), (50, 50, 0));
    assert_eq!(h.broker.published(TOPIC).await.len(), 50);
    assert_eq!(h.logs.all().await.len(), 50);
}

#[tokio::test]
async fn test_process_campaign_partial_failure_completes_with_error() {
    let h = harness_with(InMemoryBroker::rejecting(|payload| {
        serde_json::from_slice::<QueuedEmail>(payload)
            .map(|m| m.to[0].starts_with("user1@"))
            .unwrap_or(false)
    }));
    let campaign = due_campaign(&[]);
    h.campaigns.insert(campaign.clone()).await;

    let outcome = h
        .service
        .process_campaign(&campaign, &users(3))
        .await
        .unwrap();

    assert_eq!(outcome.status, CampaignStatus::Completed);
    assert_eq!((outcome.total, outcome.sent, outcome.failed), (3, 2, 1));

    let stored = h.service.get_campaign(campaign.id).await.unwrap();
    assert_eq!(stored.error.as_deref(), Some("1 emails failed to queue"));
    assert_eq!(stored.sent_emails + stored.failed_emails, stored.total_emails);
}

#[tokio::test]
async fn test_process_campaign_all_failures_marks_failed() {
    let h = harness_with(InMemoryBroker::rejecting(|_| true));
    let campaign = due_campaign(&["qa1@x.com", "qa2@x.com", "qa3@x.com"]);
    h.campaigns.insert(campaign.clone()).await;

    let outcome = h.service.process_campaign(&campaign, &[]).await.unwrap();

    assert_eq!(outcome.status, CampaignStatus::Failed);
    assert_eq!((outcome.total, outcome.sent, outcome.failed), (3, 0, 3));

    let stored = h.service.get_campaign(campaign.id).await.unwrap();
    assert_eq!(stored.status, CampaignStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("All emails failed to queue"));
}

#[tokio::test]
async fn test_process_campaign_without_recipients_completes() {
    let h = harness();
    let campaign = due_campaign(&[]);
    h.campaigns.insert(campaign.clone()).await;

    let outcome = h.service.process_campaign(&campaign, &[]).await.unwrap();

    assert_eq!(outcome.status, CampaignStatus::Completed);
    assert_eq!(outcome.total, 0);
}

#[tokio::test]
async fn test_process_campaign_twice_is_rejected() {
    let h = harness();
    let campaign = due_campaign(&["qa@x.com"]);
    h.campaigns.insert(campaign.clone()).await;

    h.service.process_campaign(&campaign, &[]).await.unwrap();
    let again = h.service.process_campaign(&campaign, &[]).await;

    assert!(matches!(again, Err(AppError::InvalidState(_))));
    assert_eq!(h.broker.published(TOPIC).await.len(), 1);
}

#[tokio::test]
async fn test_cancel_only_pending() {
    let h = harness();
    let pending = due_campaign(&[]);
    let done = Campaign {
        status: CampaignStatus::Completed,
        ..due_campaign(&[])
    };
    h.campaigns.insert(pending.clone()).await;
    h.campaigns.insert(done.clone()).await;

    h.service.cancel_campaign(pending.id).await.unwrap();
    let stored = h.service.get_campaign(pending.id).await.unwrap();
    assert_eq!(stored.status, CampaignStatus::Cancelled);

    assert!(matches!(
        h.service.cancel_campaign(done.id).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        h.service.cancel_campaign(pending.id).await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        h.service.cancel_campaign(Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));

    // Cancelled campaigns are never picked up
    assert!(
        h.service
            .get_pending_campaigns(Utc::now())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_update_pending_campaign() {
    let h = harness();
    let campaign = due_campaign(&[]);
    h.campaigns.insert(campaign.clone()).await;

    let later = Utc::now().timestamp() + 7200;
    let updated = h
        .service
        .update_campaign(
            campaign.id,
            &UpdateCampaignParams {
                subject: Some("Relaunch".to_string()),
                scheduled_at: Some(later),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.subject, "Relaunch");
    assert_eq!(updated.scheduled_at.timestamp(), later);
    assert_eq!(updated.html_body, campaign.html_body);
}

#[tokio::test]
async fn test_update_rejects_past_schedule_and_non_pending() {
    let h = harness();
    let pending = due_campaign(&[]);
    let processing = Campaign {
        status: CampaignStatus::Processing,
        ..due_campaign(&[])
    };
    h.campaigns.insert(pending.clone()).await;
    h.campaigns.insert(processing.clone()).await;

    let past = UpdateCampaignParams {
        scheduled_at: Some(Utc::now().timestamp() - 10),
        ..Default::default()
    };
    assert!(matches!(
        h.service.update_campaign(pending.id, &past).await,
        Err(AppError::Validation(_))
    ));

    let rename = UpdateCampaignParams {
        subject: Some("Nope".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        h.service.update_campaign(processing.id, &rename).await,
        Err(AppError::InvalidState(_))
    ));

    let stored = h.service.get_campaign(pending.id).await.unwrap();
    assert_eq!(stored.scheduled_at, pending.scheduled_at);
}

#[tokio::test]
async fn test_pending_campaigns_are_due_and_oldest_first() {
    let h = harness();
    let older = Campaign {
        scheduled_at: Utc::now() - Duration::hours(2),
        ..due_campaign(&[])
    };
    let newer = due_campaign(&[]);
    let future = Campaign {
        scheduled_at: Utc::now() + Duration::hours(1),
        ..due_campaign(&[])
    };
    h.campaigns.insert(newer.clone()).await;
    h.campaigns.insert(future).await;
    h.campaigns.insert(older.clone()).await;

    let due = h.service.get_pending_campaigns(Utc::now()).await.unwrap();
    let ids: Vec<Uuid> = due.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![older.id, newer.id]);
}

#[tokio::test]
async fn test_list_campaigns_pages() {
    let h = harness();
    for _ in 0..3 {
        h.campaigns.insert(due_campaign(&[])).await;
    }

    let page = h.service.list_campaigns(Page::new(1, 2)).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.campaigns.len(), 2);
}
