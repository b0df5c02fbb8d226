//! Email producer: validates send requests and hands them to the broker.
//!
//! For each request:
//! 1. Validate recipients, subject and body/template (nothing is persisted on failure)
//! 2. Persist a `pending` log record
//! 3. Consult the dedup cache; a hit returns `duplicate` without publishing
//! 4. Publish the wire message keyed by the email id, then mark the log `queued`
//!
//! Publish and persistence failures go back to the caller; nothing is retried here.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{
    EmailLogPage, EmailMessage, EmailResponse, EmailStatus, MAX_RETRIES, Page, Priority,
    QueueStatus, QueuedEmail,
};

use crate::broker::MessageBroker;
use crate::dedup::{DEDUP_TTL, DedupCache, DedupKey};
use crate::email_log::EmailLogStore;
use crate::templates::TemplateRegistry;

/// A request to send one email.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Sender override
    #[serde(default)]
    pub from: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_data: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendBulkEmailRequest {
    pub emails: Vec<SendEmailRequest>,
}

pub struct EmailProducer {
    logs: Arc<dyn EmailLogStore>,
    cache: Arc<dyn DedupCache>,
    /// `None` when no broker is configured; queueing is refused in that case.
    broker: Option<Arc<dyn MessageBroker>>,
    templates: Arc<TemplateRegistry>,
    topic: String,
}

impl EmailProducer {
    pub fn new(
        logs: Arc<dyn EmailLogStore>,
        cache: Arc<dyn DedupCache>,
        broker: Option<Arc<dyn MessageBroker>>,
        templates: Arc<TemplateRegistry>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            logs,
            cache,
            broker,
            templates,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker_configured(&self) -> bool {
        self.broker.is_some()
    }

    /// Queue a single email for delivery.
    pub async fn queue_email(&self, request: &SendEmailRequest) -> Result<EmailResponse, AppError> {
        self.validate(request)?;

        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("Message broker is not configured".to_string()))?;

        let message = self.build_message(request)?;
        self.logs.save(&message).await?;

        let key = DedupKey::for_message(&message.to, &message.subject)
            .ok_or_else(|| AppError::Internal("Validated email has no recipient".to_string()))?;

        if self.is_duplicate(&key, message.id).await {
            tracing::debug!(email_id = %message.id, "Email suppressed as duplicate");
            return Ok(EmailResponse {
                id: Some(message.id),
                status: QueueStatus::Duplicate,
                message: "Email already sent recently".to_string(),
            });
        }

        let payload = match serde_json::to_vec(&QueuedEmail::from_message(&message, Utc::now())) {
            Ok(payload) => payload,
            Err(e) => {
                self.release_claim(&key).await;
                return Err(e.into());
            }
        };

        if let Err(e) = broker
            .publish(&self.topic, &message.id.to_string(), &payload)
            .await
        {
            self.release_claim(&key).await;
            return Err(e);
        }

        if let Err(e) = self
            .logs
            .update_status(message.id, EmailStatus::Queued, None)
            .await
        {
            tracing::warn!(email_id = %message.id, error = %e, "Failed to mark email queued");
        }

        tracing::info!(
            email_id = %message.id,
            recipients = message.to.len(),
            priority = %message.priority,
            "Email queued"
        );

        Ok(EmailResponse {
            id: Some(message.id),
            status: QueueStatus::Queued,
            message: "Email queued successfully".to_string(),
        })
    }

    /// Queue each email independently; one failure does not stop the batch.
    pub async fn queue_bulk_emails(&self, request: &SendBulkEmailRequest) -> Vec<EmailResponse> {
        let mut responses = Vec::with_capacity(request.emails.len());

        for email in &request.emails {
            let response = match self.queue_email(email).await {
                Ok(response) => response,
                Err(e) => EmailResponse {
                    id: None,
                    status: QueueStatus::Failed,
                    message: e.to_string(),
                },
            };
            responses.push(response);
        }

        responses
    }

    pub async fn get_email_logs(&self, page: Page) -> Result<EmailLogPage, AppError> {
        let page = page.normalized();
        let (emails, total) = self.logs.list_paged(page).await?;

        Ok(EmailLogPage {
            emails,
            total,
            page: page.page,
            limit: page.limit,
            total_pages: page.total_pages(total),
        })
    }

    pub async fn get_email(&self, id: Uuid) -> Result<EmailMessage, AppError> {
        self.logs
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Email {} not found", id)))
    }

    fn validate(&self, request: &SendEmailRequest) -> Result<(), AppError> {
        if request.to.is_empty() {
            return Err(AppError::Validation(
                "At least one recipient is required".to_string(),
            ));
        }

        for address in request.to.iter().chain(&request.cc).chain(&request.bcc) {
            if !looks_like_address(address) {
                return Err(AppError::Validation(format!(
                    "Invalid email address '{}'",
                    address
                )));
            }
        }

        if request.subject.trim().is_empty() {
            return Err(AppError::Validation("Subject is required".to_string()));
        }

        match &request.template {
            Some(name) if !self.templates.contains(name) => {
                return Err(AppError::Validation(format!("Unknown template '{}'", name)));
            }
            Some(_) => {}
            None if is_blank(&request.body) && is_blank(&request.html_body) => {
                return Err(AppError::Validation(
                    "Either a body, an HTML body or a template is required".to_string(),
                ));
            }
            None => {}
        }

        Ok(())
    }

    fn build_message(&self, request: &SendEmailRequest) -> Result<EmailMessage, AppError> {
        let template_data = request
            .template_data
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));

        let html_body = match (&request.template, is_blank(&request.html_body)) {
            (Some(name), true) => Some(self.templates.render(name, &template_data)?),
            _ => request.html_body.clone(),
        };

        let now = Utc::now();
        Ok(EmailMessage {
            id: Uuid::new_v4(),
            to: request.to.clone(),
            cc: request.cc.clone(),
            bcc: request.bcc.clone(),
            from: request.from.clone().filter(|f| !f.trim().is_empty()),
            subject: request.subject.clone(),
            body: request.body.clone(),
            html_body,
            template: request.template.clone(),
            template_data,
            priority: request.priority.unwrap_or_default(),
            status: EmailStatus::Pending,
            retry_count: 0,
            max_retries: MAX_RETRIES,
            sent_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// A request is a duplicate if the pair was already delivered or another
    /// request currently holds the queue claim. Cache errors fail open.
    async fn is_duplicate(&self, key: &DedupKey, email_id: Uuid) -> bool {
        match self.cache.exists(&key.sent_key()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => tracing::warn!(email_id = %email_id, error = %e, "Dedup cache check failed"),
        }

        match self
            .cache
            .set_if_absent(&key.claim_key(), &email_id.to_string(), DEDUP_TTL)
            .await
        {
            Ok(claimed) => !claimed,
            Err(e) => {
                tracing::warn!(email_id = %email_id, error = %e, "Dedup cache claim failed");
                false
            }
        }
    }

    async fn release_claim(&self, key: &DedupKey) {
        if let Err(e) = self.cache.delete(&key.claim_key()).await {
            tracing::warn!(error = %e, "Failed to release dedup claim");
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|s| s.trim().is_empty())
}

fn looks_like_address(address: &str) -> bool {
    let address = address.trim();
    match address.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !address.contains(' '),
        None => false,
    }
}
