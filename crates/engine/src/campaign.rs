//! Campaign orchestrator: lifecycle of scheduled broadcasts and their fan-out.
//!
//! State machine: `pending → processing → {completed, failed}` and
//! `pending → cancelled`. Only pending campaigns can be edited or cancelled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{
    Campaign, CampaignChanges, CampaignListResponse, CampaignResponse, CampaignStatus, Page,
    Priority,
};

use crate::campaign_store::CampaignStore;
use crate::producer::{EmailProducer, SendEmailRequest};

/// Parameters for creating a new campaign.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignParams {
    pub subject: String,
    pub html_body: String,
    /// Unix timestamp in seconds
    pub scheduled_at: i64,
    #[serde(default)]
    pub test_emails: Vec<String>,
}

/// Parameters for updating a pending campaign.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCampaignParams {
    pub subject: Option<String>,
    pub html_body: Option<String>,
    /// Unix timestamp in seconds
    pub scheduled_at: Option<i64>,
    pub test_emails: Option<Vec<String>>,
}

/// Result of one fan-out run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignOutcome {
    pub status: CampaignStatus,
    pub total: i32,
    pub sent: i32,
    pub failed: i32,
}

pub struct CampaignService {
    store: Arc<dyn CampaignStore>,
    producer: Arc<EmailProducer>,
}

impl CampaignService {
    pub fn new(store: Arc<dyn CampaignStore>, producer: Arc<EmailProducer>) -> Self {
        Self { store, producer }
    }

    /// Create a pending campaign. The scheduled time must be strictly in the future.
    pub async fn create_campaign(
        &self,
        params: &CreateCampaignParams,
        created_by: Option<Uuid>,
    ) -> Result<CampaignResponse, AppError> {
        if params.subject.trim().is_empty() {
            return Err(AppError::Validation("subject is required".to_string()));
        }
        if params.html_body.trim().is_empty() {
            return Err(AppError::Validation("htmlBody is required".to_string()));
        }
        validate_test_emails(&params.test_emails)?;
        let scheduled_at = future_time(params.scheduled_at, Utc::now())?;

        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            subject: params.subject.clone(),
            html_body: params.html_body.clone(),
            scheduled_at,
            status: CampaignStatus::Pending,
            test_emails: params.test_emails.clone(),
            total_emails: 0,
            sent_emails: 0,
            failed_emails: 0,
            created_by,
            created_at: now,
            updated_at: now,
            processed_at: None,
            error: None,
        };

        self.store.create(&campaign).await?;

        tracing::info!(
            campaign_id = %campaign.id,
            scheduled_at = %campaign.scheduled_at.to_rfc3339(),
            test_mode = campaign.is_test_mode(),
            "Campaign created"
        );

        Ok(campaign.into())
    }

    pub async fn get_campaign(&self, id: Uuid) -> Result<CampaignResponse, AppError> {
        Ok(self.load(id).await?.into())
    }

    pub async fn list_campaigns(&self, page: Page) -> Result<CampaignListResponse, AppError> {
        let page = page.normalized();
        let (campaigns, total) = self.store.list_paged(page).await?;

        Ok(CampaignListResponse {
            campaigns: campaigns.into_iter().map(CampaignResponse::from).collect(),
            total,
            page: page.page,
            limit: page.limit,
            total_pages: page.total_pages(total),
        })
    }

    /// Update a pending campaign. Returns it unchanged when no field is set.
    pub async fn update_campaign(
        &self,
        id: Uuid,
        params: &UpdateCampaignParams,
    ) -> Result<CampaignResponse, AppError> {
        let mut campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Pending {
            return Err(AppError::InvalidState(
                "can only update pending campaigns".to_string(),
            ));
        }

        let changes = CampaignChanges {
            subject: params.subject.clone(),
            html_body: params.html_body.clone(),
            scheduled_at: params
                .scheduled_at
                .map(|ts| future_time(ts, Utc::now()))
                .transpose()?,
            test_emails: params.test_emails.clone(),
        };

        if let Some(test_emails) = &changes.test_emails {
            validate_test_emails(test_emails)?;
        }
        if changes.subject.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(AppError::Validation("subject cannot be empty".to_string()));
        }
        if changes.html_body.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(AppError::Validation("htmlBody cannot be empty".to_string()));
        }

        if changes.is_empty() {
            return Ok(campaign.into());
        }

        self.store.update(id, &changes).await?;
        changes.apply_to(&mut campaign);

        tracing::info!(campaign_id = %id, "Campaign updated");

        match self.store.get_by_id(id).await? {
            Some(updated) => Ok(updated.into()),
            None => Ok(campaign.into()),
        }
    }

    /// Cancel a pending campaign.
    pub async fn cancel_campaign(&self, id: Uuid) -> Result<(), AppError> {
        let campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Pending {
            return Err(AppError::InvalidState(format!(
                "can only cancel pending campaigns (campaign is {})",
                campaign.status
            )));
        }

        let cancelled = self
            .store
            .transition_status(id, CampaignStatus::Pending, CampaignStatus::Cancelled)
            .await?;
        if !cancelled {
            return Err(AppError::InvalidState(
                "campaign left pending before it could be cancelled".to_string(),
            ));
        }

        tracing::info!(campaign_id = %id, "Campaign cancelled");
        Ok(())
    }

    /// Pending campaigns due at `now`, oldest schedule first.
    pub async fn get_pending_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>, AppError> {
        self.store.get_pending(now).await
    }

    /// Fan a due campaign out into one queued email per recipient.
    ///
    /// Test-mode campaigns go to their own `test_emails`; everything else goes
    /// to `user_emails`. Recipients are queued one at a time, in order, with
    /// running counters persisted after each. The campaign ends `failed` only
    /// when it had recipients and none of them could be queued.
    pub async fn process_campaign(
        &self,
        campaign: &Campaign,
        user_emails: &[String],
    ) -> Result<CampaignOutcome, AppError> {
        let claimed = self
            .store
            .transition_status(
                campaign.id,
                CampaignStatus::Pending,
                CampaignStatus::Processing,
            )
            .await?;
        if !claimed {
            return Err(AppError::InvalidState(format!(
                "campaign {} is no longer pending",
                campaign.id
            )));
        }

        let recipients: &[String] = if campaign.is_test_mode() {
            tracing::info!(
                campaign_id = %campaign.id,
                recipients = campaign.test_emails.len(),
                "Processing campaign in test mode"
            );
            &campaign.test_emails
        } else {
            tracing::info!(
                campaign_id = %campaign.id,
                recipients = user_emails.len(),
                "Processing campaign"
            );
            user_emails
        };

        let total = i32::try_from(recipients.len())
            .map_err(|_| AppError::Internal("recipient count exceeds i32".to_string()))?;
        self.persist_counts(campaign.id, total, 0, 0).await;

        let mut sent = 0;
        let mut failed = 0;

        for recipient in recipients {
            let request = SendEmailRequest {
                to: vec![recipient.clone()],
                subject: campaign.subject.clone(),
                html_body: Some(campaign.html_body.clone()),
                priority: Some(Priority::Normal),
                ..Default::default()
            };

            match self.producer.queue_email(&request).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(
                        campaign_id = %campaign.id,
                        recipient = %recipient,
                        error = %e,
                        "Failed to queue campaign email"
                    );
                    failed += 1;
                }
            }

            self.persist_counts(campaign.id, total, sent, failed).await;
        }

        let (status, error) = final_status(total, sent, failed);
        self.store
            .update_status(campaign.id, status, error.as_deref())
            .await?;

        tracing::info!(
            campaign_id = %campaign.id,
            status = %status,
            total,
            sent,
            failed,
            "Campaign processed"
        );

        Ok(CampaignOutcome {
            status,
            total,
            sent,
            failed,
        })
    }

    async fn load(&self, id: Uuid) -> Result<Campaign, AppError> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))
    }

    async fn persist_counts(&self, id: Uuid, total: i32, sent: i32, failed: i32) {
        if let Err(e) = self.store.update_counts(id, total, sent, failed).await {
            tracing::warn!(campaign_id = %id, error = %e, "Failed to update campaign counts");
        }
    }
}

/// `failed` only if there were recipients and none succeeded. Any failure
/// still attaches an error message, even to a completed campaign.
fn final_status(total: i32, sent: i32, failed: i32) -> (CampaignStatus, Option<String>) {
    if total > 0 && sent == 0 {
        (
            CampaignStatus::Failed,
            Some("All emails failed to queue".to_string()),
        )
    } else if failed > 0 {
        (
            CampaignStatus::Completed,
            Some(format!("{} emails failed to queue", failed)),
        )
    } else {
        (CampaignStatus::Completed, None)
    }
}

fn future_time(unix_secs: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    let scheduled = DateTime::from_timestamp(unix_secs, 0)
        .ok_or_else(|| AppError::Validation("scheduled_at is out of range".to_string()))?;
    if scheduled <= now {
        return Err(AppError::Validation(
            "scheduled_at must be in the future".to_string(),
        ));
    }
    Ok(scheduled)
}

fn validate_test_emails(test_emails: &[String]) -> Result<(), AppError> {
    match test_emails.iter().find(|e| !e.contains('@') || e.trim().is_empty()) {
        Some(bad) => Err(AppError::Validation(format!(
            "Invalid test email '{}'",
            bad
        ))),
        None => Ok(()),
    }
}
