//! Campaign store: persistence for scheduled broadcasts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{Campaign, CampaignChanges, CampaignStatus, Page};

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create(&self, campaign: &Campaign) -> Result<(), AppError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Campaign>, AppError>;

    async fn update(&self, id: Uuid, changes: &CampaignChanges) -> Result<(), AppError>;

    /// Unconditionally set the status. Stamps `processed_at` on completed/failed
    /// and records `error` when given.
    async fn update_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
        error: Option<&str>,
    ) -> Result<(), AppError>;

    /// Compare-and-set on the status column. Returns `false` when the campaign
    /// was not in `from` (or does not exist).
    async fn transition_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool, AppError>;

    async fn update_counts(&self, id: Uuid, total: i32, sent: i32, failed: i32)
    -> Result<(), AppError>;

    /// Newest first, with the total record count.
    async fn list_paged(&self, page: Page) -> Result<(Vec<Campaign>, i64), AppError>;

    /// Pending campaigns scheduled at or before `before`, oldest schedule first.
    async fn get_pending(&self, before: DateTime<Utc>) -> Result<Vec<Campaign>, AppError>;
}

/// PostgreSQL-backed campaign store (`email_campaigns` table).
#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn create(&self, campaign: &Campaign) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO email_campaigns (
                id, subject, html_body, scheduled_at, status, test_emails,
                total_emails, sent_emails, failed_emails, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.subject)
        .bind(&campaign.html_body)
        .bind(campaign.scheduled_at)
        .bind(campaign.status.to_string())
        .bind(&campaign.test_emails)
        .bind(campaign.total_emails)
        .bind(campaign.sent_emails)
        .bind(campaign.failed_emails)
        .bind(campaign.created_by)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Campaign>, AppError> {
        let campaign: Option<Campaign> =
            sqlx::query_as("SELECT * FROM email_campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(campaign)
    }

    async fn update(&self, id: Uuid, changes: &CampaignChanges) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE email_campaigns
            SET subject = COALESCE($2, subject),
                html_body = COALESCE($3, html_body),
                scheduled_at = COALESCE($4, scheduled_at),
                test_emails = COALESCE($5, test_emails),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&changes.subject)
        .bind(&changes.html_body)
        .bind(changes.scheduled_at)
        .bind(&changes.test_emails)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let processed_at = matches!(status, CampaignStatus::Completed | CampaignStatus::Failed)
            .then_some(now);

        sqlx::query(
            r#"
            UPDATE email_campaigns
            SET status = $2,
                error = COALESCE($3, error),
                processed_at = COALESCE($4, processed_at),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(error)
        .bind(processed_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE email_campaigns SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_counts(
        &self,
        id: Uuid,
        total: i32,
        sent: i32,
        failed: i32,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE email_campaigns
            SET total_emails = $2, sent_emails = $3, failed_emails = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total)
        .bind(sent)
        .bind(failed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_paged(&self, page: Page) -> Result<(Vec<Campaign>, i64), AppError> {
        let campaigns: Vec<Campaign> = sqlx::query_as(
            "SELECT * FROM email_campaigns ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM email_campaigns")
            .fetch_one(&self.pool)
            .await?;

        Ok((campaigns, total))
    }

    async fn get_pending(&self, before: DateTime<Utc>) -> Result<Vec<Campaign>, AppError> {
        let campaigns: Vec<Campaign> = sqlx::query_as(
            r#"
            SELECT * FROM email_campaigns
            WHERE status = $1 AND scheduled_at <= $2
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(CampaignStatus::Pending.to_string())
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(campaigns)
    }
}
