//! Email log store: durable record of every message the producer accepts.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{EmailMessage, EmailStatus, Page};

#[async_trait]
pub trait EmailLogStore: Send + Sync {
    async fn save(&self, message: &EmailMessage) -> Result<(), AppError>;

    /// Move a record to `status`. Updates that would break status
    /// monotonicity are ignored; returns whether the record changed.
    async fn update_status(
        &self,
        id: Uuid,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Bump the retry counter, saturating at the record's `max_retries`.
    async fn increment_retry_count(&self, id: Uuid) -> Result<(), AppError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<EmailMessage>, AppError>;

    /// Newest first, with the total record count.
    async fn list_paged(&self, page: Page) -> Result<(Vec<EmailMessage>, i64), AppError>;
}

/// PostgreSQL-backed email log store (`email_logs` table).
#[derive(Clone)]
pub struct PgEmailLogStore {
    pool: PgPool,
}

impl PgEmailLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmailLogStore for PgEmailLogStore {
    async fn save(&self, message: &EmailMessage) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO email_logs (
                id, to_addresses, cc_addresses, bcc_addresses, from_address, subject,
                body, html_body, template, template_data, priority, status,
                retry_count, max_retries, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(message.id)
        .bind(&message.to)
        .bind(&message.cc)
        .bind(&message.bcc)
        .bind(&message.from)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(&message.html_body)
        .bind(&message.template)
        .bind(&message.template_data)
        .bind(message.priority.to_string())
        .bind(message.status.to_string())
        .bind(message.retry_count)
        .bind(message.max_retries)
        .bind(&message.error)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EmailStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let predecessors: Vec<String> = status
            .allowed_predecessors()
            .iter()
            .map(ToString::to_string)
            .collect();
        let now = Utc::now();
        let sent_at = (status == EmailStatus::Sent).then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE email_logs
            SET status = $2,
                error = COALESCE($3, error),
                sent_at = COALESCE($4, sent_at),
                updated_at = $5
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(error)
        .bind(sent_at)
        .bind(now)
        .bind(&predecessors)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE email_logs
            SET retry_count = LEAST(retry_count + 1, max_retries), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<EmailMessage>, AppError> {
        let message: Option<EmailMessage> = sqlx::query_as("SELECT * FROM email_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    async fn list_paged(&self, page: Page) -> Result<(Vec<EmailMessage>, i64), AppError> {
        let messages: Vec<EmailMessage> = sqlx::query_as(
            "SELECT * FROM email_logs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM email_logs")
            .fetch_one(&self.pool)
            .await?;

        Ok((messages, total))
    }
}
