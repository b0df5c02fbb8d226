//! Recipient directory: the full registered-user population a campaign fans out to.

use async_trait::async_trait;
use sqlx::PgPool;

use postbox_common::error::AppError;

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Every registered user's email address.
    async fn all_user_emails(&self) -> Result<Vec<String>, AppError>;
}

/// Reads addresses from the `users` table, skipping users without one.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for PgUserDirectory {
    async fn all_user_emails(&self) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT email FROM users
            WHERE email IS NOT NULL AND email <> ''
            ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(email,)| email).collect())
    }
}
