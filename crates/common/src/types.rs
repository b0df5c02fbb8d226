use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every email gets this many delivery attempts in total.
pub const MAX_RETRIES: i32 = 3;

/// Lifecycle of a single outbound email log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Queued,
    Sent,
    Failed,
}

impl EmailStatus {
    /// Statuses a record may hold for an update to `self` to be applied.
    ///
    /// `failed` is terminal, and a late `queued` never overwrites `sent`.
    pub fn allowed_predecessors(self) -> &'static [EmailStatus] {
        match self {
            EmailStatus::Pending => &[],
            EmailStatus::Queued => &[EmailStatus::Pending],
            EmailStatus::Sent | EmailStatus::Failed => &[EmailStatus::Pending, EmailStatus::Queued],
        }
    }

    pub fn can_follow(self, current: EmailStatus) -> bool {
        self.allowed_predecessors().contains(&current)
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailStatus::Pending => write!(f, "pending"),
            EmailStatus::Queued => write!(f, "queued"),
            EmailStatus::Sent => write!(f, "sent"),
            EmailStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Delivery priority carried through the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A logged outbound email.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub id: Uuid,
    #[sqlx(rename = "to_addresses")]
    pub to: Vec<String>,
    #[sqlx(rename = "cc_addresses")]
    pub cc: Vec<String>,
    #[sqlx(rename = "bcc_addresses")]
    pub bcc: Vec<String>,
    /// Sender override; the relay's default sender is used when absent
    #[sqlx(rename = "from_address")]
    pub from: Option<String>,
    pub subject: String,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub template: Option<String>,
    pub template_data: serde_json::Value,
    pub priority: Priority,
    pub status: EmailStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-request outcome reported back to a queue-email caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Duplicate,
    Failed,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Queued => write!(f, "queued"),
            QueueStatus::Duplicate => write!(f, "duplicate"),
            QueueStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailResponse {
    /// Absent when the request failed before a log record was written
    pub id: Option<Uuid>,
    pub status: QueueStatus,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub message: String,
}

/// Wire format published to the broker, keyed by `email_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEmail {
    pub email_id: Uuid,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

impl QueuedEmail {
    pub fn from_message(message: &EmailMessage, timestamp: DateTime<Utc>) -> Self {
        Self {
            email_id: message.id,
            to: message.to.clone(),
            cc: message.cc.clone(),
            bcc: message.bcc.clone(),
            from: message.from.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            html_body: message.html_body.clone(),
            priority: message.priority,
            timestamp,
        }
    }
}

/// Lifecycle of a scheduled broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Pending => write!(f, "pending"),
            CampaignStatus::Processing => write!(f, "processing"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Failed => write!(f, "failed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A scheduled email campaign.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub subject: String,
    pub html_body: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: CampaignStatus,
    /// Non-empty puts the campaign in test mode
    pub test_emails: Vec<String>,
    pub total_emails: i32,
    pub sent_emails: i32,
    pub failed_emails: i32,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Campaign {
    pub fn is_test_mode(&self) -> bool {
        !self.test_emails.is_empty()
    }
}

/// Field changes applied to a pending campaign. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CampaignChanges {
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub test_emails: Option<Vec<String>>,
}

impl CampaignChanges {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none()
            && self.html_body.is_none()
            && self.scheduled_at.is_none()
            && self.test_emails.is_none()
    }

    pub fn apply_to(&self, campaign: &mut Campaign) {
        if let Some(subject) = &self.subject {
            campaign.subject = subject.clone();
        }
        if let Some(html_body) = &self.html_body {
            campaign.html_body = html_body.clone();
        }
        if let Some(scheduled_at) = self.scheduled_at {
            campaign.scheduled_at = scheduled_at;
        }
        if let Some(test_emails) = &self.test_emails {
            campaign.test_emails = test_emails.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignResponse {
    pub id: Uuid,
    pub subject: String,
    pub html_body: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: CampaignStatus,
    pub test_mode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_emails: Vec<String>,
    pub total_emails: i32,
    pub sent_emails: i32,
    pub failed_emails: i32,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Campaign> for CampaignResponse {
    fn from(c: Campaign) -> Self {
        Self {
            test_mode: c.is_test_mode(),
            id: c.id,
            subject: c.subject,
            html_body: c.html_body,
            scheduled_at: c.scheduled_at,
            status: c.status,
            test_emails: c.test_emails,
            total_emails: c.total_emails,
            sent_emails: c.sent_emails,
            failed_emails: c.failed_emails,
            created_by: c.created_by,
            created_at: c.created_at,
            updated_at: c.updated_at,
            processed_at: c.processed_at,
            error: c.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignListResponse {
    pub campaigns: Vec<CampaignResponse>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailLogPage {
    pub emails: Vec<EmailMessage>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

/// 1-based page request, clamped to sane bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default = "Page::default_page")]
    pub page: i64,
    #[serde(default = "Page::default_limit")]
    pub limit: i64,
}

impl Page {
    pub const MAX_LIMIT: i64 = 100;

    fn default_page() -> i64 {
        1
    }

    fn default_limit() -> i64 {
        10
    }

    pub fn new(page: i64, limit: i64) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    /// Re-apply bounds to a page that came off the wire.
    pub fn normalized(self) -> Self {
        Self::new(self.page, self.limit)
    }

    /// Rows to skip. Saturates for absurd page numbers; the query just comes back empty.
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn total_pages(&self, total: i64) -> i64 {
        (total + self.limit - 1) / self.limit
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::default_page(), Self::default_limit())
    }
}
