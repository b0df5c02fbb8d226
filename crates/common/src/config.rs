use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string for the dedup cache
    pub redis_url: String,

    /// Broker address list. Empty means no broker is configured, in which case
    /// the consumer and scheduler stay down and the producer refuses to queue.
    pub broker_urls: Vec<String>,

    /// Topic outbound emails are published to (default: `email-notifications`)
    pub email_topic: String,

    /// Consumer group the email consumer joins (default: `email-service-group`)
    pub consumer_group: String,

    /// Maximum number of messages the consumer delivers concurrently (default: 4)
    pub consumer_workers: usize,

    /// Mail relay settings
    pub smtp: SmtpConfig,

    /// HTTP listen port for the API server (default: 3000)
    pub api_port: u16,
}

/// Mail relay connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Default sender when a message carries no override
    pub from: Option<String>,
    pub use_tls: bool,
}

pub const DEFAULT_EMAIL_TOPIC: &str = "email-notifications";
pub const DEFAULT_CONSUMER_GROUP: &str = "email-service-group";

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let smtp_username = std::env::var("SMTP_USERNAME").ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            broker_urls: std::env::var("BROKER_URLS")
                .map(|raw| parse_address_list(&raw))
                .unwrap_or_default(),
            email_topic: std::env::var("EMAIL_TOPIC")
                .unwrap_or_else(|_| DEFAULT_EMAIL_TOPIC.to_string()),
            consumer_group: std::env::var("EMAIL_CONSUMER_GROUP")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_workers: std::env::var("EMAIL_CONSUMER_WORKERS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or_else(|| {
                    anyhow::anyhow!("EMAIL_CONSUMER_WORKERS must be a positive integer")
                })?,
            smtp: SmtpConfig {
                host: std::env::var("SMTP_HOST").ok().filter(|h| !h.is_empty()),
                port: std::env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse()
                    .map_err(|_| anyhow::anyhow!("SMTP_PORT must be a valid u16"))?,
                from: std::env::var("SMTP_FROM").ok().or_else(|| smtp_username.clone()),
                username: smtp_username,
                password: std::env::var("SMTP_PASSWORD").ok(),
                use_tls: std::env::var("SMTP_USE_TLS")
                    .map(|v| !v.eq_ignore_ascii_case("false"))
                    .unwrap_or(true),
            },
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("API_PORT must be a valid u16"))?,
        })
    }

    /// Whether a message broker is configured at all.
    pub fn broker_configured(&self) -> bool {
        !self.broker_urls.is_empty()
    }
}

/// Split a comma-separated address list, dropping blanks.
fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
