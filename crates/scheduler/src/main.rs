use std::sync::Arc;

use postbox_common::config::AppConfig;
use postbox_common::{db, redis_pool};
use postbox_engine::broker::{MessageBroker, RedisStreamBroker};
use postbox_engine::campaign::CampaignService;
use postbox_engine::campaign_store::PgCampaignStore;
use postbox_engine::dedup::RedisDedupCache;
use postbox_engine::email_log::PgEmailLogStore;
use postbox_engine::producer::EmailProducer;
use postbox_engine::templates::TemplateRegistry;
use postbox_notifier::consumer::{DeliveryPipeline, EmailConsumer};
use postbox_notifier::relay::SmtpRelay;
use postbox_scheduler::directory::PgUserDirectory;
use postbox_scheduler::scheduler::CampaignScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "postbox_worker=info,postbox_scheduler=info,postbox_notifier=info,postbox_engine=info"
                    .into()
            }),
        )
        .json()
        .init();

    tracing::info!("Postbox worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    if !config.broker_configured() {
        tracing::warn!("BROKER_URLS not set, email consumer and campaign scheduler are disabled");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Postbox worker stopped.");
        return Ok(());
    }

    let broker_conn = redis_pool::connect_first_reachable(&config.broker_urls).await?;
    let consumer_name = format!("postbox-worker-{}", uuid::Uuid::new_v4());
    let broker: Arc<dyn MessageBroker> =
        Arc::new(RedisStreamBroker::new(broker_conn, consumer_name));

    // Shared singletons, built once
    let templates = Arc::new(TemplateRegistry::with_builtin());
    let logs = Arc::new(PgEmailLogStore::new(pool.clone()));
    let cache = Arc::new(RedisDedupCache::new(redis));
    let producer = Arc::new(EmailProducer::new(
        logs.clone(),
        cache.clone(),
        Some(broker.clone()),
        templates,
        config.email_topic.clone(),
    ));
    let campaigns = Arc::new(CampaignService::new(
        Arc::new(PgCampaignStore::new(pool.clone())),
        producer,
    ));

    let relay = Arc::new(SmtpRelay::from_config(&config.smtp)?);
    let consumer = EmailConsumer::new(
        broker,
        DeliveryPipeline::new(logs, cache, relay),
        config.email_topic.clone(),
        config.consumer_group.clone(),
        config.consumer_workers,
    );
    consumer.start().await?;

    let scheduler = Arc::new(CampaignScheduler::new(
        campaigns,
        Arc::new(PgUserDirectory::new(pool)),
    ));
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    scheduler.stop().await;
    consumer.stop().await;

    tracing::info!("Postbox worker stopped.");
    Ok(())
}
