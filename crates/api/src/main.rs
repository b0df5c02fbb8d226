//! Postbox API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use postbox_common::config::AppConfig;
use postbox_common::db;
use postbox_common::redis_pool::{connect_first_reachable, create_redis_pool};
use postbox_engine::broker::{MessageBroker, RedisStreamBroker};
use postbox_engine::campaign::CampaignService;
use postbox_engine::campaign_store::PgCampaignStore;
use postbox_engine::dedup::RedisDedupCache;
use postbox_engine::email_log::PgEmailLogStore;
use postbox_engine::producer::EmailProducer;
use postbox_engine::templates::TemplateRegistry;

use postbox_api::routes::create_router;
use postbox_api::state::AppState;

/// Largest accepted request body (bulk sends included).
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("postbox_api=debug,postbox_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Postbox API server...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let broker: Option<Arc<dyn MessageBroker>> = if config.broker_configured() {
        let conn = connect_first_reachable(&config.broker_urls).await?;
        let name = format!("postbox-api-{}", uuid::Uuid::new_v4());
        Some(Arc::new(RedisStreamBroker::new(conn, name)))
    } else {
        tracing::warn!("BROKER_URLS not set, email queueing will be refused");
        None
    };

    let producer = Arc::new(EmailProducer::new(
        Arc::new(PgEmailLogStore::new(pool.clone())),
        Arc::new(RedisDedupCache::new(redis)),
        broker,
        Arc::new(TemplateRegistry::with_builtin()),
        config.email_topic.clone(),
    ));
    let campaigns = Arc::new(CampaignService::new(
        Arc::new(PgCampaignStore::new(pool)),
        producer.clone(),
    ));

    let state = AppState::new(producer, campaigns);

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Postbox API server stopped.");
    Ok(())
}
