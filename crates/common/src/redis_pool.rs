use std::time::Duration;

use redis::Client;
use redis::aio::ConnectionManager;

/// How long to wait for a Redis endpoint to answer `PING` before giving up on it.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Create a Redis connection manager for async operations.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let manager = connect_and_ping(redis_url).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

/// Try each address in order and return the first one that answers `PING`.
///
/// Used for the broker address list, where any reachable node will do.
pub async fn connect_first_reachable(urls: &[String]) -> anyhow::Result<ConnectionManager> {
    let mut last_err = None;

    for url in urls {
        match connect_and_ping(url).await {
            Ok(manager) => {
                tracing::info!(url = %url, "Connected to broker");
                return Ok(manager);
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Broker address unreachable");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No broker addresses configured")))
}

async fn connect_and_ping(url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(url)?;
    let mut manager = tokio::time::timeout(PING_TIMEOUT, ConnectionManager::new(client))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", url))??;

    let _: String = tokio::time::timeout(PING_TIMEOUT, redis::cmd("PING").query_async(&mut manager))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out pinging {}", url))??;

    Ok(manager)
}
