//! Cache connectivity probe.
//!
//! Loads configuration and runtime capabilities from the environment,
//! connects, performs a write/read round trip and prints the cache stats
//! as JSON.

use std::time::Duration;

use mathilda_cache::telemetry::{init_tracing, TelemetryConfig};
use mathilda_cache::CacheService;
use mathilda_core::{CacheError, MathildaError, MathildaResult};

const PROBE_TTL: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> MathildaResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let service = CacheService::from_env()?;
    tracing::info!(
        backend = ?service.stats().backend,
        url = %service.config().redis.redacted_url(),
        "Starting cache probe"
    );

    service.connect();
    let connect_timeout = service.config().redis.connect_timeout;
    if !service.wait_until_connected(connect_timeout).await {
        tracing::warn!(
            timeout_ms = connect_timeout.as_millis() as u64,
            "Distributed cache not reachable, probing the fallback store"
        );
    }

    let client = service.client();
    let key = client.key_space().api_response("probe", &serde_json::json!({}));
    let written = client.set(key.as_str(), "\"ok\"", Some(PROBE_TTL)).await;
    let read_back = client.get(key.as_str()).await;
    client.del(key.as_str()).await;
    tracing::info!(
        key = %key,
        written,
        round_trip = read_back.as_deref() == Some("\"ok\""),
        "Probe round trip finished"
    );

    let stats = serde_json::to_string_pretty(&service.stats()).map_err(|e| {
        MathildaError::Cache(CacheError::Serialization {
            key: "stats".to_string(),
            reason: e.to_string(),
        })
    })?;
    println!("{}", stats);

    service.disconnect().await;
    Ok(())
}
