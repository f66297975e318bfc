//! Entry point: wires configuration, the rate-limit store and scheduler,
//! the upstream client cache, and the generation pipeline behind the HTTP
//! surface. Boot sequence: init tracing, load config, construct the
//! shared state, then serve.

mod classifier;
mod clients;
mod config;
mod fingerprint;
mod pipeline;
mod ratelimit;
mod server;
mod upstream;

use std::sync::Arc;

use config::Config;
use ratelimit::{KeyScheduler, RateLimitStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "imagegate=info".into()))
        .with_target(false)
        .init();

    let config = Arc::new(Config::from_env());
    tracing::info!(
        auth_mode = ?config.effective_auth_mode(),
        rate_limiting_active = config.rate_limiting_active(),
        key_pool_size = config.api_key_pool().len(),
        port = config.port,
        "starting imagegate"
    );

    let store = Arc::new(RateLimitStore::open(config.rate_limit_state_path.clone(), config.retry_after_seconds));
    let scheduler = Arc::new(KeyScheduler::new(store.clone()));
    let clients = Arc::new(clients::ClientCache::new(config.http_timeout_ms));
    let pipeline = Arc::new(pipeline::Pipeline::new(config.clone(), scheduler, clients));

    let state = Arc::new(server::AppState { config: config.clone(), store, pipeline });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
