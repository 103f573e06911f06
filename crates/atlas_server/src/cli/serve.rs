//! `atlas serve` - run the HTTP API until interrupted.

use anyhow::{Context, Result};
use atlas_engine::METRICS;
use atlas_protocol::defaults::{DEFAULT_BIND_ADDR, DEFAULT_RATE_LIMIT_PER_MIN};
use atlas_server::{router, EngineArgs, HttpConfig};
use std::net::SocketAddr;
use tracing::info;

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "ATLAS_BIND", default_value = DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Shared secret required in the X-API-Key header
    #[arg(long, env = "ATLAS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Requests per minute per caller (0 disables)
    #[arg(long, env = "RATE_LIMIT_PER_MIN", default_value_t = DEFAULT_RATE_LIMIT_PER_MIN)]
    pub rate_limit_per_min: u32,
}

pub async fn run(args: ServeArgs, engine: &EngineArgs) -> Result<()> {
    let executor = engine.executor().await?;
    let app = router(
        executor,
        HttpConfig {
            api_key: args.api_key.clone(),
            rate_limit_per_min: args.rate_limit_per_min,
        },
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        auth = args.api_key.is_some(),
        rate_limit_per_min = args.rate_limit_per_min,
        "Atlas API listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    info!("{}", METRICS.snapshot().summary());
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
