use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use foxy_proxy::Proxy;
use foxy_proxy::config::{Args, load_runtime_config};
use libfoxy::HttpUpstream;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foxy_proxy=info,libfoxy=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;

    let upstream = HttpUpstream::new(&cfg.upstream_url, cfg.upstream_token.clone())
        .with_context(|| format!("failed to set up upstream {}", cfg.upstream_url))?;
    info!(
        "foxy-proxy started pid={} upstream={} provider={}",
        std::process::id(),
        cfg.upstream_url,
        cfg.provider
    );

    let proxy = Proxy::start(&cfg, Arc::new(upstream)).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    proxy.shutdown().await;
    Ok(())
}
