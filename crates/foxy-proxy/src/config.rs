use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use libfoxy::{CspConfig, PoolConfig, Provider};
use serde::Deserialize;

const DEFAULT_TCP_LISTEN: &str = "127.0.0.1:4001";
const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:4443";
const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:8080";
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub tcp_listen: SocketAddr,
    pub http_listen: SocketAddr,
    pub upstream_url: String,
    pub upstream_token: Option<String>,
    pub provider: Provider,
    pub monitor_interval: Duration,
    pub pool: PoolConfig,
    pub csp: CspConfig,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    tcp_listen: Option<SocketAddr>,
    http_listen: Option<SocketAddr>,
    upstream_url: Option<String>,
    upstream_token: Option<String>,
    provider: Option<Provider>,
    max_uptime_secs: Option<u64>,
    max_runs: Option<u64>,
    reaction_time_ms: Option<u64>,
    intake_capacity: Option<usize>,
    service_timeout_secs: Option<u64>,
    monitor_interval_secs: Option<u64>,
    max_enum_readers: Option<usize>,
    key_id_limit: Option<u8>,
}

#[derive(Parser, Debug, Default, PartialEq, Eq)]
#[command(author, version, about = "Signing proxy for smart cards behind an upstream APDU service")]
pub struct Args {
    /// TOML config file.
    #[arg(long = "config")]
    pub config_path: Option<PathBuf>,
    #[arg(long)]
    pub tcp_listen: Option<SocketAddr>,
    #[arg(long)]
    pub http_listen: Option<SocketAddr>,
    #[arg(long = "upstream")]
    pub upstream_url: Option<String>,
    /// Card family: ica or postsignum.
    #[arg(long)]
    pub provider: Option<Provider>,
}

pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = if let Some(path) = &args.config_path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        FileConfig::default()
    };

    let tcp_listen = match args.tcp_listen.or(file_cfg.tcp_listen) {
        Some(addr) => addr,
        None => DEFAULT_TCP_LISTEN.parse()?,
    };
    let http_listen = match args.http_listen.or(file_cfg.http_listen) {
        Some(addr) => addr,
        None => DEFAULT_HTTP_LISTEN.parse()?,
    };
    let upstream_url = args
        .upstream_url
        .clone()
        .or(file_cfg.upstream_url)
        .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());

    let defaults = PoolConfig::default();
    let pool = PoolConfig {
        max_uptime: file_cfg
            .max_uptime_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_uptime),
        max_runs: file_cfg.max_runs.unwrap_or(defaults.max_runs),
        reaction_time: file_cfg
            .reaction_time_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.reaction_time),
        intake_capacity: file_cfg.intake_capacity.unwrap_or(defaults.intake_capacity),
        service_timeout: file_cfg
            .service_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.service_timeout),
    };
    let csp_defaults = CspConfig::default();
    let csp = CspConfig {
        key_id_limit: file_cfg.key_id_limit.unwrap_or(csp_defaults.key_id_limit),
        max_enum_readers: file_cfg
            .max_enum_readers
            .unwrap_or(csp_defaults.max_enum_readers),
    };

    Ok(RuntimeConfig {
        tcp_listen,
        http_listen,
        upstream_url,
        upstream_token: file_cfg.upstream_token.filter(|token| !token.is_empty()),
        provider: args.provider.or(file_cfg.provider).unwrap_or_default(),
        monitor_interval: Duration::from_secs(
            file_cfg
                .monitor_interval_secs
                .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS)
                .max(1),
        ),
        pool,
        csp,
    })
}
