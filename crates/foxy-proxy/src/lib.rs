pub mod config;
pub mod http;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use libfoxy::monitor::watch_upstream;
use libfoxy::{Dispatcher, TokenService, UpstreamProvider, token_service};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;

/// A running proxy: both front ends, the worker pool and the upstream
/// monitor.
pub struct Proxy {
    pub tcp_addr: SocketAddr,
    pub http_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    servers: Vec<JoinHandle<()>>,
    responder: JoinHandle<()>,
}

impl Proxy {
    pub async fn start(cfg: &RuntimeConfig, provider: Arc<dyn UpstreamProvider>) -> Result<Self> {
        let service: Arc<dyn TokenService> = token_service(cfg.provider, cfg.csp.clone());
        let (dispatcher, results) =
            Dispatcher::new(Arc::clone(&service), Arc::clone(&provider), cfg.pool.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tcp_listener = TcpListener::bind(cfg.tcp_listen)
            .await
            .with_context(|| format!("failed to bind tcp listener on {}", cfg.tcp_listen))?;
        let http_listener = TcpListener::bind(cfg.http_listen)
            .await
            .with_context(|| format!("failed to bind http listener on {}", cfg.http_listen))?;
        let tcp_addr = tcp_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let mut servers = Vec::new();
        servers.push(tokio::spawn(watch_upstream(
            service,
            provider,
            cfg.monitor_interval,
            shutdown_rx.clone(),
        )));

        let tcp_dispatcher = Arc::clone(&dispatcher);
        let tcp_shutdown = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = tcp::accept_loop(tcp_listener, tcp_dispatcher, tcp_shutdown).await {
                warn!("tcp front end stopped: {err}");
            }
        }));

        let app = http::router(Arc::clone(&dispatcher));
        let mut http_shutdown = shutdown_rx;
        servers.push(tokio::spawn(async move {
            let stop = async move {
                while http_shutdown.changed().await.is_ok() {
                    if *http_shutdown.borrow() {
                        break;
                    }
                }
            };
            if let Err(err) = axum::serve(http_listener, app)
                .with_graceful_shutdown(stop)
                .await
            {
                warn!("http front end stopped: {err}");
            }
        }));

        let responder = tokio::spawn(tcp::respond(results));
        info!(tcp = %tcp_addr, http = %http_addr, "foxy proxy listening");

        Ok(Self {
            tcp_addr,
            http_addr,
            dispatcher,
            shutdown_tx,
            servers,
            responder,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop accepting clients, let workers finish admitted work, then stop.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        for server in self.servers {
            if let Err(err) = server.await {
                warn!("front end task failed: {err}");
            }
        }
        self.dispatcher.shutdown().await;
        self.responder.abort();
        info!("foxy proxy stopped");
    }
}
