use std::sync::Arc;

use anyhow::Result;
use libfoxy::codec::{deliver, read_request, reject, tcp_work_item};
use libfoxy::{Dispatcher, WorkResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Accept line-protocol clients until `shutdown_rx` flips to true.
pub async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping tcp accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                debug!(%peer, "tcp client connected");
                tokio::spawn(handle_connection(stream, Arc::clone(&dispatcher)));
            }
        }
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            // The client gets a closed socket; there is no id to answer to.
            warn!("dropping tcp request: {err}");
            return;
        }
    };
    let item = tcp_work_item(request, stream);
    if let Err(rejected) = dispatcher.submit(item).await {
        reject(rejected).await;
    }
}

/// Answer TCP clients from the primary result channel.
pub async fn respond(mut results: mpsc::Receiver<WorkResult>) {
    while let Some(result) = results.recv().await {
        tokio::spawn(deliver(result));
    }
    debug!("result channel closed, responder stopped");
}
