//! Rebuilds the inventory whenever the upstream comes (back) up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::csp::TokenService;
use crate::upstream::UpstreamProvider;

/// Poll `provider` every `interval` until `shutdown` flips to true.
pub async fn watch_upstream(
    service: Arc<dyn TokenService>,
    provider: Arc<dyn UpstreamProvider>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut was_up = false;
    loop {
        let up = provider.is_up().await;
        if up && !was_up {
            info!("upstream is up, rebuilding inventory");
            match service.init(Arc::clone(&provider)).await {
                Ok(()) => {
                    let inventory = service.inventory();
                    info!(
                        readers = inventory.reader_names().len(),
                        tokens = inventory.tokens().len(),
                        "inventory ready"
                    );
                }
                Err(err) => error!("inventory rebuild failed: {err}"),
            }
        } else if !up && was_up {
            warn!("upstream went down");
        }
        was_up = up;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("upstream monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csp::{CspConfig, IcaService};
    use crate::mock::{MockCard, MockUpstream};

    #[tokio::test]
    async fn rebuilds_on_every_reconnect() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new("3B00"));
        upstream.set_up(false);
        let service = Arc::new(IcaService::new(CspConfig::default()));
        let (stop, stopped) = watch::channel(false);

        let monitor = tokio::spawn(watch_upstream(
            Arc::clone(&service) as Arc<dyn TokenService>,
            Arc::new(upstream.clone()),
            Duration::from_millis(10),
            stopped,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.inventory().reader_names().is_empty());

        upstream.set_up(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.inventory().reader_names(), vec!["T1".to_string()]);

        upstream.set_up(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        upstream.add_card("T2", MockCard::new("3B00"));
        upstream.set_up(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.inventory().reader_names().len(), 2);

        stop.send(true).expect("stop");
        monitor.await.expect("monitor");
    }
}
