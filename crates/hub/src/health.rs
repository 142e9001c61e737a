// hub/src/health.rs
use crate::metrics::Metrics;
use registry::AgentRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs `Registry::monitor_agent_health` every `interval` until `shutdown`
/// fires. No coordination with the Stream Server: status demotion is
/// eventually observable via `GetAgent` and does not force-close streams
/// (spec §4.5).
pub fn spawn(
    registry: Arc<AgentRegistry>,
    metrics: Arc<Metrics>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Health Monitor started.");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health Monitor received shutdown signal.");
                    break;
                }
                _ = ticker.tick() => {
                    metrics.health_scans_total.inc();
                    match registry.monitor_agent_health().await {
                        Ok(demoted) if demoted > 0 => {
                            metrics.health_demotions_total.inc_by(demoted);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Health Monitor scan failed."),
                    }
                }
            }
        }

        tracing::info!("Health Monitor has shut down.");
    })
}
