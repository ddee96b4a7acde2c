//! Observability maintenance: periodic retention pruning.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use nerve_domain::config::ObservabilityConfig;
use nerve_store::Store;

pub struct ObservabilityMaintenance {
    obs: Arc<Store>,
    config: ObservabilityConfig,
}

impl ObservabilityMaintenance {
    pub fn new(obs: Arc<Store>, config: ObservabilityConfig) -> Self {
        Self { obs, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.config.maintenance_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            non_error_ttl_days = self.config.non_error_ttl_days,
            error_ttl_days = self.config.error_ttl_days,
            max_rows = self.config.max_rows,
            "observability maintenance running"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.obs.prune_events(
                        &Utc::now(),
                        self.config.non_error_ttl_days,
                        self.config.error_ttl_days,
                        self.config.max_rows,
                    ) {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(pruned = n, "observability retention applied"),
                        Err(e) => tracing::error!(error = %e, "observability prune failed"),
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("observability maintenance stopping");
                    break;
                }
            }
        }
    }
}
