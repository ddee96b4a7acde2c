//! The durable-queue poller: feeds persisted signals onto the bus.
//!
//! Signals marked `durable=true` land in the store first (see
//! `SignalIngress`); this worker claims them in batches and publishes them
//! toward the FSM. On boot it requeues rows stranded in `processing` by a
//! crash, which is what makes ingestion at-least-once.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use nerve_store::Store;

use crate::bus::Bus;

pub struct QueuePoller {
    store: Arc<Store>,
    bus: Bus,
    batch: usize,
    poll_interval: std::time::Duration,
}

impl QueuePoller {
    pub fn new(store: Arc<Store>, bus: Bus) -> Self {
        Self { store, bus, batch: 16, poll_interval: std::time::Duration::from_millis(250) }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Crash recovery: anything claimed but never completed goes back.
        match self.store.requeue_stale_signals(&(Utc::now() + Duration::seconds(1))) {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "requeued signals stranded by a previous run"),
            Err(e) => tracing::error!(error = %e, "stale signal recovery failed"),
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("queue poller running");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.bus.is_accepting() {
                        tracing::info!("bus closed, queue poller stopping");
                        break;
                    }
                    match self.store.claim_signals(self.batch) {
                        Ok(signals) => {
                            for signal in signals {
                                if let Err(e) = self.bus.publish(signal).await {
                                    tracing::warn!(error = %e, "queue poller publish failed");
                                    break;
                                }
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "queue claim failed"),
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("queue poller stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::config::PublishMode;
    use nerve_domain::signal::{types, Signal, SignalStatus};

    #[tokio::test]
    async fn poller_moves_durable_signals_to_bus() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (bus, mut rx) = Bus::new(8, PublishMode::Block);

        let signal = Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::json!({"text": "hi"})).durable();
        store.enqueue_signal(&signal).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = QueuePoller::new(store.clone(), bus.clone());
        let handle = tokio::spawn(poller.run(shutdown_rx));

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, signal.id);
        assert_eq!(store.signal_status(&signal.id).unwrap(), Some(SignalStatus::Processing));

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
    }
}
