//! Sense adapters: background producers that normalize native channel
//! payloads into signals.
//!
//! Every sense attaches a correlation id and is responsible for collapsing
//! replays at its own source. Replayable events (webhook retries, reconnect
//! backfills) do this by deriving the signal id from the provider's event id
//! with [`stable_signal_id`]; the durable queue's idempotent insert then
//! turns every redelivery into the same row, across restarts too. Durable
//! signals go through the [`SignalIngress`]; the queue poller feeds them
//! back onto the bus.

mod cli;
mod poller;

pub use cli::CliSense;
pub use poller::QueuePoller;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::SignalIngress;

/// A background producer of signals.
pub trait Sense: Send + Sync {
    /// Stable sense key, used as the signal `source`.
    fn key(&self) -> &str;
    /// Signal types this sense may emit.
    fn signals(&self) -> Vec<&'static str>;
    /// Spawn the producer. It must stop promptly when `shutdown` flips.
    fn start(&self, ingress: SignalIngress, shutdown: watch::Receiver<bool>) -> JoinHandle<()>;
}

/// Deterministic signal id for one external event of one sense. The id is
/// the truncated digest of `(sense key, provider event id)`, so a retried
/// delivery maps onto the row the first delivery already queued.
pub fn stable_signal_id(sense_key: &str, event_id: &str) -> Uuid {
    let digest = Sha256::digest(format!("{sense_key}\u{1f}{event_id}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_event_maps_to_same_id() {
        let a = stable_signal_id("telegram", "update-42");
        let b = stable_signal_id("telegram", "update-42");
        assert_eq!(a, b, "a retried delivery must reuse the id");
    }

    #[test]
    fn distinct_events_and_senses_diverge() {
        let base = stable_signal_id("telegram", "update-42");
        assert_ne!(base, stable_signal_id("telegram", "update-43"));
        assert_ne!(base, stable_signal_id("api", "update-42"));
    }

    #[tokio::test]
    async fn queue_collapses_stable_id_replays() {
        use nerve_domain::signal::{types, Signal};
        let store = std::sync::Arc::new(nerve_store::Store::open_in_memory().unwrap());

        let make = || {
            Signal::new(types::API_MESSAGE_RECEIVED, "api", serde_json::json!({"text": "hi"}))
                .with_id(stable_signal_id("api", "evt-1"))
                .durable()
        };
        assert!(store.enqueue_signal(&make()).unwrap());
        assert!(!store.enqueue_signal(&make()).unwrap(), "replay lands on the same row");
        assert_eq!(store.queue_depth().unwrap(), 1);
    }
}
