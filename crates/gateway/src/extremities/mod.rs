//! Extremity adapters: deliver normalized outbound messages to channels.
//!
//! The drain subscribes to the outbound broadcast, consults the do-not-
//! disturb preference (preference-side, authoritative), routes by channel
//! type, and writes one `delivery_receipt` trace per message. Delivery is
//! best-effort; the FSM never retries it.

mod cli_out;

pub use cli_out::CliExtremity;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use nerve_domain::error::Result;
use nerve_domain::message::OutboundMessage;
use nerve_domain::trace::{events, Level, ObsEvent};
use nerve_store::Store;

use crate::bus::Bus;

#[async_trait::async_trait]
pub trait Extremity: Send + Sync {
    /// Channel type this extremity serves (`"cli"`, `"telegram"`, ...).
    fn channel_type(&self) -> &str;
    async fn deliver(&self, msg: &OutboundMessage) -> Result<()>;
}

pub struct ExtremityDrain {
    store: Arc<Store>,
    obs: Arc<Store>,
    extremities: HashMap<String, Arc<dyn Extremity>>,
}

impl ExtremityDrain {
    pub fn new(store: Arc<Store>, obs: Arc<Store>, extremities: Vec<Arc<dyn Extremity>>) -> Self {
        let extremities = extremities
            .into_iter()
            .map(|e| (e.channel_type().to_string(), e))
            .collect();
        Self { store, obs, extremities }
    }

    pub async fn run(self, bus: Bus, mut shutdown: watch::Receiver<bool>) {
        let mut rx = bus.subscribe_outbound();
        tracing::info!(channels = self.extremities.len(), "extremity drain running");
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(msg) => self.deliver_one(&msg).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "extremity drain lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("extremity drain stopping");
                    break;
                }
            }
        }
    }

    pub async fn deliver_one(&self, msg: &OutboundMessage) {
        // Preference-side dnd; urgent messages still go through.
        let suppressed = msg.urgency() != "high"
            && self.store.dnd(&msg.audience.id).unwrap_or(false);

        let (status, error) = if suppressed {
            ("suppressed_dnd".to_string(), None)
        } else {
            match self.extremities.get(&msg.channel_type) {
                Some(extremity) => match extremity.deliver(msg).await {
                    Ok(()) => ("delivered".to_string(), None),
                    Err(e) => ("failed".to_string(), Some(e.to_string())),
                },
                // Channels without a local adapter (api, push) are consumed
                // by gateway taps on the same broadcast.
                None => ("no_adapter".to_string(), None),
            }
        };

        let level = if error.is_some() { Level::Error } else { Level::Info };
        let mut event = ObsEvent::new(events::DELIVERY_RECEIPT, level, &msg.correlation_id)
            .with_channel(&msg.channel_type)
            .with_user(&msg.audience.id)
            .with_status(&status);
        if let Some(error) = error {
            event = event.with_detail(&error);
        }
        event.emit();
        if let Err(e) = self.obs.record_event(&event) {
            tracing::warn!(error = %e, "observability write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::message::{Audience, InboundMessage};
    use parking_lot::Mutex;

    struct RecordingExtremity {
        delivered: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Extremity for RecordingExtremity {
        fn channel_type(&self) -> &str {
            "cli"
        }

        async fn deliver(&self, msg: &OutboundMessage) -> Result<()> {
            self.delivered.lock().push(msg.message.clone());
            Ok(())
        }
    }

    fn outbound(user: &str, urgency: &str) -> OutboundMessage {
        let inbound = InboundMessage::new("hi", "cli", "cli:local", user, "C1");
        let mut msg = OutboundMessage::reply_to(&inbound, "hello");
        msg.audience = Audience::user(user);
        if urgency != "normal" {
            msg.metadata = serde_json::json!({"urgency": urgency});
        }
        msg
    }

    fn drain() -> (ExtremityDrain, Arc<Store>, Arc<Mutex<Vec<String>>>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let drain = ExtremityDrain::new(
            store.clone(),
            store.clone(),
            vec![Arc::new(RecordingExtremity { delivered: delivered.clone() })],
        );
        (drain, store, delivered)
    }

    #[tokio::test]
    async fn delivers_and_writes_receipt() {
        let (drain, store, delivered) = drain();
        drain.deliver_one(&outbound("u1", "normal")).await;
        assert_eq!(delivered.lock().as_slice(), ["hello"]);

        let receipts = store.events_by_correlation("C1").unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].event, "delivery_receipt");
        assert_eq!(receipts[0].status.as_deref(), Some("delivered"));
    }

    #[tokio::test]
    async fn dnd_suppresses_normal_messages() {
        let (drain, store, delivered) = drain();
        store.set_preference("u1", "dnd", "true").unwrap();

        drain.deliver_one(&outbound("u1", "normal")).await;
        assert!(delivered.lock().is_empty(), "dnd must suppress normal urgency");

        let receipts = store.events_by_correlation("C1").unwrap();
        assert_eq!(receipts[0].status.as_deref(), Some("suppressed_dnd"));
    }

    #[tokio::test]
    async fn urgent_messages_pass_dnd() {
        let (drain, store, delivered) = drain();
        store.set_preference("u1", "dnd", "true").unwrap();
        drain.deliver_one(&outbound("u1", "high")).await;
        assert_eq!(delivered.lock().len(), 1, "urgent messages escape dnd");
    }

    #[tokio::test]
    async fn unknown_channel_records_no_adapter() {
        let (drain, store, _delivered) = drain();
        let mut msg = outbound("u1", "normal");
        msg.channel_type = "api".into();
        drain.deliver_one(&msg).await;
        let receipts = store.events_by_correlation("C1").unwrap();
        assert_eq!(receipts[0].status.as_deref(), Some("no_adapter"));
    }
}
