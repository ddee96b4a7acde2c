//! The in-process signal bus.
//!
//! Signals flow through a bounded mpsc channel into the single FSM consumer,
//! preserving per-producer FIFO order. Outbound messages fan out over a
//! broadcast channel to extremity drains and gateway taps. Once the bus is
//! closed (shutdown), publishes are refused; buffered signals still drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use nerve_domain::config::PublishMode;
use nerve_domain::error::{Error, Result};
use nerve_domain::message::OutboundMessage;
use nerve_domain::signal::Signal;
use nerve_store::Store;

#[derive(Clone)]
pub struct Bus {
    tx: mpsc::Sender<Signal>,
    outbound_tx: broadcast::Sender<OutboundMessage>,
    accepting: Arc<AtomicBool>,
    mode: PublishMode,
}

impl Bus {
    /// Build the bus and hand back the single FSM-side receiver.
    pub fn new(capacity: usize, mode: PublishMode) -> (Self, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (outbound_tx, _) = broadcast::channel(256);
        (
            Self {
                tx,
                outbound_tx,
                accepting: Arc::new(AtomicBool::new(true)),
                mode,
            },
            rx,
        )
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse all further publishes. Buffered signals remain consumable.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Publish a signal toward the FSM. Blocks or fails fast on a full
    /// queue depending on the configured mode.
    pub async fn publish(&self, signal: Signal) -> Result<()> {
        if !self.is_accepting() {
            return Err(Error::BusClosed);
        }
        match self.mode {
            PublishMode::Block => self.tx.send(signal).await.map_err(|_| Error::BusClosed),
            PublishMode::FailFast => self.tx.try_send(signal).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::Other("bus full".into()),
                mpsc::error::TrySendError::Closed(_) => Error::BusClosed,
            }),
        }
    }

    /// Broadcast an outbound message to every drain and tap. Lossy when a
    /// subscriber lags; delivery receipts come from the extremity drain.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    pub fn subscribe_outbound(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound_tx.subscribe()
    }
}

/// Entry point for senses: durable signals are persisted to the queue first
/// (the poller feeds them to the bus), ephemeral ones go straight through.
#[derive(Clone)]
pub struct SignalIngress {
    bus: Bus,
    store: Arc<Store>,
}

impl SignalIngress {
    pub fn new(bus: Bus, store: Arc<Store>) -> Self {
        Self { bus, store }
    }

    /// Returns whether the signal was accepted as new work. A durable
    /// signal whose id is already queued (a replayed delivery carrying a
    /// stable id) reports `false` and changes nothing.
    pub async fn submit(&self, signal: Signal) -> Result<bool> {
        if !self.bus.is_accepting() {
            return Err(Error::BusClosed);
        }
        if signal.durable {
            self.store.enqueue_signal(&signal)
        } else {
            self.bus.publish(signal).await.map(|()| true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::signal::types;

    fn signal() -> Signal {
        Signal::new(types::TIMER_FIRED, "test", serde_json::json!({}))
    }

    #[tokio::test]
    async fn publish_and_consume_fifo() {
        let (bus, mut rx) = Bus::new(8, PublishMode::Block);
        for i in 0..3 {
            let mut sig = signal();
            sig.payload = serde_json::json!({"n": i});
            bus.publish(sig).await.unwrap();
        }
        for i in 0..3 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.payload["n"], i, "per-producer FIFO order");
        }
    }

    #[tokio::test]
    async fn closed_bus_refuses_publish_but_drains() {
        let (bus, mut rx) = Bus::new(8, PublishMode::Block);
        bus.publish(signal()).await.unwrap();
        bus.close();

        assert!(matches!(bus.publish(signal()).await, Err(Error::BusClosed)));
        // The buffered signal is still there.
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn fail_fast_mode_errors_when_full() {
        let (bus, _rx) = Bus::new(1, PublishMode::FailFast);
        bus.publish(signal()).await.unwrap();
        let err = bus.publish(signal()).await.unwrap_err();
        assert!(err.to_string().contains("bus full"));
    }

    #[tokio::test]
    async fn outbound_broadcast_reaches_all_subscribers() {
        let (bus, _rx) = Bus::new(8, PublishMode::Block);
        let mut sub1 = bus.subscribe_outbound();
        let mut sub2 = bus.subscribe_outbound();

        let inbound = nerve_domain::message::InboundMessage::new("hi", "cli", "cli:local", "u1", "C1");
        bus.publish_outbound(OutboundMessage::reply_to(&inbound, "hello"));

        assert_eq!(sub1.recv().await.unwrap().correlation_id, "C1");
        assert_eq!(sub2.recv().await.unwrap().correlation_id, "C1");
    }

    #[tokio::test]
    async fn ingress_persists_durable_instead_of_publishing() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (bus, mut rx) = Bus::new(8, PublishMode::Block);
        let ingress = SignalIngress::new(bus.clone(), store.clone());

        let durable = signal().durable();
        assert!(ingress.submit(durable.clone()).await.unwrap());
        assert_eq!(store.queue_depth().unwrap(), 1);
        assert!(rx.try_recv().is_err(), "durable signal must not bypass the queue");

        assert!(
            !ingress.submit(durable).await.unwrap(),
            "same id again is a collapsed replay"
        );
        assert_eq!(store.queue_depth().unwrap(), 1);

        let ephemeral = signal();
        assert!(ingress.submit(ephemeral).await.unwrap());
        assert!(rx.try_recv().is_ok());
    }
}
