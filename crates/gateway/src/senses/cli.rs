//! The local CLI sense: one line on stdin becomes one durable
//! `cli.message_received` signal.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use nerve_domain::message::InboundMessage;
use nerve_domain::signal::{types, Signal};

use super::Sense;
use crate::bus::SignalIngress;

pub struct CliSense {
    user_id: String,
}

impl CliSense {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }

    /// Build the durable signal for one line of input.
    pub fn signal_for_line(user_id: &str, line: &str) -> Signal {
        let correlation_id = Uuid::new_v4().to_string();
        let inbound = InboundMessage::new(line.trim(), "cli", "cli:local", user_id, correlation_id.clone());
        Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::to_value(&inbound).unwrap_or_default())
            .with_correlation(correlation_id)
            .durable()
    }
}

impl Sense for CliSense {
    fn key(&self) -> &str {
        "cli"
    }

    fn signals(&self) -> Vec<&'static str> {
        vec![types::CLI_MESSAGE_RECEIVED]
    }

    fn start(&self, ingress: SignalIngress, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            tracing::info!("cli sense listening on stdin");
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) if !line.trim().is_empty() => {
                                let signal = Self::signal_for_line(&user_id, &line);
                                if let Err(e) = ingress.submit(signal).await {
                                    tracing::warn!(error = %e, "cli sense could not submit signal");
                                }
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                tracing::info!("stdin closed, cli sense stopping");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "stdin read failed, cli sense stopping");
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("cli sense stopping");
                        break;
                    }
                }
            }
        })
    }
}
