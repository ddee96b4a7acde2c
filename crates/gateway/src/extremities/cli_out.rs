//! Terminal extremity: prints outbound messages to stdout.

use nerve_domain::error::Result;
use nerve_domain::message::OutboundMessage;

use super::Extremity;

pub struct CliExtremity;

#[async_trait::async_trait]
impl Extremity for CliExtremity {
    fn channel_type(&self) -> &str {
        "cli"
    }

    async fn deliver(&self, msg: &OutboundMessage) -> Result<()> {
        println!("[nerve] {}", msg.message);
        Ok(())
    }
}
