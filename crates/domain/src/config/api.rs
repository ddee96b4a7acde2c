use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "d_listen_addr")]
    pub listen_addr: String,
    /// Bearer token expected in `X-Agent-API-Token`. `None` = dev mode.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// How long `POST /message` waits for a matching outbound.
    #[serde(default = "d_message_wait_seconds")]
    pub message_wait_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: d_listen_addr(),
            token: None,
            message_wait_seconds: d_message_wait_seconds(),
        }
    }
}

fn d_listen_addr() -> String {
    "127.0.0.1:8470".into()
}

fn d_message_wait_seconds() -> u64 {
    10
}
