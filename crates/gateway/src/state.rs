//! Shared application state handed to API handlers and workers.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use nerve_domain::config::Config;
use nerve_store::Store;

use crate::bus::{Bus, SignalIngress};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    /// Trace store; same handle as `store` unless a separate path is set.
    pub obs: Arc<Store>,
    pub bus: Bus,
    pub ingress: SignalIngress,
    /// SHA-256 of the API token, computed once at startup. `None` = dev
    /// mode, no auth enforced.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn token_hash(token: &str) -> Vec<u8> {
        Sha256::digest(token.as_bytes()).to_vec()
    }
}
