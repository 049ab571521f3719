//! Process-wide client
//!
//! `global()` creates the shared client on first use from
//! [`ClientConfig::from_env`]; `shutdown_global()` disconnects it and releases
//! the process's reference. A later `global()` starts a fresh client.
//!
//! Hot code should fetch the `Arc` once and keep it rather than calling
//! `global()` per region.

use std::sync::{Arc, Mutex, PoisonError};

use super::Client;
use crate::config::ClientConfig;

static GLOBAL: Mutex<Option<Arc<Client>>> = Mutex::new(None);

/// The process-wide client, created on first access.
pub fn global() -> Arc<Client> {
    let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Arc::new(Client::new(ClientConfig::from_env()))))
}

/// Disconnect and release the process-wide client. Idempotent.
pub fn shutdown_global() {
    let client = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(client) = client {
        client.disconnect();
    }
}
