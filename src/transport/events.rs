//! Connect-event callback registry.
//!
//! Transports fire the registered callbacks after every successful
//! session establishment: an outbound dial, an accepted inbound
//! connection, or a broker connect.

use std::fmt;
use std::sync::Arc;

/// Callback invoked after a session is established.
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// An ordered list of on-connect callbacks.
#[derive(Clone, Default)]
pub struct ConnectEvents {
    callbacks: Vec<ConnectCallback>,
}

impl ConnectEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback.
    pub fn on_connect(&mut self, callback: ConnectCallback) {
        self.callbacks.push(callback);
    }

    /// Invoke every registered callback in registration order.
    pub fn fire(&self) {
        for callback in &self.callbacks {
            callback();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for ConnectEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectEvents")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
