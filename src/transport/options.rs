//! Transport configuration.
//!
//! Options are collected with a fluent builder and handed to a
//! transport constructor. Each transport validates the subset it
//! understands; a missing address is fatal at construction.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use wirecall::transport::{Protocol, TransportOptions};
//!
//! let options = TransportOptions::new()
//!     .address("127.0.0.1:7010")
//!     .protocol(Protocol::Tcp)
//!     .connect_timeout(Duration::from_secs(3))
//!     .on_connect(|| println!("session up"));
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};
use crate::tls::TlsSettings;
use crate::transport::events::ConnectEvents;

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-call handler timeout (broker transport).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Underlying protocol of the socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// TCP socket; addresses are `host:port`.
    #[default]
    Tcp,
    /// Unix domain socket; addresses are filesystem paths.
    Unix,
}

/// Configuration shared by all transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Endpoint list; the first address is used, the remainder is
    /// reserved for failover.
    pub(crate) addrs: Vec<String>,
    pub(crate) protocol: Protocol,
    pub(crate) connect_timeout: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) tls: Option<TlsSettings>,
    /// Origin header for the WebSocket client.
    pub(crate) origin: Option<String>,
    /// Payload codec override; each transport has its own default.
    pub(crate) codec: Option<PayloadCodec>,
    pub(crate) events: ConnectEvents,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            protocol: Protocol::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            tls: None,
            origin: None,
            codec: None,
            events: ConnectEvents::new(),
        }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint address. May be called repeatedly.
    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    /// Select the socket protocol (`tcp` or `unix`).
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Maximum dial duration.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Per-call handler timeout (broker transport).
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Use explicit TLS settings.
    pub fn tls_config(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Generate an ephemeral self-signed certificate (30 days) and
    /// disable peer verification on the client side.
    pub fn self_signed_cert(mut self) -> Result<Self> {
        self.tls = Some(TlsSettings::self_signed()?);
        Ok(self)
    }

    /// Load TLS credentials from PEM files.
    pub fn certificate_file(mut self, cert: &Path, key: &Path) -> Result<Self> {
        self.tls = Some(TlsSettings::from_files(cert, key)?);
        Ok(self)
    }

    /// Origin header for the WebSocket client upgrade.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Override the payload codec.
    pub fn codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Register a callback fired after each successful session
    /// establishment.
    pub fn on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.events.on_connect(Arc::new(callback));
        self
    }

    /// The address in use, or `NoAddress` if none was configured.
    pub(crate) fn first_addr(&self) -> Result<&str> {
        self.addrs
            .first()
            .map(String::as_str)
            .ok_or(Error::NoAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransportOptions::new();
        assert_eq!(options.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(options.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(options.protocol, Protocol::Tcp);
        assert!(options.codec.is_none());
        assert!(matches!(options.first_addr(), Err(Error::NoAddress)));
    }

    #[test]
    fn test_first_address_wins() {
        let options = TransportOptions::new()
            .address("primary:1")
            .address("failover:2");
        assert_eq!(options.first_addr().unwrap(), "primary:1");
    }

    #[test]
    fn test_builder_chain() {
        let options = TransportOptions::new()
            .address("/tmp/test.sock")
            .protocol(Protocol::Unix)
            .connect_timeout(Duration::from_millis(250))
            .call_timeout(Duration::from_secs(1))
            .codec(PayloadCodec::Json)
            .origin("http://localhost")
            .on_connect(|| {});

        assert_eq!(options.protocol, Protocol::Unix);
        assert_eq!(options.connect_timeout, Duration::from_millis(250));
        assert_eq!(options.call_timeout, Duration::from_secs(1));
        assert_eq!(options.codec, Some(PayloadCodec::Json));
        assert_eq!(options.origin.as_deref(), Some("http://localhost"));
        assert!(!options.events.is_empty());
    }
}
