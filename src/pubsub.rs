//! Typed publish/subscribe over a shared topic.
//!
//! PUBLISHER methods send values; CONSUMER methods receive them. Both
//! bypass the per-call scheme: there is no handshake and no CLOSE.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::method::{Method, Shape};
//! use wirecall::pubsub::{Consumer, Publisher};
//! use wirecall::transport::Transport;
//!
//! # async fn run(transport: &dyn Transport) -> wirecall::Result<()> {
//! let publisher: Publisher<f64> =
//!     Publisher::connect(transport, &Method::new("sensors/temp", Shape::Publisher)).await?;
//! publisher.send(&21.5).await?;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::PayloadCodec;
use crate::error::Result;
use crate::method::Method;
use crate::transport::{Call, Transport};

/// Typed producer on a shared topic.
pub struct Publisher<T> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> Publisher<T> {
    pub async fn connect(transport: &dyn Transport, method: &Method) -> Result<Self> {
        let call = transport.invoke(method).await?;
        Ok(Self {
            call,
            codec: transport.codec(),
            _marker: PhantomData,
        })
    }

    /// Publish one value.
    pub async fn send(&self, value: &T) -> Result<()> {
        let data = self.codec.marshal(value)?;
        self.call.send(Bytes::from(data)).await
    }

    /// Release the topic resources.
    pub async fn close(&self) -> Result<()> {
        self.call.close().await
    }
}

/// Typed subscriber on a shared topic.
pub struct Consumer<T> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    eof: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Consumer<T> {
    pub async fn connect(transport: &dyn Transport, method: &Method) -> Result<Self> {
        let call = transport.invoke(method).await?;
        Ok(Self {
            call,
            codec: transport.codec(),
            eof: false,
            _marker: PhantomData,
        })
    }

    /// Receive the next published value.
    pub async fn recv(&mut self) -> Result<Option<T>> {
        if self.eof {
            return Ok(None);
        }
        match self.call.recv().await? {
            None => {
                self.eof = true;
                Ok(None)
            }
            Some(bytes) => self.codec.unmarshal(&bytes).map(Some),
        }
    }

    /// Release the subscription.
    pub async fn close(&self) -> Result<()> {
        self.call.close().await
    }
}
