//! Typed stream shapes over a call connection.
//!
//! Client adapters: [`ServerStream`], [`ClientStream`], [`BidiStream`].
//! Server contexts: [`ServerStreamCtx`], [`ClientStreamCtx`],
//! [`BidiStreamCtx`], plus handler constructors that wrap a typed
//! server function into a registrable [`MethodHandler`].
//!
//! Every adapter is a thin layer: it marshals values with the call's
//! codec and converts the CLOSE frame into an `Ok(None)` end-of-stream
//! latch for the receive direction.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};
use crate::method::Method;
use crate::transport::{Call, MethodHandler, Transport};

// ============================================================================
// Client side
// ============================================================================

/// Client side of a server-streaming call: one request out, a stream of
/// responses in.
pub struct ServerStream<Res> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    eof: bool,
    _marker: PhantomData<fn() -> Res>,
}

impl<Res: DeserializeOwned> ServerStream<Res> {
    /// Invoke `method` and send the single request.
    pub async fn connect<Req: Serialize>(
        transport: &dyn Transport,
        method: &Method,
        req: &Req,
    ) -> Result<Self> {
        let codec = transport.codec();
        let data = codec.marshal(req)?;
        if codec.is_nil(&data) {
            return Err(Error::NilRequest);
        }

        let call = transport.invoke(method).await?;
        if let Err(e) = call.send(Bytes::from(data)).await {
            let _ = call.close().await;
            return Err(e);
        }

        Ok(Self {
            call,
            codec,
            eof: false,
            _marker: PhantomData,
        })
    }

    /// Receive the next response; `Ok(None)` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<Res>> {
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

    /// Release the call.
    pub async fn close(&self) -> Result<()> {
        self.call.close().await
    }
}

/// Client side of a client-streaming call: a stream of requests out,
/// one response in.
pub struct ClientStream<Req, Res> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req: Serialize, Res: DeserializeOwned> ClientStream<Req, Res> {
    pub async fn connect(transport: &dyn Transport, method: &Method) -> Result<Self> {
        let call = transport.invoke(method).await?;
        Ok(Self {
            call,
            codec: transport.codec(),
            _marker: PhantomData,
        })
    }

    /// Send one request; may be called repeatedly.
    pub async fn send(&self, req: &Req) -> Result<()> {
        let data = self.codec.marshal(req)?;
        self.call.send(Bytes::from(data)).await
    }

    /// Signal end of requests and await the single response.
    pub async fn close_and_recv(&self) -> Result<Res> {
        self.call.send_close().await?;
        match self.call.recv().await? {
            Some(bytes) => self.codec.unmarshal(&bytes),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Release the call.
    pub async fn close(&self) -> Result<()> {
        self.call.close().await
    }
}

/// Client side of a bidirectional call: independent request and
/// response streams.
pub struct BidiStream<Req, Res> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    eof: bool,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req: Serialize, Res: DeserializeOwned> BidiStream<Req, Res> {
    pub async fn connect(transport: &dyn Transport, method: &Method) -> Result<Self> {
        let call = transport.invoke(method).await?;
        Ok(Self {
            call,
            codec: transport.codec(),
            eof: false,
            _marker: PhantomData,
        })
    }

    pub async fn send(&self, req: &Req) -> Result<()> {
        let data = self.codec.marshal(req)?;
        self.call.send(Bytes::from(data)).await
    }

    pub async fn recv(&mut self) -> Result<Option<Res>> {
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

    /// End the send direction; the peer sees end of stream.
    pub async fn close_send(&self) -> Result<()> {
        self.call.send_close().await
    }

    /// Release the call.
    pub async fn close(&self) -> Result<()> {
        self.call.close().await
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Server context of a server-streaming call.
pub struct ServerStreamCtx<Res> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    _marker: PhantomData<fn(Res)>,
}

impl<Res: Serialize> ServerStreamCtx<Res> {
    /// Send one response; may be called repeatedly.
    pub async fn send(&self, res: &Res) -> Result<()> {
        let data = self.codec.marshal(res)?;
        self.call.send(Bytes::from(data)).await
    }
}

/// Server context of a client-streaming call.
pub struct ClientStreamCtx<Req, Res> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    eof: bool,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req: DeserializeOwned, Res: Serialize> ClientStreamCtx<Req, Res> {
    /// Receive the next request; `Ok(None)` once the client closed its
    /// send direction.
    pub async fn recv(&mut self) -> Result<Option<Req>> {
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

    /// Send the single response and close the stream.
    pub async fn send_and_close(&self, res: &Res) -> Result<()> {
        let data = self.codec.marshal(res)?;
        self.call.send(Bytes::from(data)).await?;
        self.call.send_close().await
    }
}

/// Server context of a bidirectional call.
pub struct BidiStreamCtx<Req, Res> {
    call: Arc<dyn Call>,
    codec: PayloadCodec,
    eof: bool,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req: DeserializeOwned, Res: Serialize> BidiStreamCtx<Req, Res> {
    pub async fn recv(&mut self) -> Result<Option<Req>> {
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

    pub async fn send(&self, res: &Res) -> Result<()> {
        let data = self.codec.marshal(res)?;
        self.call.send(Bytes::from(data)).await
    }

    /// End the send direction.
    pub async fn close_send(&self) -> Result<()> {
        self.call.send_close().await
    }
}

// ============================================================================
// Handler constructors
// ============================================================================

/// Wrap a server-streaming function. The function receives the decoded
/// initial request and a context for sending responses.
pub fn server_stream_handler<Req, Res, F, Fut>(f: F) -> MethodHandler
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req, ServerStreamCtx<Res>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |call: Arc<dyn Call>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let codec = call.codec();
            // The first frame is the request.
            let data = call.recv().await?.ok_or(Error::ConnectionClosed)?;
            let req: Req = codec.unmarshal(&data)?;
            let ctx = ServerStreamCtx {
                call,
                codec,
                _marker: PhantomData,
            };
            f(req, ctx).await
        })
    })
}

/// Wrap a client-streaming function.
pub fn client_stream_handler<Req, Res, F, Fut>(f: F) -> MethodHandler
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(ClientStreamCtx<Req, Res>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |call: Arc<dyn Call>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let ctx = ClientStreamCtx {
                codec: call.codec(),
                call,
                eof: false,
                _marker: PhantomData,
            };
            f(ctx).await
        })
    })
}

/// Wrap a bidirectional-streaming function.
pub fn bidi_stream_handler<Req, Res, F, Fut>(f: F) -> MethodHandler
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(BidiStreamCtx<Req, Res>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |call: Arc<dyn Call>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let ctx = BidiStreamCtx {
                codec: call.codec(),
                call,
                eof: false,
                _marker: PhantomData,
            };
            f(ctx).await
        })
    })
}
