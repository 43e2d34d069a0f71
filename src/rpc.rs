//! Unary calls: one request, one response.
//!
//! [`unary`] is the client side; [`unary_handler`] wraps a plain async
//! function into a [`MethodHandler`] for registration.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::method::{Method, Shape};
//! use wirecall::rpc;
//! use wirecall::transport::Transport;
//!
//! # async fn run(transport: &dyn Transport) -> wirecall::Result<()> {
//! let method = Method::new("calc/double", Shape::Unary);
//! let doubled: i64 = rpc::unary(transport, &method, &21i64).await?;
//! assert_eq!(doubled, 42);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::method::Method;
use crate::transport::{Call, MethodHandler, Transport};

/// Perform a unary call: send one request, await one response.
pub async fn unary<Req, Res>(transport: &dyn Transport, method: &Method, req: &Req) -> Result<Res>
where
    Req: Serialize + ?Sized,
    Res: DeserializeOwned,
{
    let codec = transport.codec();
    let data = codec.marshal(req)?;
    if codec.is_nil(&data) {
        return Err(Error::NilRequest);
    }

    let call = transport.invoke(method).await?;
    let result = async {
        call.send(Bytes::from(data)).await?;
        match call.recv().await? {
            Some(bytes) => codec.unmarshal(&bytes),
            None => Err(Error::ConnectionClosed),
        }
    }
    .await;
    let _ = call.close().await;
    result
}

/// Wrap a typed request/response function into a [`MethodHandler`].
///
/// The handler receives the decoded request and returns the response;
/// an `Err` is translated into an ERROR frame for the caller.
pub fn unary_handler<Req, Res, F, Fut>(f: F) -> MethodHandler
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Res>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |call: Arc<dyn Call>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let codec = call.codec();
            let data = call.recv().await?.ok_or(Error::ConnectionClosed)?;
            let req: Req = codec.unmarshal(&data)?;
            let res = f(req).await?;
            let bytes = codec.marshal(&res)?;
            call.send(Bytes::from(bytes)).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Shape;
    use crate::transport::mqtt::{MemoryBroker, MqttTransport};
    use crate::transport::TransportOptions;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Value {
        v: i64,
    }

    fn transports() -> (MqttTransport, MqttTransport) {
        let hub = Arc::new(MemoryBroker::new());
        let server =
            MqttTransport::with_client(TransportOptions::new().address("memory"), hub.client())
                .unwrap();
        let client =
            MqttTransport::with_client(TransportOptions::new().address("memory"), hub.client())
                .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let (server, client) = transports();
        let method = Method::new("svc/echo", Shape::Unary);

        server.register_handler(
            method.clone(),
            unary_handler(|req: Value| async move { Ok(req) }),
        );
        server.dial().await.unwrap();

        let res: Value = unary(&client, &method, &Value { v: 42 }).await.unwrap();
        assert_eq!(res, Value { v: 42 });
    }

    #[tokio::test]
    async fn test_unary_handler_error_propagates() {
        let (server, client) = transports();
        let method = Method::new("svc/fail", Shape::Unary);

        server.register_handler(
            method.clone(),
            unary_handler(|_req: Value| async move {
                Err::<Value, _>(Error::Remote("handler said no".into()))
            }),
        );
        server.dial().await.unwrap();

        let err = unary::<_, Value>(&client, &method, &Value { v: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "handler said no");
    }

    #[tokio::test]
    async fn test_nil_request_rejected() {
        let (_server, client) = transports();
        let method = Method::new("svc/echo", Shape::Unary);

        let err = unary::<_, Value>(&client, &method, &None::<Value>)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NilRequest));
    }
}
