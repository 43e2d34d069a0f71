//! # wirecall
//!
//! Transport-agnostic RPC runtime: typed request/response, streaming,
//! and publish/subscribe multiplexed over dissimilar byte carriers.
//!
//! ## Architecture
//!
//! - **Call plane**: every invocation is a [`transport::Call`] — a
//!   full-duplex channel of tagged wire frames (INVOKE, DATA, ERROR,
//!   CLOSE, ACK).
//! - **Transports**: stream sockets and WebSocket map one physical link
//!   to many calls through a session multiplexer; the MQTT transport
//!   emulates per-call connections on broker topics, with shared-group
//!   subscriptions load-balancing invocations across server replicas.
//! - **Shapes**: [`rpc`] (unary), [`stream`] (server/client/bidi
//!   streams) and [`pubsub`] are thin typed adapters over the call
//!   plane.
//!
//! ## Example
//!
//! ```no_run
//! use wirecall::method::{Method, Shape};
//! use wirecall::rpc;
//! use wirecall::transport::{SocketTransport, Transport, TransportOptions};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> wirecall::Result<()> {
//!     let transport = SocketTransport::new(
//!         TransportOptions::new().address("127.0.0.1:7010"),
//!     )?;
//!
//!     let method = Method::new("greeter/hello", Shape::Unary);
//!     let reply: Greeting = rpc::unary(
//!         &transport,
//!         &method,
//!         &Greeting { text: "hi".into() },
//!     )
//!     .await?;
//!     println!("{}", reply.text);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod method;
pub mod pubsub;
pub mod rpc;
pub mod stream;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};
pub use method::{Method, Shape};
pub use transport::{Call, MethodHandler, Transport};
