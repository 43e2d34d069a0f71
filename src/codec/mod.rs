//! Payload codecs and wire framing.
//!
//! A [`PayloadCodec`] turns application values and wire messages into
//! bytes; [`framed`] adds the length-delimited frame layout used by the
//! stream transports. The codec is fixed per transport: the socket
//! transport defaults to MsgPack, WebSocket and MQTT default to JSON.
//!
//! # Example
//!
//! ```
//! use wirecall::codec::PayloadCodec;
//!
//! let codec = PayloadCodec::MsgPack;
//! let bytes = codec.marshal(&42u32).unwrap();
//! let back: u32 = codec.unmarshal(&bytes).unwrap();
//! assert_eq!(back, 42);
//! ```

pub mod framed;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Payload encoder/decoder bound to a transport.
///
/// A closed enum rather than a trait object: marshal/unmarshal are
/// generic over the value type, which trait objects cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCodec {
    /// MessagePack via `rmp-serde`, struct-as-map encoding.
    MsgPack,
    /// JSON via `serde_json`.
    Json,
}

impl PayloadCodec {
    /// Encode a value.
    pub fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            // to_vec_named keeps structs as maps, interoperable with
            // non-Rust peers.
            PayloadCodec::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
            PayloadCodec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decode a value.
    pub fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
            PayloadCodec::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Whether `bytes` is this codec's encoding of nil.
    ///
    /// Used to reject requests that marshal to nothing before they
    /// reach the wire.
    pub fn is_nil(&self, bytes: &[u8]) -> bool {
        match self {
            PayloadCodec::MsgPack => bytes == [0xc0],
            PayloadCodec::Json => bytes == b"null",
        }
    }
}
