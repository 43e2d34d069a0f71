//! Wire message: the tagged control/data frame exchanged on a call.
//!
//! Every interaction on a call connection is a sequence of these frames.
//! INVOKE carries the encoded method identity, DATA an application
//! payload, ERROR a UTF-8 description; CLOSE and ACK carry nothing.
//!
//! # Example
//!
//! ```
//! use wirecall::message::{tags, WireMessage};
//!
//! let msg = WireMessage::data(b"payload".as_ref().into());
//! assert!(msg.is_data());
//! assert_eq!(msg.tag, tags::DATA);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::method::Method;

/// Frame tag values.
pub mod tags {
    /// Carries the encoded method identity; first frame of every call.
    pub const INVOKE: u8 = 0x00;
    /// Carries one encoded application value.
    pub const DATA: u8 = 0x01;
    /// Carries a UTF-8 error description.
    pub const ERROR: u8 = 0x02;
    /// Ends the sender's transmit direction; no payload.
    pub const CLOSE: u8 = 0x03;
    /// Acknowledges an INVOKE (broker transport); no payload.
    pub const ACK: u8 = 0x80;
}

/// A tagged wire frame: one `tag` byte and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Frame kind, one of [`tags`].
    pub tag: u8,
    /// Payload bytes; meaning depends on the tag.
    pub data: Bytes,
}

impl WireMessage {
    /// Create an INVOKE frame carrying the method identity.
    pub fn invoke(method: &Method) -> Self {
        Self {
            tag: tags::INVOKE,
            data: Bytes::from(method.to_string()),
        }
    }

    /// Create a DATA frame carrying an encoded application value.
    pub fn data(data: Bytes) -> Self {
        Self {
            tag: tags::DATA,
            data,
        }
    }

    /// Create an ERROR frame from an error's display form.
    pub fn error(err: &Error) -> Self {
        Self {
            tag: tags::ERROR,
            data: Bytes::from(err.to_string()),
        }
    }

    /// Create an ERROR frame from a message string.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            tag: tags::ERROR,
            data: Bytes::from(text.into()),
        }
    }

    /// Create a CLOSE frame.
    pub fn close() -> Self {
        Self {
            tag: tags::CLOSE,
            data: Bytes::new(),
        }
    }

    /// Create an ACK frame.
    pub fn ack() -> Self {
        Self {
            tag: tags::ACK,
            data: Bytes::new(),
        }
    }

    #[inline]
    pub fn is_invoke(&self) -> bool {
        self.tag == tags::INVOKE
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.tag == tags::DATA
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.tag == tags::ERROR
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        self.tag == tags::CLOSE
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.tag == tags::ACK
    }

    /// Reconstitute the error carried by an ERROR frame.
    ///
    /// Returns `None` for every other tag.
    pub fn as_error(&self) -> Option<Error> {
        if self.is_error() {
            Some(Error::Remote(
                String::from_utf8_lossy(&self.data).into_owned(),
            ))
        } else {
            None
        }
    }

    /// Parse the method identity carried by an INVOKE frame.
    pub fn method(&self) -> Option<Method> {
        if !self.is_invoke() {
            return None;
        }
        std::str::from_utf8(&self.data).ok()?.parse().ok()
    }

    /// Get the payload bytes (cheap clone via `Bytes`).
    #[inline]
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }
}
