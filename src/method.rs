//! Method identity: the `(name, shape)` pair naming an RPC endpoint.
//!
//! Methods are values: compared by equality and used as registry keys.
//! On the wire a method travels as `<name>/<shape-number>`, e.g.
//! `svc/echo/0` for a unary `svc/echo`.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Interaction shape of a method.
///
/// The discriminants are the wire shape numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Shape {
    /// One request, one response.
    Unary = 0,
    /// One request, a stream of responses.
    ServerStream = 1,
    /// A stream of requests, one response.
    ClientStream = 2,
    /// Independent request and response streams.
    BidiStream = 3,
    /// Fire-and-forget publication to a shared topic.
    Publisher = 4,
    /// Subscription to a shared topic.
    Consumer = 5,
}

impl Shape {
    /// Parse a wire shape number.
    pub fn from_number(n: u8) -> Option<Shape> {
        match n {
            0 => Some(Shape::Unary),
            1 => Some(Shape::ServerStream),
            2 => Some(Shape::ClientStream),
            3 => Some(Shape::BidiStream),
            4 => Some(Shape::Publisher),
            5 => Some(Shape::Consumer),
            _ => None,
        }
    }

    /// Whether this shape bypasses the per-call connection scheme.
    #[inline]
    pub fn is_pubsub(&self) -> bool {
        matches!(self, Shape::Publisher | Shape::Consumer)
    }
}

/// An RPC method identity: a path-like name plus its interaction shape.
///
/// # Example
///
/// ```
/// use wirecall::method::{Method, Shape};
///
/// let m = Method::new("svc/echo", Shape::Unary);
/// assert_eq!(m.to_string(), "svc/echo/0");
/// assert_eq!("svc/echo/0".parse::<Method>().unwrap(), m);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method {
    /// Path-like `service/method` name.
    pub name: String,
    /// Interaction shape.
    pub shape: Shape,
}

impl Method {
    /// Create a new method identity.
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Whether this method uses the pub/sub scheme.
    #[inline]
    pub fn is_pubsub(&self) -> bool {
        self.shape.is_pubsub()
    }

    /// Whether this method is a topic consumer.
    #[inline]
    pub fn is_consumer(&self) -> bool {
        self.shape == Shape::Consumer
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.shape as u8)
    }
}

impl FromStr for Method {
    type Err = Error;

    /// Parse `<name>/<shape-number>`; the name itself may contain `/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, shape) = s.rsplit_once('/').ok_or(Error::InvalidMessage)?;
        if name.is_empty() {
            return Err(Error::InvalidMessage);
        }
        let number: u8 = shape.parse().map_err(|_| Error::InvalidMessage)?;
        let shape = Shape::from_number(number).ok_or(Error::InvalidMessage)?;
        Ok(Method::new(name, shape))
    }
}
