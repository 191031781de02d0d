//! Envelope is the wire form of a message handed to a transport.
//!
//! It carries a routing key, an opaque serialized value and a list of headers. The
//! [`TYPE_ID_HEADER`] header identifies the payload schema, so heterogeneous consumers sharing
//! the same transport can tell payload shapes apart before decoding them.

/// Name of the header carrying the payload type discriminator.
pub const TYPE_ID_HEADER: &str = "__TypeId__";

/// Type discriminator attached to serialized cart update requests unless configured otherwise.
///
/// It is the class name JVM consumers of the cart topic map the payload to.
pub const DEFAULT_TYPE_ID: &str =
    "com.example.cart.services.cart_service.entities.CartUpdateRequest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

/// A keyed message ready to be written to a partitioned transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Routing key. Messages sharing a key are delivered to the same ordered lane.
    pub key: Vec<u8>,
    /// Serialized payload.
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
}

impl Envelope {
    /// Creates an envelope without headers.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: vec![],
        }
    }

    /// Appends a header to the envelope.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Returns the value of the first header named `key`.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }

    /// Returns the payload type discriminator, if present and valid UTF-8.
    pub fn type_id(&self) -> Option<&str> {
        self.header(TYPE_ID_HEADER)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Returns the key as a string, if it is valid UTF-8.
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }
}

/// An envelope as observed by a consumer of one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredEnvelope {
    /// The lane the envelope was routed to.
    pub partition: u32,
    /// Position of the envelope inside its lane, starting at zero.
    pub offset: u64,
    pub envelope: Envelope,
}
