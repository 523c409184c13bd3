//! Body serializers.
//!
//! The serializer type byte in every packet header selects the
//! [`BodySerializer`] used for its body. Two are built in: postcard (the
//! default) and JSON. Deployments can register their own under any free tag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::{CodecError, Request, Response};

/// Built-in encodings and their wire tags.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Postcard: compact binary format (default).
    Postcard = 1,
    /// JSON: human-readable format (for debugging/tooling).
    Json = 2,
}

impl Encoding {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Encoding {
    type Error = UnknownEncoding;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Encoding::Postcard),
            2 => Ok(Encoding::Json),
            _ => Err(UnknownEncoding(v)),
        }
    }
}

impl From<Encoding> for u8 {
    fn from(encoding: Encoding) -> u8 {
        encoding.as_u8()
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Postcard => write!(f, "postcard"),
            Encoding::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = UnknownEncodingName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postcard" => Ok(Encoding::Postcard),
            "json" => Ok(Encoding::Json),
            other => Err(UnknownEncodingName(other.to_string())),
        }
    }
}

/// Error when converting from an unknown encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown encoding: {0}")]
pub struct UnknownEncoding(pub u8);

/// Error when parsing an unknown encoding name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown encoding name: {0:?}")]
pub struct UnknownEncodingName(pub String);

/// A serde data format that bodies can be written in.
///
/// Implementors are zero-sized markers; every [`Codec`] is also a
/// [`BodySerializer`] through a blanket impl, answering to the tag of its
/// [`Codec::ENCODING`]. Encoding a [`Request`] or [`Response`] and decoding
/// it again must give back an equal value, down to the bits of every
/// `f64`.
pub trait Codec {
    const ENCODING: Encoding;

    type EncodeError: std::error::Error;
    type DecodeError: std::error::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode a whole body. Trailing bytes are the format's business:
    /// postcard ignores them, JSON rejects anything but whitespace.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard, tag 1 and the default.
///
/// Compact varint encoding, not self-describing: both ends must agree on
/// the envelope types, which they do since both sides link this crate.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// JSON, tag 2. Readable on the wire, for tooling and debugging.
///
/// Floats are parsed with `serde_json`'s `float_roundtrip` so finite values
/// come back bit for bit; non-finite ones use the string forms documented
/// on [`Value::Float`](crate::Value::Float).
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

/// Object-safe body serializer selected at runtime by its tag.
pub trait BodySerializer: Send + Sync + 'static {
    /// The serializer type byte this serializer answers to.
    fn tag(&self) -> u8;

    fn name(&self) -> &str;

    fn serialize_request(&self, request: &Request) -> Result<Vec<u8>, CodecError>;

    fn deserialize_request(&self, body: &[u8]) -> Result<Request, CodecError>;

    fn serialize_response(&self, response: &Response) -> Result<Vec<u8>, CodecError>;

    fn deserialize_response(&self, body: &[u8]) -> Result<Response, CodecError>;
}

fn serialization_error(e: impl std::error::Error) -> CodecError {
    CodecError::Serialization(e.to_string())
}

impl<C> BodySerializer for C
where
    C: Codec + Send + Sync + 'static,
{
    fn tag(&self) -> u8 {
        C::ENCODING.as_u8()
    }

    fn name(&self) -> &str {
        match C::ENCODING {
            Encoding::Postcard => "postcard",
            Encoding::Json => "json",
        }
    }

    fn serialize_request(&self, request: &Request) -> Result<Vec<u8>, CodecError> {
        C::encode(request).map_err(serialization_error)
    }

    fn deserialize_request(&self, body: &[u8]) -> Result<Request, CodecError> {
        C::decode(body).map_err(serialization_error)
    }

    fn serialize_response(&self, response: &Response) -> Result<Vec<u8>, CodecError> {
        C::encode(response).map_err(serialization_error)
    }

    fn deserialize_response(&self, body: &[u8]) -> Result<Response, CodecError> {
        C::decode(body).map_err(serialization_error)
    }
}

/// Serializer lookup by tag.
///
/// Populated at configuration time and shared read-only afterwards.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<u8, Arc<dyn BodySerializer>>,
}

impl SerializerRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            serializers: HashMap::new(),
        }
    }

    /// Registry holding the built-in postcard and JSON serializers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PostcardCodec));
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Register a serializer under its tag, replacing any previous one.
    pub fn register(&mut self, serializer: Arc<dyn BodySerializer>) {
        let tag = serializer.tag();
        if let Some(old) = self.serializers.insert(tag, serializer) {
            tracing::debug!(tag, replaced = old.name(), "replaced body serializer");
        }
    }

    pub fn get(&self, tag: u8) -> Result<&Arc<dyn BodySerializer>, CodecError> {
        self.serializers
            .get(&tag)
            .ok_or(CodecError::UnsupportedSerializer(tag))
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.serializers.contains_key(&tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = u8> + '_ {
        self.serializers.keys().copied()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<u8> = self.tags().collect();
        tags.sort_unstable();
        f.debug_struct("SerializerRegistry")
            .field("tags", &tags)
            .finish()
    }
}
