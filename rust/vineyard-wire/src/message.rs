//! Request/response envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MessageType, PacketHeader, UNSOLICITED_OPAQUE};

/// A dynamically typed argument or result.
///
/// Encoded as an externally tagged enum so non-self-describing formats
/// (postcard) round-trip it exactly. Text formats spell non-finite floats
/// as strings; see [`Value::Float`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Any `f64`, NaN and infinities included. Binary formats carry the raw
    /// value. JSON has no literal for the non-finite ones, so they travel as
    /// `"inf"`, `"-inf"`, `"NaN"`, or `"NaN:0x<bits>"` for a NaN with a
    /// non-default payload.
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

mod float_repr {
    use std::fmt;

    use serde::{Deserializer, Serializer, de};

    /// Bit pattern of `f64::NAN`.
    const DEFAULT_NAN: u64 = 0x7ff8_0000_0000_0000;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() || !serializer.is_human_readable() {
            return serializer.serialize_f64(*value);
        }
        let name = if value.is_nan() {
            match value.to_bits() {
                DEFAULT_NAN => "NaN".to_string(),
                bits => format!("NaN:{bits:#018x}"),
            }
        } else if value.is_sign_positive() {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
        serializer.serialize_str(&name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(FloatVisitor)
        } else {
            deserializer.deserialize_f64(FloatVisitor)
        }
    }

    fn parse_non_finite(name: &str) -> Option<f64> {
        match name {
            "inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            "NaN" => Some(f64::from_bits(DEFAULT_NAN)),
            _ => {
                let bits = u64::from_str_radix(name.strip_prefix("NaN:0x")?, 16).ok()?;
                Some(f64::from_bits(bits)).filter(|v| v.is_nan())
            }
        }
    }

    struct FloatVisitor;

    impl de::Visitor<'_> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"inf\", \"-inf\" or \"NaN\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            parse_non_finite(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

/// The shape of a [`Value`], used for overload resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Floats, and integers widened to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Category of a request-level failure reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedSerializer,
    Serialization,
    UnknownService,
    NoMatchingMethod,
    AmbiguousMethod,
    ServiceInvocation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnsupportedSerializer => "unsupported serializer",
            ErrorKind::Serialization => "serialization",
            ErrorKind::UnknownService => "unknown service",
            ErrorKind::NoMatchingMethod => "no matching method",
            ErrorKind::AmbiguousMethod => "ambiguous method",
            ErrorKind::ServiceInvocation => "service invocation",
        };
        f.write_str(name)
    }
}

/// Structured failure carried in an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, copied into the response.
    pub opaque: i32,
    /// Caller deadline in milliseconds.
    pub timeout: i32,
    pub bean_name: String,
    pub method_name: String,
    pub arguments: Vec<Value>,
}

impl Request {
    pub fn new(
        bean_name: impl Into<String>,
        method_name: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            opaque: UNSOLICITED_OPAQUE,
            timeout: 0,
            bean_name: bean_name.into(),
            method_name: method_name.into(),
            arguments,
        }
    }

    pub fn with_opaque(mut self, opaque: i32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout = timeout_ms;
        self
    }
}

/// The outcome of a request: exactly one of a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub opaque: i32,
    pub outcome: Result<Value, RemoteError>,
}

impl Response {
    pub fn success(opaque: i32, result: Value) -> Self {
        Self {
            opaque,
            outcome: Ok(result),
        }
    }

    pub fn failure(opaque: i32, error: RemoteError) -> Self {
        Self {
            opaque,
            outcome: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RemoteError> {
        self.outcome.as_ref().err()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub header: PacketHeader,
    pub request: Request,
}

impl RequestMessage {
    /// Wrap a request, deriving the header opaque from the request.
    pub fn new(magic: u8, serializer_type: u8, request: Request) -> Self {
        Self {
            header: PacketHeader {
                magic,
                message_type: MessageType::Request,
                serializer_type,
                opaque: request.opaque,
                body_length: 0,
            },
            request,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub header: PacketHeader,
    pub response: Response,
}

impl ResponseMessage {
    pub fn new(magic: u8, serializer_type: u8, response: Response) -> Self {
        Self {
            header: PacketHeader {
                magic,
                message_type: MessageType::Response,
                serializer_type,
                opaque: response.opaque,
                body_length: 0,
            },
            response,
        }
    }

    /// Build the reply to `request`: same serializer, type flipped to response,
    /// opaque copied verbatim.
    pub fn reply_to(request: &RequestMessage, outcome: Result<Value, RemoteError>) -> Self {
        let response = Response {
            opaque: request.request.opaque,
            outcome,
        };
        Self {
            header: PacketHeader {
                magic: request.header.magic,
                message_type: MessageType::Response,
                serializer_type: request.header.serializer_type,
                opaque: request.request.opaque,
                body_length: 0,
            },
            response,
        }
    }
}

/// Every message shape that can travel through a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    Ping(PacketHeader),
    Pong(PacketHeader),
}

impl Message {
    pub fn ping(magic: u8, serializer_type: u8) -> Self {
        Message::Ping(PacketHeader::heartbeat(
            magic,
            MessageType::Ping,
            serializer_type,
        ))
    }

    pub fn pong(magic: u8, serializer_type: u8) -> Self {
        Message::Pong(PacketHeader::heartbeat(
            magic,
            MessageType::Pong,
            serializer_type,
        ))
    }

    pub fn header(&self) -> &PacketHeader {
        match self {
            Message::Request(m) => &m.header,
            Message::Response(m) => &m.header,
            Message::Ping(h) | Message::Pong(h) => h,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
        }
    }

    pub fn opaque(&self) -> i32 {
        match self {
            Message::Request(m) => m.request.opaque,
            Message::Response(m) => m.response.opaque,
            Message::Ping(_) | Message::Pong(_) => UNSOLICITED_OPAQUE,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Message::Ping(_) | Message::Pong(_))
    }
}
