//! Packet framing.
//!
//! Every frame on the wire is a fixed 11-byte header followed by the body:
//!
//! ```text
//! u8   magic
//! u8   message type      (0=request, 1=response, 2=ping, 3=pong)
//! u8   serializer type
//! i32  opaque            (0 for heartbeats)
//! i32  body length
//! [u8] body
//! ```
//!
//! All integers are big-endian. [`PacketCodec`] is a `tokio_util` decoder and
//! encoder, so a socket half can be wrapped in `FramedRead`/`FramedWrite`
//! directly.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtocolError;

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 11;

/// Default protocol magic.
pub const DEFAULT_MAGIC: u8 = 0x42;

/// Default maximum body size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Opaque value reserved for unsolicited frames (heartbeats).
pub const UNSOLICITED_OPAQUE: i32 = 0;

/// Message type carried in the packet header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Ping = 2,
    Pong = 3,
}

impl MessageType {
    /// Convert from the wire byte.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => MessageType::Request,
            1 => MessageType::Response,
            2 => MessageType::Ping,
            3 => MessageType::Pong,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Heartbeat frames carry no body and never reach the serializer.
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageType::Ping | MessageType::Pong)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        MessageType::from_u8(val).ok_or(ProtocolError::UnknownMessageType(val))
    }
}

impl From<MessageType> for u8 {
    fn from(ty: MessageType) -> u8 {
        ty.as_u8()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::Response => write!(f, "response"),
            MessageType::Ping => write!(f, "ping"),
            MessageType::Pong => write!(f, "pong"),
        }
    }
}

/// Fixed-layout packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u8,
    pub message_type: MessageType,
    pub serializer_type: u8,
    pub opaque: i32,
    pub body_length: i32,
}

impl PacketHeader {
    /// Header for a heartbeat frame: opaque 0, empty body.
    pub fn heartbeat(magic: u8, message_type: MessageType, serializer_type: u8) -> Self {
        Self {
            magic,
            message_type,
            serializer_type,
            opaque: UNSOLICITED_OPAQUE,
            body_length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.magic;
        out[1] = self.message_type.as_u8();
        out[2] = self.serializer_type;
        out[3..7].copy_from_slice(&self.opaque.to_be_bytes());
        out[7..11].copy_from_slice(&self.body_length.to_be_bytes());
        out
    }

    /// Parse a header without checking the magic or the body length.
    fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        debug_assert!(bytes.len() >= HEADER_LEN);
        let message_type = MessageType::try_from(bytes[1])?;
        let opaque = i32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        let body_length = i32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        Ok(Self {
            magic: bytes[0],
            message_type,
            serializer_type: bytes[2],
            opaque,
            body_length,
        })
    }
}

/// Transport-level envelope: header plus opaque body bytes.
///
/// `body.len() == header.body_length` holds for every packet produced by
/// [`Packet::new`] or [`PacketCodec::decode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    /// Build a packet, stamping the header's body length from `body`.
    pub fn new(mut header: PacketHeader, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        header.body_length = body.len().min(i32::MAX as usize) as i32;
        Self { header, body }
    }

    /// Total encoded size of this packet.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

/// Length-delimited packet codec.
///
/// Decoding never consumes a partial frame: until the header and the whole
/// declared body are buffered, `decode` returns `Ok(None)` and leaves the
/// buffer untouched.
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    magic: u8,
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new(magic: u8, max_frame_size: usize) -> Self {
        Self {
            magic,
            max_frame_size,
        }
    }

    pub fn magic(&self) -> u8 {
        self.magic
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Validate the header at the front of `src` and return it with the body length.
    fn peek_header(&self, src: &[u8]) -> Result<(PacketHeader, usize), ProtocolError> {
        if src[0] != self.magic {
            return Err(ProtocolError::BadMagic {
                expected: self.magic,
                found: src[0],
            });
        }
        let header = PacketHeader::parse(src)?;
        if header.body_length < 0 {
            return Err(ProtocolError::NegativeBodyLength(header.body_length));
        }
        let body_len = header.body_length as usize;
        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_size,
            });
        }
        if header.message_type.is_heartbeat() && body_len != 0 {
            return Err(ProtocolError::HeartbeatWithBody(body_len));
        }
        Ok((header, body_len))
    }

    /// Decode one packet from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode_packet(&self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let (header, body_len) = self.peek_header(&src[..HEADER_LEN])?;
        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Packet { header, body }))
    }

    /// Append the encoding of `packet` to `dst`.
    pub fn encode_packet(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body_len = packet.body.len();
        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_size,
            });
        }
        if packet.header.body_length as usize != body_len {
            return Err(ProtocolError::LengthMismatch {
                header: packet.header.body_length,
                body: body_len,
            });
        }

        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(&packet.header.to_bytes());
        dst.put_slice(&packet.body);
        Ok(())
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAGIC, DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        self.decode_packet(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        match self.decode_packet(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedFrame(src.len())),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode_packet(&packet, dst)
    }
}
