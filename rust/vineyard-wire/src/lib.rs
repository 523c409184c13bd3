//! Wire types for vineyard.
//!
//! Bytes become [`Packet`]s through the [`PacketCodec`], and packets become
//! typed [`Message`]s through the [`MessageCodec`], which picks a
//! [`BodySerializer`] by the serializer type carried in each header.

#![deny(unsafe_code)]

mod codec;
mod error;
mod message;
mod packet;
mod serializer;

pub use codec::*;
pub use error::*;
pub use message::*;
pub use packet::*;
pub use serializer::*;
