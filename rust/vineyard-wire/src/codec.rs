//! Protocol message codec: packets ↔ typed messages.
//!
//! This is the only place that maps header message types to message shapes.

use bytes::Bytes;

use crate::{
    CodecError, Message, MessageType, Packet, PacketHeader, RequestMessage, ResponseMessage,
    SerializerRegistry,
};

#[derive(Clone, Debug)]
pub struct MessageCodec {
    magic: u8,
    serializers: SerializerRegistry,
}

impl MessageCodec {
    pub fn new(magic: u8, serializers: SerializerRegistry) -> Self {
        Self { magic, serializers }
    }

    pub fn magic(&self) -> u8 {
        self.magic
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    /// Decode a packet into a message.
    ///
    /// Heartbeats bypass the serializer. Requests and responses fail with
    /// [`CodecError::UnsupportedSerializer`] when the tag is unknown.
    pub fn decode(&self, packet: Packet) -> Result<Message, CodecError> {
        let header = packet.header;
        match header.message_type {
            MessageType::Ping => Ok(Message::Ping(header)),
            MessageType::Pong => Ok(Message::Pong(header)),
            MessageType::Request => {
                let serializer = self.serializers.get(header.serializer_type)?;
                let request = serializer.deserialize_request(&packet.body)?;
                Ok(Message::Request(RequestMessage { header, request }))
            }
            MessageType::Response => {
                let serializer = self.serializers.get(header.serializer_type)?;
                let response = serializer.deserialize_response(&packet.body)?;
                Ok(Message::Response(ResponseMessage { header, response }))
            }
        }
    }

    /// Encode a message, stamping magic, type, serializer, opaque and length.
    pub fn encode(&self, message: &Message) -> Result<Packet, CodecError> {
        let (serializer_type, body) = match message {
            Message::Ping(h) | Message::Pong(h) => (h.serializer_type, Bytes::new()),
            Message::Request(m) => {
                let serializer = self.serializers.get(m.header.serializer_type)?;
                let body = serializer.serialize_request(&m.request)?;
                (m.header.serializer_type, Bytes::from(body))
            }
            Message::Response(m) => {
                let serializer = self.serializers.get(m.header.serializer_type)?;
                let body = serializer.serialize_response(&m.response)?;
                (m.header.serializer_type, Bytes::from(body))
            }
        };

        let header = PacketHeader {
            magic: self.magic,
            message_type: message.message_type(),
            serializer_type,
            opaque: message.opaque(),
            body_length: 0,
        };
        Ok(Packet::new(header, body))
    }
}
