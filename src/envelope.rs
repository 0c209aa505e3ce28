//! Envelopes are the unit of traffic between the implant and the server.
//! The payload is opaque to the transport core; only the reserved types
//! below are ever inspected here.
//!
//! Stream carriers frame envelopes with a 4-byte big-endian length prefix
//! followed by the serialized envelope bytes. Request/response style
//! carriers ship the serialized bytes as-is inside their own structure.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Message types reserved by the transport core. Everything else is
/// dispatched by the upper layers without the core looking inside.
pub mod msg {
    /// Zero-payload keep-alive probe emitted by stream carriers
    pub const PING: u32 = 1;
    /// Chunk of a multiplexed tunnel byte-stream
    pub const TUNNEL_DATA: u32 = 2;
    /// Notification that a tunnel has been torn down
    pub const TUNNEL_CLOSE: u32 = 3;
}

/// Typed message with an opaque payload
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Identifier correlating a response with its request, zero for
    /// unsolicited messages
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// The message type
    #[prost(uint32, tag = "2")]
    pub r#type: u32,
    /// Serialized message contents
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    /// Set on replies to messages whose type the peer didn't recognise
    #[prost(bool, tag = "4")]
    pub unknown_message_type: bool,
}

impl Envelope {
    /// Creates a new unsolicited envelope of the provided type
    pub fn new(ty: u32, data: Vec<u8>) -> Envelope {
        Envelope {
            id: 0,
            r#type: ty,
            data,
            unknown_message_type: false,
        }
    }

    /// Creates a zero-payload ping envelope
    pub fn ping() -> Envelope {
        Envelope::new(msg::PING, Vec::new())
    }
}

/// Frames larger than this are treated as a protocol violation rather
/// than an allocation request
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

/// Length of the frame length prefix in bytes
const PREFIX_LENGTH: usize = 4;

/// Codec for framed envelopes on byte-stream carriers
#[derive(Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PREFIX_LENGTH {
            return Ok(None);
        }

        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix.copy_from_slice(&src[..PREFIX_LENGTH]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length > MAX_FRAME_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length exceeds limit",
            ));
        }

        if src.len() < PREFIX_LENGTH + length {
            // Not enough data for the whole frame yet, reserve what we
            // know is coming and wait for more
            src.reserve(PREFIX_LENGTH + length - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LENGTH);
        let frame = src.split_to(length).freeze();
        let envelope = Envelope::decode(frame)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = envelope.encoded_len();
        if length > MAX_FRAME_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "envelope exceeds frame limit",
            ));
        }

        dst.reserve(PREFIX_LENGTH + length);
        dst.put_u32(length as u32);
        envelope
            .encode(dst)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
