//! Device-link datagram format.
//!
//! ```text
//! [0xA5][len][checksum][control][id][body ...]
//!                      \________ payload ________/
//! ```
//!
//! `len` counts payload bytes and `checksum` is their sum modulo 256. Bit 7 of
//! `control` marks a response; bits 0-6 carry the packet type.

use bytes::{BufMut, Bytes, BytesMut};

use crate::correlation::CorrelationId;
use crate::{Result, RpcError};

/// First byte of every link frame.
pub const SYNC: u8 = 0xA5;

/// Sync, length and checksum bytes.
pub const HEADER_LEN: usize = 3;

/// Largest body a single frame can carry.
pub const MAX_BODY: usize = u8::MAX as usize - 2;

const RESPONSE_FLAG: u8 = 0x80;
const TYPE_MASK: u8 = 0x7F;

/// Well-known packet types.
pub mod packet_type {
    pub const STATE_CHANGE: u8 = 0x00;
    pub const ERROR: u8 = 0x01;
    pub const REGISTER_READ: u8 = 0x08;
    pub const REGISTER_WRITE: u8 = 0x09;
    pub const DISCOVERY: u8 = 0x0F;
}

/// One decoded link datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPacket {
    // ---
    pub packet_type: u8,
    pub id: CorrelationId,
    pub response: bool,
    pub body: Bytes,
}

impl LinkPacket {
    // ---

    /// A request (or, with id 0, a notification) of the given type.
    pub fn request(packet_type: u8, id: CorrelationId, body: impl Into<Bytes>) -> Self {
        Self {
            packet_type: packet_type & TYPE_MASK,
            id,
            response: false,
            body: body.into(),
        }
    }

    /// A response to the request carrying `id`.
    pub fn response(packet_type: u8, id: CorrelationId, body: impl Into<Bytes>) -> Self {
        Self {
            response: true,
            ..Self::request(packet_type, id, body)
        }
    }

    /// Broadcast probe asking every device to identify itself.
    pub fn discovery_request() -> Self {
        Self::request(packet_type::DISCOVERY, CorrelationId::NOTIFICATION, Bytes::new())
    }

    /// A device's answer to a discovery probe.
    pub fn discovery_response(vendor: &str, model: &str) -> Self {
        Self::response(
            packet_type::DISCOVERY,
            CorrelationId::NOTIFICATION,
            Bytes::from(format!("{vendor},{model}")),
        )
    }

    pub fn is_discovery_response(&self) -> bool {
        self.response && self.packet_type == packet_type::DISCOVERY
    }

    fn control(&self) -> u8 {
        let flag = if self.response { RESPONSE_FLAG } else { 0 };
        flag | (self.packet_type & TYPE_MASK)
    }

    /// Serialize into a complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidPacket`] if the body exceeds [`MAX_BODY`].
    pub fn encode(&self) -> Result<Bytes> {
        // ---
        if self.body.len() > MAX_BODY {
            return Err(RpcError::InvalidPacket(format!(
                "body of {} bytes exceeds {MAX_BODY}",
                self.body.len()
            )));
        }

        let mut payload = BytesMut::with_capacity(2 + self.body.len());
        payload.put_u8(self.control());
        payload.put_u8(self.id.get());
        payload.put_slice(&self.body);

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u8(SYNC);
        frame.put_u8(payload.len() as u8);
        frame.put_u8(checksum(&payload));
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Parse and verify a complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidPacket`] on a bad sync byte, a length that
    /// does not match the datagram, or a checksum mismatch.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        // ---
        if frame.len() < HEADER_LEN + 2 {
            return Err(RpcError::InvalidPacket(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame[0] != SYNC {
            return Err(RpcError::InvalidPacket(format!(
                "bad sync byte {:#04x}",
                frame[0]
            )));
        }

        let len = frame[1] as usize;
        let payload = &frame[HEADER_LEN..];
        if payload.len() != len {
            return Err(RpcError::InvalidPacket(format!(
                "length mismatch: header says {len}, got {}",
                payload.len()
            )));
        }

        let expected = checksum(payload);
        if frame[2] != expected {
            return Err(RpcError::InvalidPacket(format!(
                "checksum mismatch: got {:#04x}, expected {expected:#04x}",
                frame[2]
            )));
        }

        let control = payload[0];
        Ok(Self {
            packet_type: control & TYPE_MASK,
            id: CorrelationId::new(payload[1]),
            response: control & RESPONSE_FLAG != 0,
            body: Bytes::copy_from_slice(&payload[2..]),
        })
    }
}

/// Sum of `payload` modulo 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}
