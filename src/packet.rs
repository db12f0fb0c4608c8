//! Packet envelope.
//!
//! A packet is an opaque payload plus a small header. Routing depends on
//! exactly one of [`HEADER_OP`] / [`HEADER_EVENT`] being set; a packet with
//! neither or both is a protocol violation, fatal to that packet only.
//!
//! # Wire Layout
//!
//! ```text
//! ┌─────────┬────────────┬────────────────┬─────────────┬───────────┐
//! │ version │ header u16 │ partition i32  │ length u32  │ payload   │
//! │ 1 byte  │ big-endian │ -1 = none      │ big-endian  │ length B  │
//! └─────────┴────────────┴────────────────┴─────────────┴───────────┘
//! ```

use crate::cluster::PartitionId;
use crate::error::{EngineError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packet carries an operation (regular, backup, response or backup ack).
pub const HEADER_OP: u16 = 1 << 0;
/// Packet carries an event for a registered listener.
pub const HEADER_EVENT: u16 = 1 << 1;
/// Operation packet carries a response. Informational.
pub const HEADER_RESPONSE: u16 = 1 << 2;
/// Operation packet carries a backup acknowledgement. Informational.
pub const HEADER_BACKUP_RESPONSE: u16 = 1 << 3;
/// Mask of bits reserved for future use.
pub const HEADER_RESERVED: u16 = !(HEADER_OP | HEADER_EVENT | HEADER_RESPONSE | HEADER_BACKUP_RESPONSE);

/// Framing version written by this crate.
pub const PACKET_VERSION: u8 = 1;

const FIXED_HEADER_LEN: usize = 1 + 2 + 4 + 4;
const NO_PARTITION: i32 = -1;

/// Where an inbound packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRoute {
    Operation,
    Event,
}

/// Raw payload plus routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: u16,
    partition_id: Option<PartitionId>,
    payload: Bytes,
}

impl Packet {
    pub fn new(header: u16, partition_id: Option<PartitionId>, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            partition_id,
            payload: payload.into(),
        }
    }

    /// An operation packet.
    pub fn operation(payload: impl Into<Bytes>, partition_id: Option<PartitionId>) -> Self {
        Self::new(HEADER_OP, partition_id, payload)
    }

    /// An event packet.
    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self::new(HEADER_EVENT, None, payload)
    }

    pub fn with_header(mut self, flag: u16) -> Self {
        self.header |= flag;
        self
    }

    pub fn header(&self) -> u16 {
        self.header
    }

    pub fn is_header_set(&self, flag: u16) -> bool {
        self.header & flag == flag
    }

    pub fn partition_id(&self) -> Option<PartitionId> {
        self.partition_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Classify the packet by its routing flags.
    pub fn route(&self) -> Result<PacketRoute> {
        match (
            self.is_header_set(HEADER_OP),
            self.is_header_set(HEADER_EVENT),
        ) {
            (true, false) => Ok(PacketRoute::Operation),
            (false, true) => Ok(PacketRoute::Event),
            (true, true) => Err(EngineError::ProtocolViolation(format!(
                "packet has both operation and event flags set (header {:#06x})",
                self.header
            ))),
            (false, false) => Err(EngineError::ProtocolViolation(format!(
                "unknown packet type (header {:#06x})",
                self.header
            ))),
        }
    }

    /// Encode into the framed wire layout.
    pub fn encode(&self) -> Result<Bytes> {
        let partition = match self.partition_id {
            None => NO_PARTITION,
            Some(p) => i32::try_from(p).map_err(|_| {
                EngineError::ProtocolViolation(format!("partition id {p} does not fit the frame"))
            })?,
        };
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            EngineError::ProtocolViolation(format!(
                "payload of {} bytes does not fit the frame",
                self.payload.len()
            ))
        })?;
        let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + self.payload.len());
        buf.put_u8(PACKET_VERSION);
        buf.put_u16(self.header);
        buf.put_i32(partition);
        buf.put_u32(len);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one framed packet. Never panics on arbitrary input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(EngineError::ProtocolViolation(format!(
                "packet too short: {} bytes",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let version = buf.get_u8();
        if version != PACKET_VERSION {
            return Err(EngineError::ProtocolViolation(format!(
                "unsupported packet version {version}"
            )));
        }
        let header = buf.get_u16();
        let partition = buf.get_i32();
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(EngineError::ProtocolViolation(format!(
                "payload length mismatch: header says {len}, got {}",
                buf.remaining()
            )));
        }
        let partition_id = match partition {
            NO_PARTITION => None,
            p if p >= 0 => Some(p as PartitionId),
            p => {
                return Err(EngineError::ProtocolViolation(format!(
                    "negative partition id {p}"
                )))
            }
        };
        Ok(Self {
            header,
            partition_id,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
