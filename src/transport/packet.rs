//! Packet encoding and decoding.
//!
//! Wire format:
//!
//! ```text
//! +--------+-----------+----------+---------+--------------+---------+---------+
//! | flags  | packageId | sequence | total   | payload size | CRC-32C | payload |
//! | 1 byte | varint    | varint   | varint  | 2 bytes LE   | 4 B LE  | N bytes |
//! +--------+-----------+----------+---------+--------------+---------+---------+
//! ```
//!
//! The flags byte packs the protocol version (high nibble) and the packet
//! type (low nibble). The CRC covers every field except itself, in wire
//! order.

use tracing::trace;

use super::checksum::Crc32c;
use crate::core::constants::{MAX_PAYLOAD_SIZE, MIN_PACKET_SIZE, PROTOCOL_VERSION};
use crate::core::{FramingError, PacketError};

/// Packet types carried in the low nibble of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Package chunk.
    Data = 0,
    /// Active open.
    Syn = 1,
    /// Reply to an active open.
    SynAck = 2,
    /// Acknowledgement of a handshake step, a chunk or a FIN.
    Ack = 3,
    /// Graceful close.
    Fin = 4,
    /// Abort the connection.
    Reset = 5,
    /// Liveness check.
    KeepAlive = 6,
    /// Receive window advertisement.
    WindowUpdate = 7,
    /// Secure handshake message.
    Handshake = 8,
}

impl PacketType {
    /// Parse a packet type from its nibble.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Data),
            1 => Some(Self::Syn),
            2 => Some(Self::SynAck),
            3 => Some(Self::Ack),
            4 => Some(Self::Fin),
            5 => Some(Self::Reset),
            6 => Some(Self::KeepAlive),
            7 => Some(Self::WindowUpdate),
            8 => Some(Self::Handshake),
            _ => None,
        }
    }

    /// Nibble value of this type.
    pub fn as_nibble(self) -> u8 {
        self as u8
    }
}

impl From<PacketType> for u8 {
    fn from(kind: PacketType) -> Self {
        kind.as_nibble()
    }
}

/// Append the base-128 varint encoding of `value` to `out`.
///
/// Seven data bits per byte, least significant group first, high bit set
/// on every byte except the last. Always produces the canonical form.
pub fn write_varint(mut value: u128, out: &mut Vec<u8>) {
    loop {
        let group = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(group);
            return;
        }
        out.push(group | 0x80);
    }
}

/// Number of bytes the canonical varint encoding of `value` takes.
pub fn varint_len(value: u128) -> usize {
    let bits = 128 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Read a varint starting at `*pos`, advancing `*pos` past it.
///
/// Accepts non-canonical encodings (redundant zero groups) as long as no
/// set bit lands beyond `bits`.
pub fn read_varint(buf: &[u8], pos: &mut usize, bits: u32) -> Result<u128, FramingError> {
    let mut value: u128 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *buf.get(*pos).ok_or(FramingError::TruncatedVarint)?;
        *pos += 1;

        let group = (byte & 0x7F) as u128;
        if group != 0 {
            if shift >= bits {
                return Err(FramingError::VarintOverflow);
            }
            let room = bits - shift;
            if room < 7 && group >> room != 0 {
                return Err(FramingError::VarintOverflow);
            }
            value |= group << shift;
        }

        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift = shift.saturating_add(7);
    }
}

fn read_u32_varint(buf: &[u8], pos: &mut usize) -> Result<u32, FramingError> {
    let value = read_varint(buf, pos, 32)?;
    u32::try_from(value).map_err(|_| FramingError::VarintOverflow)
}

/// Build the flags byte.
fn flags(packet_type: u8) -> Result<u8, FramingError> {
    if packet_type > 0x0F {
        return Err(FramingError::InvalidPacketType(packet_type));
    }
    Ok((PROTOCOL_VERSION << 4) | packet_type)
}

/// Header fields that identify a packet: flags and the three varints.
///
/// This is the prefix the CRC starts from; the session layer also uses it
/// as AEAD associated data.
pub fn header_prefix(
    packet_type: u8,
    package_id: u128,
    sequence_number: u32,
    total_packets: u32,
) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(
        1 + varint_len(package_id)
            + varint_len(sequence_number as u128)
            + varint_len(total_packets as u128),
    );
    out.push(flags(packet_type)?);
    write_varint(package_id, &mut out);
    write_varint(sequence_number as u128, &mut out);
    write_varint(total_packets as u128, &mut out);
    Ok(out)
}

/// Encode a packet.
pub fn encode(
    packet_type: u8,
    package_id: u128,
    sequence_number: u32,
    total_packets: u32,
    payload: &[u8],
) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FramingError::PayloadTooLarge(payload.len()));
    }
    let payload_size = (payload.len() as u16).to_le_bytes();

    let mut out = header_prefix(packet_type, package_id, sequence_number, total_packets)?;
    out.reserve(payload_size.len() + 4 + payload.len());
    out.extend_from_slice(&payload_size);

    let mut crc = Crc32c::new();
    crc.update(&out);
    crc.update(payload);
    out.extend_from_slice(&crc.finalize().to_le_bytes());
    out.extend_from_slice(payload);

    trace!(
        packet_type,
        sequence_number,
        total_packets,
        payload_len = payload.len(),
        "encoded packet"
    );
    Ok(out)
}

/// Decode a packet.
///
/// Every read is bounds-checked; on failure nothing is returned but the
/// error.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    if bytes.len() < MIN_PACKET_SIZE {
        return Err(FramingError::TooShort {
            expected: MIN_PACKET_SIZE,
            actual: bytes.len(),
        }
        .into());
    }

    let flags = bytes[0];
    let mut pos = 1;
    let package_id = read_varint(bytes, &mut pos, 128)?;
    let sequence_number = read_u32_varint(bytes, &mut pos)?;
    let total_packets = read_u32_varint(bytes, &mut pos)?;

    let size_at = pos;
    let payload_at = size_at + 6;
    if bytes.len() < payload_at {
        return Err(FramingError::TooShort {
            expected: payload_at,
            actual: bytes.len(),
        }
        .into());
    }

    let payload_size = u16::from_le_bytes([bytes[size_at], bytes[size_at + 1]]) as usize;
    let transmitted = u32::from_le_bytes([
        bytes[size_at + 2],
        bytes[size_at + 3],
        bytes[size_at + 4],
        bytes[size_at + 5],
    ]);

    let present = bytes.len() - payload_at;
    if present != payload_size {
        return Err(FramingError::PayloadLengthMismatch {
            declared: payload_size,
            actual: present,
        }
        .into());
    }

    let payload = &bytes[payload_at..];
    let mut crc = Crc32c::new();
    crc.update(&bytes[..size_at + 2]);
    crc.update(payload);
    let computed = crc.finalize();
    if computed != transmitted {
        return Err(PacketError::Integrity {
            expected: transmitted,
            actual: computed,
        });
    }

    let version = flags >> 4;
    if version != PROTOCOL_VERSION {
        return Err(FramingError::UnsupportedVersion(version).into());
    }

    let packet = Packet {
        version,
        packet_type: flags & 0x0F,
        package_id,
        sequence_number,
        total_packets,
        payload: payload.to_vec(),
        crc: transmitted,
    };
    trace!(
        packet_type = packet.packet_type,
        sequence_number,
        total_packets,
        payload_len = payload_size,
        "decoded packet"
    );
    Ok(packet)
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (high nibble of flags).
    pub version: u8,
    /// Packet type (low nibble of flags), 0..=15.
    pub packet_type: u8,
    /// Package this packet belongs to (0 for control packets).
    pub package_id: u128,
    /// Position of this packet within its package.
    pub sequence_number: u32,
    /// Number of packets in the package.
    pub total_packets: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// CRC-32C as transmitted.
    pub crc: u32,
}

impl Packet {
    /// The typed packet type, if this is one the session layer knows.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_nibble(self.packet_type)
    }

    /// Re-encode this packet.
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        encode(
            self.packet_type,
            self.package_id,
            self.sequence_number,
            self.total_packets,
            &self.payload,
        )
    }
}
