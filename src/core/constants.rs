//! Protocol constants for LSPT.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed
//! without bumping [`PROTOCOL_VERSION`].

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in the high nibble of the flags byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Smallest byte count the packet decoder will even look at.
///
/// flags (1) + three one-byte varints (collapsible) + payload size (2) + CRC (4).
pub const MIN_PACKET_SIZE: usize = 8;

/// Size of the little-endian payload size field.
pub const PAYLOAD_SIZE_FIELD: usize = 2;

/// Size of the little-endian CRC-32C field.
pub const CRC_FIELD: usize = 4;

/// Largest payload a single packet can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Worst-case varint length of a 128-bit package identifier.
pub const MAX_PACKAGE_ID_VARINT: usize = 19;

/// Worst-case varint length of a 32-bit sequence or total count.
pub const MAX_U32_VARINT: usize = 5;

/// Worst-case header size (everything except the payload).
pub const MAX_HEADER_SIZE: usize =
    1 + MAX_PACKAGE_ID_VARINT + 2 * MAX_U32_VARINT + PAYLOAD_SIZE_FIELD + CRC_FIELD;

// =============================================================================
// CRYPTOGRAPHY
// =============================================================================

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 shared secret size.
pub const SHARED_SECRET_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size.
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size.
pub const AEAD_IV_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Identifier byte for the ground segment.
pub const GROUND_IDENTIFIER: u8 = b'G';

/// Identifier byte for the space segment (airborne nodes).
pub const SPACE_IDENTIFIER: u8 = b'E';

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default maximum datagram size handed to the transport.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1200;

/// Default receive window in bytes.
pub const DEFAULT_RECEIVE_WINDOW: u32 = 1024 * 1024;

/// Default keep-alive interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Grace added to the keep-alive interval before a peer is declared dead.
pub const KEEPALIVE_TOLERANCE: Duration = Duration::from_millis(100);

/// Default TIME_WAIT linger.
pub const DEFAULT_TIME_WAIT: Duration = Duration::from_secs(2);

/// Initial congestion window, in packets.
pub const INITIAL_WINDOW: u32 = 10;

/// Maximum retransmission attempts for a single sequence number.
pub const MAX_RETRANSMITS: u32 = 10;
