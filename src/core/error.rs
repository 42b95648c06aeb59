//! Error types for LSPT.
//!
//! The taxonomy has four families: framing (malformed or truncated units),
//! integrity (CRC or AEAD tag mismatch), protocol (handshake message that
//! does not fit the current state) and state (operation invalid for the
//! current state). FSM transitions report failure as `false` and never
//! surface here.

use thiserror::Error;

/// Malformed or truncated packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Packet is shorter than the fixed minimum or a field runs past the end.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// A varint ran off the end of the buffer.
    #[error("truncated varint")]
    TruncatedVarint,

    /// A varint does not fit the field it encodes.
    #[error("varint overflows its field")]
    VarintOverflow,

    /// Payload cannot be described by the 16-bit size field.
    #[error("payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    /// Declared payload size does not match the bytes that follow.
    #[error("payload length mismatch: header declares {declared}, {actual} bytes present")]
    PayloadLengthMismatch {
        /// Size declared in the header.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },

    /// Packet type does not fit in four bits.
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidPacketType(u8),

    /// Version nibble is not one we speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

/// Errors produced by the packet codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Framing error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// CRC-32C mismatch.
    #[error("integrity error: crc 0x{expected:08x} transmitted, 0x{actual:08x} computed")]
    Integrity {
        /// CRC carried by the packet.
        expected: u32,
        /// CRC recomputed over the received bytes.
        actual: u32,
    },
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted ciphertext).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key or IV has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key agreement produced a non-contributory secret.
    #[error("key exchange failed")]
    KeyExchangeFailed,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Handshake messages that violate the protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Message does not start with an identifier we accept from peers.
    #[error("unknown or unaccepted role identifier")]
    UnknownIdentifier,

    /// Key payload has the wrong length.
    #[error("invalid public key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length.
        expected: usize,
        /// Length after stripping the identifier.
        actual: usize,
    },

    /// Message arrived after the handshake completed.
    #[error("handshake already established")]
    AlreadyEstablished,

    /// Only the relay role forwards handshake traffic.
    #[error("only the relay role forwards handshake traffic")]
    NotRelay,
}

/// Errors in the handshake layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer sent a message that does not fit the handshake.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Operation requires a different handshake state.
    #[error("state error: expected {expected}, handshake is {actual}")]
    State {
        /// Required state.
        expected: &'static str,
        /// Current state.
        actual: &'static str,
    },

    /// Key agreement failed.
    #[error("key exchange error: {0}")]
    KeyExchange(#[from] CryptoError),
}

/// Errors in the session pipeline.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection is not in ESTABLISHED.
    #[error("connection not established")]
    NotEstablished,

    /// Encryption is required but the handshake has not completed.
    #[error("secure handshake incomplete")]
    HandshakeIncomplete,

    /// A handshake is already running or complete.
    #[error("handshake already started")]
    HandshakeInProgress,

    /// Package needs more chunks than a 32-bit sequence space allows.
    #[error("package too large: {0} bytes")]
    PackageTooLarge(usize),

    /// Transport refused the datagram.
    #[error("transport closed")]
    TransportClosed,

    /// Operation does not fit the connection state.
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Connection state at the time.
        state: &'static str,
    },

    /// Retransmission limit reached without an answer.
    #[error("peer unresponsive after {attempts} retransmissions")]
    PeerUnresponsive {
        /// Retransmissions attempted.
        attempts: u32,
    },
}

/// Classification of an error into the protocol's error families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or truncated unit.
    Framing,
    /// CRC or AEAD tag mismatch.
    Integrity,
    /// Handshake message inconsistent with state.
    Protocol,
    /// Operation invalid for the current state.
    State,
    /// Invalid configuration.
    Config,
    /// Underlying transport failure.
    Transport,
}

/// Top-level LSPT errors.
#[derive(Debug, Error)]
pub enum LsptError {
    /// Packet codec error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Handshake error.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FramingError> for LsptError {
    fn from(err: FramingError) -> Self {
        LsptError::Packet(PacketError::Framing(err))
    }
}

impl LsptError {
    /// Map this error onto the protocol's error families.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LsptError::Packet(PacketError::Framing(_)) => ErrorKind::Framing,
            LsptError::Packet(PacketError::Integrity { .. }) => ErrorKind::Integrity,
            LsptError::Crypto(CryptoError::DecryptionFailed) => ErrorKind::Integrity,
            LsptError::Crypto(_) => ErrorKind::Protocol,
            LsptError::Handshake(HandshakeError::State { .. }) => ErrorKind::State,
            LsptError::Handshake(_) => ErrorKind::Protocol,
            LsptError::Session(SessionError::TransportClosed) => ErrorKind::Transport,
            LsptError::Session(SessionError::PeerUnresponsive { .. }) => ErrorKind::Transport,
            LsptError::Session(SessionError::PackageTooLarge(_)) => ErrorKind::Framing,
            LsptError::Session(_) => ErrorKind::State,
            LsptError::Config(_) => ErrorKind::Config,
            LsptError::Io(_) => ErrorKind::Transport,
        }
    }

    /// Check if the offending unit should be discarded without a response.
    ///
    /// Corrupted frames are dropped at the codec boundary; the sender's
    /// retransmission logic recovers them.
    pub fn is_silent_drop(&self) -> bool {
        matches!(self.kind(), ErrorKind::Framing | ErrorKind::Integrity)
    }

    /// Check if this error ends the handshake or the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Transport)
    }
}

/// Result type for LSPT operations.
pub type LsptResult<T> = Result<T, LsptError>;
