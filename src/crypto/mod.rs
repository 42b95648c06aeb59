//! Security layer for LSPT.
//!
//! - [`HandshakeSession`]: role-tagged X25519 exchange between ground,
//!   airborne and relay nodes
//! - [`PacketCipher`]: HKDF-SHA256 directional keys and per-packet
//!   ChaCha20-Poly1305 sealing
//! - [`X25519`], [`ChaCha20Poly1305Aead`]: the default implementations of
//!   the [`KeyExchange`](crate::core::KeyExchange) and
//!   [`Aead`](crate::core::Aead) seams

mod aead;
mod handshake;
mod keys;

pub use aead::*;
pub use handshake::*;
pub use keys::*;
