//! # LSPT Protocol
//!
//! A reliable, message-oriented transport for intermittent, high-latency
//! links between ground stations, airborne nodes and relays.
//!
//! LSPT moves opaque *packages* over any datagram carrier. It provides:
//!
//! - **Integrity**: every packet carries a CRC-32C over header and payload
//! - **Reliability**: per-chunk acknowledgement with RTO-driven retransmission
//! - **Congestion control**: CUBIC windows with packet pacing
//! - **Flow control**: receiver-advertised windows
//! - **Security**: a role-tagged X25519 handshake and ChaCha20-Poly1305
//!   sealing of every data packet
//!
//! ## Feature Flags
//!
//! - `transport` (default): datagram carriers (UDP socket, in-memory pair)
//! - `crypto` (default): handshake and packet encryption
//! - `session` (default): the end-to-end [`session::Session`] pipeline
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, configuration and capability traits
//! - [`transport`]: checksum, packet codec, connection state machine, CUBIC
//! - [`package`]: packages, chunking and reassembly
//! - [`crypto`]: secure handshake and packet cipher (requires `crypto`)
//! - [`session`]: the assembled pipeline (requires `session`)
//!
//! ## Example Usage
//!
//! ```rust
//! use lspt_protocol::prelude::*;
//!
//! let (ground_link, drone_link) = MemoryTransport::pair();
//! let mut ground = Session::new(ground_link, ProtocolConfig::default(), Role::Ground)?;
//! let mut drone = Session::new(drone_link, ProtocolConfig::default(), Role::Airborne)?;
//!
//! ground.connect()?;
//! ground.send_package(Package::new(vec![7u8; 4000]))?;
//!
//! let package = loop {
//!     ground.poll()?;
//!     drone.poll()?;
//!     if let Some(package) = drone.recv_package() {
//!         break package;
//!     }
//! };
//! assert_eq!(package.size(), 4000);
//! # Ok::<(), lspt_protocol::LsptError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer; the carriers inside are feature-gated
pub mod transport;

// Packages, chunking and reassembly
pub mod package;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Session pipeline (feature-gated)
#[cfg(feature = "session")]
#[cfg_attr(docsrs, doc(cfg(feature = "session")))]
pub mod session;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    pub use crate::package::{Package, PackageId};
    pub use crate::transport::{Connection, ConnectionState, CubicController, PacketType};

    #[cfg(feature = "transport")]
    pub use crate::transport::{DatagramSocket, MemoryTransport};

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{HandshakeSession, HandshakeState, PacketCipher, Role};

    #[cfg(feature = "session")]
    pub use crate::session::{Session, SessionStats};
}

// Re-export commonly used items at crate root
pub use crate::core::{ErrorKind, LsptError, LsptResult, ProtocolConfig};
pub use crate::package::{Package, PackageId};
pub use crate::transport::{ConnectionState, Packet, PacketType, decode, encode};

#[cfg(feature = "session")]
pub use crate::session::Session;
