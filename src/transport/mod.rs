//! LSPT transport layer.
//!
//! - **Checksum**: CRC-32C ([`checksum`])
//! - **Packet codec**: varint header, payload and CRC ([`Packet`], [`encode`], [`decode`])
//! - **Retransmission bookkeeping**: [`RetransmissionManager`]
//! - **Congestion control**: CUBIC ([`CubicController`])
//! - **Connection state machine**: [`Connection`] with flow control and keep-alive
//! - **RTT estimation**: [`RttEstimator`] implementing RFC 6298
//! - **Datagram carriers**: [`DatagramSocket`], [`MemoryTransport`] (feature `transport`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Session (packages, handshake)      │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │  codec, FSM, CUBIC, retransmission      │
//! ├─────────────────────────────────────────┤
//! │   Datagram carrier (UDP, radio, ...)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Everything here is synchronous and owned by one connection; no
//! component performs I/O except the carriers.

pub mod checksum;
mod congestion;
mod connection;
mod packet;
mod retransmit;
#[cfg(feature = "transport")]
mod socket;
mod timing;

pub use congestion::{CubicController, constants as congestion_constants};
pub use connection::*;
pub use packet::*;
pub use retransmit::RetransmissionManager;
#[cfg(feature = "transport")]
pub use socket::*;
pub use timing::{RttEstimator, constants as timing_constants};
