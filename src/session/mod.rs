//! End-to-end LSPT sessions.
//!
//! A [`Session`] ties the layers together over any
//! [`Transport`](crate::core::Transport):
//!
//! ```text
//! send_package ─► Chunker ─► seal ─► encode ─► CUBIC + window ─► Connection ─► transport
//! recv_package ◄─ Reassembler ◄─ open ◄─ decode ◄──────────────────────────── transport
//! ```
//!
//! The session is poll driven: call [`Session::poll`] (or
//! [`Session::poll_at`] with your own clock) whenever the transport may
//! have data or a timer may have fired.

#[allow(clippy::module_inception)]
mod session;
mod stats;

pub use session::*;
pub use stats::*;
