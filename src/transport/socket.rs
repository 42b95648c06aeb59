//! Datagram carriers for LSPT.
//!
//! [`DatagramSocket`] puts packets on a connected tokio UDP socket;
//! [`MemoryTransport`] links two endpoints in-process. Both implement the
//! non-blocking [`Transport`] capability the session is written against.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::Transport;

/// Default receive buffer size (largest UDP payload).
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Connected UDP socket carrying LSPT datagrams.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
    recv_buffer: Vec<u8>,
}

impl DatagramSocket {
    /// Bind a socket to `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        DatagramSocketBuilder::new().bind(addr).await
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        DatagramSocketBuilder::new().from_socket(socket)
    }

    /// Local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Peer address, once connected.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Fix the peer. Required before the socket is used as a [`Transport`].
    ///
    /// Returns once the socket is writable, so the first synchronous
    /// [`Transport::send`] does not hit a cold readiness state.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.socket.connect(addr).await?;
        self.writable().await
    }

    /// Wait until a datagram can be written.
    ///
    /// Call this once on a socket wrapped with [`from_socket`](Self::from_socket)
    /// that is already connected.
    pub async fn writable(&self) -> io::Result<()> {
        self.socket.writable().await
    }

    /// Wait until a datagram can be read.
    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }
}

impl Transport for DatagramSocket {
    /// A full send buffer drops the datagram like the network would; the
    /// session's retransmission recovers it. Only hard errors refuse.
    fn send(&mut self, datagram: &[u8]) -> bool {
        match self.socket.try_send(datagram) {
            Ok(sent) => sent == datagram.len(),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(len = datagram.len(), "udp send buffer full, datagram dropped");
                true
            }
            Err(e) => {
                warn!(error = %e, "udp send failed");
                false
            }
        }
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        match self.socket.try_recv(&mut self.recv_buffer) {
            Ok(len) => Some(self.recv_buffer[..len].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                None
            }
        }
    }
}

/// Builder for [`DatagramSocket`].
#[derive(Debug, Clone)]
pub struct DatagramSocketBuilder {
    recv_buffer_size: usize,
}

impl Default for DatagramSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramSocketBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the receive buffer size. Longer datagrams are truncated.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Bind to `addr`.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<DatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(self, socket: UdpSocket) -> DatagramSocket {
        DatagramSocket {
            socket,
            recv_buffer: vec![0u8; self.recv_buffer_size],
        }
    }
}

/// One end of an in-process datagram link.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTransport {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }

    /// Wait for the next datagram. `None` once the peer is dropped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, datagram: &[u8]) -> bool {
        self.tx.send(datagram.to_vec()).is_ok()
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}
