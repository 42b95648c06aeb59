//! Session counters.

/// Traffic counters for one session.
///
/// Byte counts are wire bytes (headers, tags and control packets
/// included).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes handed to the transport.
    pub bytes_sent: u64,
    /// Bytes taken from the transport.
    pub bytes_received: u64,
    /// Datagrams handed to the transport.
    pub packets_sent: u64,
    /// Datagrams taken from the transport.
    pub packets_received: u64,
    /// Data packets sent again after a timeout.
    pub retransmissions: u64,
    /// Inbound datagrams discarded (corrupted, undecryptable, unknown type).
    pub packets_dropped: u64,
    /// Packages fully acknowledged by the peer.
    pub packages_sent: u64,
    /// Packages reassembled and delivered.
    pub packages_received: u64,
}

impl SessionStats {
    /// Fraction of sent packets that were retransmissions.
    pub fn retransmission_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.packets_sent as f64
    }

    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }
}
