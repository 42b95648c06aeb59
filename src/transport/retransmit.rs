//! Retransmission bookkeeping.
//!
//! Pure bookkeeping with no timers: the caller decides when to poll.

use std::collections::{BTreeSet, HashMap};

/// Tracks which sequence numbers are sent but not yet confirmed.
#[derive(Debug, Clone, Default)]
pub struct RetransmissionManager {
    sent: BTreeSet<u32>,
    received: BTreeSet<u32>,
    attempts: HashMap<u32, u32>,
}

impl RetransmissionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a (re)transmission of `seq`.
    ///
    /// The first send sets the attempt counter to 0; every later send
    /// increments it.
    pub fn packet_sent(&mut self, seq: u32) {
        self.sent.insert(seq);
        self.attempts
            .entry(seq)
            .and_modify(|n| *n = n.saturating_add(1))
            .or_insert(0);
    }

    /// Record that `seq` was confirmed by the peer.
    pub fn packet_received(&mut self, seq: u32) {
        self.received.insert(seq);
        self.sent.remove(&seq);
    }

    /// Check whether `seq` is outstanding.
    pub fn needs_retransmission(&self, seq: u32) -> bool {
        self.sent.contains(&seq) && !self.received.contains(&seq)
    }

    /// Outstanding sequence numbers, ascending.
    pub fn outstanding(&self) -> impl Iterator<Item = u32> + '_ {
        self.sent
            .iter()
            .copied()
            .filter(|seq| !self.received.contains(seq))
    }

    /// Number of retransmissions of `seq` so far (0 after the first send).
    pub fn attempts(&self, seq: u32) -> Option<u32> {
        self.attempts.get(&seq).copied()
    }

    /// Check whether `seq` has been confirmed.
    pub fn is_received(&self, seq: u32) -> bool {
        self.received.contains(&seq)
    }

    /// Forget everything (new package or connection reset).
    pub fn clear(&mut self) {
        self.sent.clear();
        self.received.clear();
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sent_needs_retransmission() {
        let mut manager = RetransmissionManager::new();
        assert!(!manager.needs_retransmission(1));

        manager.packet_sent(1);
        assert!(manager.needs_retransmission(1));
        assert_eq!(manager.attempts(1), Some(0));
    }

    #[test]
    fn test_received_clears_outstanding() {
        let mut manager = RetransmissionManager::new();
        manager.packet_sent(1);
        manager.packet_sent(2);
        manager.packet_received(1);

        assert!(!manager.needs_retransmission(1));
        assert!(manager.needs_retransmission(2));
        assert!(manager.is_received(1));
        assert_eq!(manager.outstanding().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_attempt_counter_persists() {
        let mut manager = RetransmissionManager::new();
        manager.packet_sent(5);
        manager.packet_sent(5);
        manager.packet_sent(5);
        assert_eq!(manager.attempts(5), Some(2));

        manager.packet_received(5);
        assert_eq!(manager.attempts(5), Some(2));
        assert_eq!(manager.attempts(6), None);
    }

    #[test]
    fn test_received_before_sent() {
        let mut manager = RetransmissionManager::new();
        manager.packet_received(3);
        manager.packet_sent(3);
        assert!(!manager.needs_retransmission(3));
        assert_eq!(manager.outstanding().count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut manager = RetransmissionManager::new();
        manager.packet_sent(1);
        manager.packet_received(2);
        manager.clear();
        assert!(!manager.needs_retransmission(1));
        assert!(!manager.is_received(2));
        assert_eq!(manager.attempts(1), None);
    }
}
