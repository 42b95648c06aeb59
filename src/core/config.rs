//! Protocol configuration.
//!
//! All tunables are explicit constructor parameters; nothing is read from
//! the environment or from files.

use std::time::Duration;

use super::constants::{
    AEAD_TAG_SIZE, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_PACKET_SIZE, DEFAULT_RECEIVE_WINDOW,
    DEFAULT_TIME_WAIT, INITIAL_WINDOW, MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_RETRANSMITS,
};
use super::error::LsptError;

/// Connection and session tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Idle time after which a keep-alive is due.
    pub keep_alive_interval: Duration,
    /// Receive window advertised to the peer, in bytes.
    pub receive_window: u32,
    /// Largest datagram handed to the transport.
    pub max_packet_size: usize,
    /// Bytes of package data carried per packet.
    pub chunk_size: usize,
    /// Initial congestion window, in packets.
    pub initial_window: u32,
    /// How long TIME_WAIT lingers before CLOSED.
    pub time_wait: Duration,
    /// Retransmission attempts before a sequence is abandoned.
    pub max_retransmits: u32,
    /// Refuse to send or accept data before the secure handshake completes.
    pub require_encryption: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            receive_window: DEFAULT_RECEIVE_WINDOW,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            chunk_size: chunk_size_for(DEFAULT_MAX_PACKET_SIZE),
            initial_window: INITIAL_WINDOW,
            time_wait: DEFAULT_TIME_WAIT,
            max_retransmits: MAX_RETRANSMITS,
            require_encryption: true,
        }
    }
}

/// Largest chunk that always fits a packet of `max_packet_size` bytes,
/// including the worst-case header and an AEAD tag.
pub fn chunk_size_for(max_packet_size: usize) -> usize {
    max_packet_size
        .saturating_sub(MAX_HEADER_SIZE + AEAD_TAG_SIZE)
        .min(MAX_PAYLOAD_SIZE - AEAD_TAG_SIZE)
}

impl ProtocolConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ProtocolConfigBuilder {
        ProtocolConfigBuilder::new()
    }

    /// Check the configuration for values the protocol cannot honor.
    pub fn validate(&self) -> Result<(), LsptError> {
        if self.chunk_size == 0 {
            return Err(LsptError::Config("chunk size must be at least 1 byte".into()));
        }
        if self.chunk_size + AEAD_TAG_SIZE > MAX_PAYLOAD_SIZE {
            return Err(LsptError::Config(format!(
                "chunk size {} exceeds the 16-bit payload field",
                self.chunk_size
            )));
        }
        if self.chunk_size + AEAD_TAG_SIZE + MAX_HEADER_SIZE > self.max_packet_size {
            return Err(LsptError::Config(format!(
                "chunk size {} does not fit a {}-byte packet",
                self.chunk_size, self.max_packet_size
            )));
        }
        if self.receive_window == 0 {
            return Err(LsptError::Config("receive window must be non-zero".into()));
        }
        if self.initial_window == 0 {
            return Err(LsptError::Config("initial congestion window must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`ProtocolConfig`].
#[derive(Debug, Clone)]
pub struct ProtocolConfigBuilder {
    config: ProtocolConfig,
    chunk_size_overridden: bool,
}

impl Default for ProtocolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolConfigBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            config: ProtocolConfig::default(),
            chunk_size_overridden: false,
        }
    }

    /// Set the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    /// Set the receive window size.
    pub fn receive_window(mut self, bytes: u32) -> Self {
        self.config.receive_window = bytes;
        self
    }

    /// Set the maximum packet size.
    ///
    /// Unless [`chunk_size`](Self::chunk_size) is also set, the chunk size
    /// follows the packet size.
    pub fn max_packet_size(mut self, bytes: usize) -> Self {
        self.config.max_packet_size = bytes;
        if !self.chunk_size_overridden {
            self.config.chunk_size = chunk_size_for(bytes);
        }
        self
    }

    /// Set the chunk size explicitly.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes;
        self.chunk_size_overridden = true;
        self
    }

    /// Set the initial congestion window (packets).
    pub fn initial_window(mut self, packets: u32) -> Self {
        self.config.initial_window = packets;
        self
    }

    /// Set the TIME_WAIT duration.
    pub fn time_wait(mut self, linger: Duration) -> Self {
        self.config.time_wait = linger;
        self
    }

    /// Set the retransmission limit.
    pub fn max_retransmits(mut self, attempts: u32) -> Self {
        self.config.max_retransmits = attempts;
        self
    }

    /// Require (or waive) the secure handshake before data flows.
    pub fn require_encryption(mut self, required: bool) -> Self {
        self.config.require_encryption = required;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ProtocolConfig, LsptError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 1200 - MAX_HEADER_SIZE - AEAD_TAG_SIZE);
    }

    #[test]
    fn test_builder_tracks_packet_size() {
        let config = ProtocolConfig::builder().max_packet_size(1400).build().unwrap();
        assert_eq!(config.chunk_size, chunk_size_for(1400));

        let config = ProtocolConfig::builder()
            .chunk_size(256)
            .max_packet_size(1400)
            .build()
            .unwrap();
        assert_eq!(config.chunk_size, 256);
    }

    #[test]
    fn test_rejects_zero_chunk() {
        let result = ProtocolConfig::builder().chunk_size(0).build();
        assert!(matches!(result, Err(LsptError::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_chunk() {
        let result = ProtocolConfig::builder()
            .max_packet_size(200_000)
            .chunk_size(70_000)
            .build();
        assert!(matches!(result, Err(LsptError::Config(_))));

        let result = ProtocolConfig::builder().chunk_size(1200).build();
        assert!(matches!(result, Err(LsptError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = ProtocolConfig::builder().receive_window(0).build();
        assert!(result.is_err());
        let result = ProtocolConfig::builder().initial_window(0).build();
        assert!(result.is_err());
    }
}
