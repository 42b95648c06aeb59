//! Connection state machine.
//!
//! Ten-state lifecycle with flow control, unacknowledged-packet tracking
//! and keep-alive liveness layered on top. Transitions for unexpected
//! events are no-ops that return `false`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::congestion::CubicController;
use super::retransmit::RetransmissionManager;
use crate::core::ProtocolConfig;
use crate::core::constants::KEEPALIVE_TOLERANCE;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Idle; also the terminal state.
    Closed,
    /// SYN sent, waiting for SYN-ACK.
    SynSent,
    /// SYN received, SYN-ACK sent, waiting for ACK.
    SynReceived,
    /// Data may flow.
    Established,
    /// Local close started, waiting for the FIN's ACK.
    FinWait1,
    /// Our FIN acknowledged, waiting for the peer's FIN.
    FinWait2,
    /// Peer closed, waiting for the local close.
    CloseWait,
    /// Simultaneous close, waiting for the ACK of our FIN.
    Closing,
    /// Local close after the peer's, waiting for the final ACK.
    LastAck,
    /// Lingering before CLOSED.
    TimeWait,
}

impl ConnectionState {
    /// Canonical state name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One LSPT connection.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    unacknowledged: BTreeMap<u32, Vec<u8>>,
    last_activity: Instant,
    keep_alive_interval: Duration,
    receive_window: u32,
    available_window: u32,
    time_wait: Duration,
    time_wait_since: Option<Instant>,
    retransmission: RetransmissionManager,
    congestion: CubicController,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(&ProtocolConfig::default())
    }
}

impl Connection {
    /// Create a connection in CLOSED.
    pub fn new(config: &ProtocolConfig) -> Self {
        Self::with_start(config, Instant::now())
    }

    /// Create a connection whose clocks start at `now`.
    pub fn with_start(config: &ProtocolConfig, now: Instant) -> Self {
        let mss = u32::try_from(config.max_packet_size).unwrap_or(u32::MAX);
        Self {
            state: ConnectionState::Closed,
            unacknowledged: BTreeMap::new(),
            last_activity: now,
            keep_alive_interval: config.keep_alive_interval,
            receive_window: config.receive_window,
            available_window: config.receive_window,
            time_wait: config.time_wait,
            time_wait_since: None,
            retransmission: RetransmissionManager::new(),
            congestion: CubicController::with_start(config.initial_window, mss, now),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if data may flow.
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    fn transition(&mut self, to: ConnectionState, event: &'static str) {
        debug!(from = %self.state, to = %to, event, "connection transition");
        if to == ConnectionState::TimeWait {
            self.time_wait_since = Some(Instant::now());
        }
        self.state = to;
    }

    fn rejected(&self, event: &'static str) -> bool {
        trace!(state = %self.state, event, "transition rejected");
        false
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Active open: CLOSED to SYN_SENT.
    pub fn initiate(&mut self) -> bool {
        match self.state {
            ConnectionState::Closed => {
                self.transition(ConnectionState::SynSent, "initiate");
                true
            }
            _ => self.rejected("initiate"),
        }
    }

    /// Incoming SYN: CLOSED to SYN_RECEIVED.
    pub fn handle_syn(&mut self) -> bool {
        match self.state {
            ConnectionState::Closed => {
                self.transition(ConnectionState::SynReceived, "syn");
                true
            }
            _ => self.rejected("syn"),
        }
    }

    /// Incoming SYN-ACK: SYN_SENT to ESTABLISHED.
    pub fn handle_syn_ack(&mut self) -> bool {
        match self.state {
            ConnectionState::SynSent => {
                self.transition(ConnectionState::Established, "syn-ack");
                true
            }
            _ => self.rejected("syn-ack"),
        }
    }

    /// Incoming ACK.
    pub fn handle_ack(&mut self) -> bool {
        let next = match self.state {
            ConnectionState::SynReceived => ConnectionState::Established,
            ConnectionState::FinWait1 => ConnectionState::FinWait2,
            ConnectionState::Closing => ConnectionState::TimeWait,
            ConnectionState::LastAck => ConnectionState::Closed,
            _ => return self.rejected("ack"),
        };
        self.transition(next, "ack");
        true
    }

    /// Local close: ESTABLISHED to FIN_WAIT_1.
    pub fn initiate_close(&mut self) -> bool {
        match self.state {
            ConnectionState::Established => {
                self.transition(ConnectionState::FinWait1, "initiate close");
                true
            }
            _ => self.rejected("initiate close"),
        }
    }

    /// Incoming FIN.
    pub fn handle_fin(&mut self) -> bool {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::CloseWait,
            ConnectionState::FinWait1 => ConnectionState::Closing,
            ConnectionState::FinWait2 => ConnectionState::TimeWait,
            _ => return self.rejected("fin"),
        };
        self.transition(next, "fin");
        true
    }

    /// Local close after the peer's FIN: CLOSE_WAIT to LAST_ACK.
    pub fn close(&mut self) -> bool {
        match self.state {
            ConnectionState::CloseWait => {
                self.transition(ConnectionState::LastAck, "close");
                true
            }
            _ => self.rejected("close"),
        }
    }

    /// Abort from any state to CLOSED, discarding all pending state.
    pub fn reset(&mut self) -> bool {
        self.reset_at(Instant::now())
    }

    /// Abort at `now`.
    pub fn reset_at(&mut self, now: Instant) -> bool {
        self.transition(ConnectionState::Closed, "reset");
        self.unacknowledged.clear();
        self.retransmission.clear();
        self.congestion.reset(now);
        self.available_window = self.receive_window;
        self.time_wait_since = None;
        self.last_activity = now;
        true
    }

    /// Generic timeout.
    ///
    /// Every handshake and teardown state falls back to CLOSED (discarding
    /// pending state); CLOSE_WAIT is forced closed. ESTABLISHED and CLOSED
    /// are unaffected.
    pub fn on_timeout(&mut self) -> bool {
        match self.state {
            ConnectionState::SynSent
            | ConnectionState::SynReceived
            | ConnectionState::FinWait1
            | ConnectionState::FinWait2
            | ConnectionState::Closing
            | ConnectionState::LastAck
            | ConnectionState::TimeWait => self.reset(),
            ConnectionState::CloseWait => {
                self.transition(ConnectionState::Closed, "timeout");
                true
            }
            ConnectionState::Established | ConnectionState::Closed => self.rejected("timeout"),
        }
    }

    /// TIME_WAIT expiry: TIME_WAIT to CLOSED.
    pub fn on_time_wait_expired(&mut self) -> bool {
        match self.state {
            ConnectionState::TimeWait => {
                self.time_wait_since = None;
                self.transition(ConnectionState::Closed, "time-wait expired");
                true
            }
            _ => self.rejected("time-wait expired"),
        }
    }

    /// Expire TIME_WAIT if it has lingered for the configured duration.
    pub fn poll_time_wait(&mut self, now: Instant) -> bool {
        match self.time_wait_since {
            Some(since)
                if self.state == ConnectionState::TimeWait
                    && now.saturating_duration_since(since) >= self.time_wait =>
            {
                self.on_time_wait_expired()
            }
            _ => false,
        }
    }

    /// Override the TIME_WAIT start (for a caller driving a synthetic clock).
    pub fn set_time_wait_start(&mut self, since: Instant) {
        if self.state == ConnectionState::TimeWait {
            self.time_wait_since = Some(since);
        }
    }

    // ---------------------------------------------------------------------
    // Unacknowledged packets
    // ---------------------------------------------------------------------

    /// Record `data` as sent and unacknowledged under `seq`.
    pub fn send_packet(&mut self, seq: u32, data: Vec<u8>) -> bool {
        self.send_packet_at(seq, data, Instant::now())
    }

    /// Record a send at `now`.
    pub fn send_packet_at(&mut self, seq: u32, data: Vec<u8>, now: Instant) -> bool {
        self.unacknowledged.insert(seq, data);
        self.retransmission.packet_sent(seq);
        self.last_activity = now;
        true
    }

    /// Drop `seq` from the unacknowledged set. Returns whether it was there.
    pub fn acknowledge_packet(&mut self, seq: u32) -> bool {
        self.acknowledge_packet_at(seq, Instant::now())
    }

    /// Acknowledge at `now`.
    pub fn acknowledge_packet_at(&mut self, seq: u32, now: Instant) -> bool {
        self.retransmission.packet_received(seq);
        if self.unacknowledged.remove(&seq).is_some() {
            self.last_activity = now;
            true
        } else {
            false
        }
    }

    /// Every outstanding packet flagged for retransmission, re-marked as sent.
    ///
    /// The caller puts the returned bytes back on the wire.
    pub fn retransmit_unacknowledged(&mut self) -> Vec<(u32, Vec<u8>)> {
        self.retransmit_unacknowledged_at(Instant::now())
    }

    /// Retransmit at `now`.
    pub fn retransmit_unacknowledged_at(&mut self, now: Instant) -> Vec<(u32, Vec<u8>)> {
        let flagged: Vec<(u32, Vec<u8>)> = self
            .unacknowledged
            .iter()
            .filter(|(seq, _)| self.retransmission.needs_retransmission(**seq))
            .map(|(seq, data)| (*seq, data.clone()))
            .collect();
        for (seq, _) in &flagged {
            self.retransmission.packet_sent(*seq);
        }
        self.last_activity = now;
        flagged
    }

    /// Number of packets awaiting acknowledgement.
    pub fn unacknowledged_count(&self) -> usize {
        self.unacknowledged.len()
    }

    /// Bytes of `seq` if it is still unacknowledged.
    pub fn unacknowledged(&self, seq: u32) -> Option<&[u8]> {
        self.unacknowledged.get(&seq).map(Vec::as_slice)
    }

    /// Retransmissions of `seq` so far.
    pub fn retransmission_attempts(&self, seq: u32) -> Option<u32> {
        self.retransmission.attempts(seq)
    }

    /// Forget all per-package sequence bookkeeping.
    pub fn clear_sequences(&mut self) {
        self.unacknowledged.clear();
        self.retransmission.clear();
    }

    /// Retransmission bookkeeping.
    pub fn retransmission(&self) -> &RetransmissionManager {
        &self.retransmission
    }

    /// Congestion controller.
    pub fn congestion(&self) -> &CubicController {
        &self.congestion
    }

    /// Congestion controller, mutably.
    pub fn congestion_mut(&mut self) -> &mut CubicController {
        &mut self.congestion
    }

    // ---------------------------------------------------------------------
    // Flow control
    // ---------------------------------------------------------------------

    /// Configure the receive window; the available window starts full.
    pub fn set_receive_window_size(&mut self, size: u32) {
        self.receive_window = size;
        self.available_window = size;
    }

    /// Configured receive window.
    pub fn receive_window_size(&self) -> u32 {
        self.receive_window
    }

    /// Apply a window update from the peer, capped at the configured size.
    pub fn update_available_window(&mut self, size: u32) {
        self.available_window = size.min(self.receive_window);
    }

    /// Window still available for sending.
    pub fn available_window(&self) -> u32 {
        self.available_window
    }

    /// Check if `size` bytes fit the available window.
    pub fn can_send_data(&self, size: usize) -> bool {
        size <= self.available_window as usize
    }

    /// Deduct `size` bytes from the window. Fails without side effects if
    /// they do not fit.
    pub fn send_data(&mut self, size: usize) -> bool {
        self.send_data_at(size, Instant::now())
    }

    /// Deduct at `now`.
    pub fn send_data_at(&mut self, size: usize, now: Instant) -> bool {
        if !self.can_send_data(size) {
            trace!(size, available = self.available_window, "window exhausted");
            return false;
        }
        self.available_window -= size as u32;
        self.last_activity = now;
        true
    }

    /// Account for `size` received bytes.
    ///
    /// Outside ESTABLISHED this is a no-op returning `None`. Otherwise the
    /// window to advertise to the peer is returned. Our send credit
    /// ([`available_window`](Self::available_window)) is not touched.
    pub fn receive_data(&mut self, size: usize) -> Option<u32> {
        self.receive_data_at(size, Instant::now())
    }

    /// Receive at `now`.
    pub fn receive_data_at(&mut self, size: usize, now: Instant) -> Option<u32> {
        if self.state != ConnectionState::Established {
            return None;
        }
        trace!(size, "data received");
        self.last_activity = now;
        Some(self.advertised_window())
    }

    /// Window we advertise to the peer.
    ///
    /// Chunks go to the reassembler as they arrive, so the whole configured
    /// receive window is always offered.
    pub fn advertised_window(&self) -> u32 {
        self.receive_window
    }

    // ---------------------------------------------------------------------
    // Keep-alive
    // ---------------------------------------------------------------------

    /// Configure the keep-alive interval. Refreshes activity.
    pub fn set_keep_alive_interval(&mut self, interval: Duration) {
        self.keep_alive_interval = interval;
        self.last_activity = Instant::now();
    }

    /// Keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    /// Record a keep-alive sent now.
    pub fn send_keep_alive(&mut self) {
        self.touch(Instant::now());
    }

    /// Record a keep-alive received now.
    pub fn handle_keep_alive(&mut self) -> bool {
        self.touch(Instant::now());
        true
    }

    /// Refresh the activity timestamp.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Last time anything was sent or received.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Check liveness now.
    pub fn is_connection_alive(&self) -> bool {
        self.is_connection_alive_at(Instant::now())
    }

    /// Check liveness at `now`: alive while the idle time stays within the
    /// keep-alive interval plus [`KEEPALIVE_TOLERANCE`].
    pub fn is_connection_alive_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity)
            <= self.keep_alive_interval + KEEPALIVE_TOLERANCE
    }

    /// Check if a keep-alive is due at `now`.
    pub fn keep_alive_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.keep_alive_interval
    }
}
