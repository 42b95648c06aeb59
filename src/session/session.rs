//! The session pipeline.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::SessionStats;
use crate::core::{
    HandshakeError, LsptError, LsptResult, ProtocolConfig, ProtocolViolation, SessionError,
    Transport,
};
use crate::crypto::{HandshakeSession, HandshakeState, PacketCipher, Role};
use crate::package::{Chunk, Chunker, InboundPackage, Package, PackageId};
use crate::transport::{
    Connection, ConnectionState, Packet, PacketType, RttEstimator, decode, encode, header_prefix,
};

/// Package id carried by connection-level packets (SYN, FIN, handshake...).
const CONTROL_ID: u128 = 0;

/// Delivered package ids remembered for re-acknowledging late duplicates.
const RECENT_PACKAGES: usize = 32;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: Instant,
    wire_len: u32,
    payload_len: usize,
    retransmitted: bool,
}

#[derive(Debug)]
struct Outbound {
    id: PackageId,
    total: u32,
    unsent: VecDeque<Chunk>,
}

/// A SYN, SYN-ACK or FIN waiting for its answer.
#[derive(Debug, Clone, Copy)]
struct PendingControl {
    kind: PacketType,
    sent_at: Instant,
    attempts: u32,
}

#[derive(Debug, Clone, Copy)]
struct HandshakeTimer {
    sent_at: Instant,
    attempts: u32,
}

/// One end of an LSPT association over a datagram [`Transport`].
///
/// Packages queued with [`send_package`](Self::send_package) are sent one
/// at a time: chunked, sealed once the secure handshake has completed,
/// paced by CUBIC and the peer's receive window, and retransmitted on
/// timeout until every chunk is acknowledged.
///
/// # Example
///
/// ```
/// use lspt_protocol::core::ProtocolConfig;
/// use lspt_protocol::crypto::Role;
/// use lspt_protocol::package::Package;
/// use lspt_protocol::session::Session;
/// use lspt_protocol::transport::MemoryTransport;
///
/// let (ground_link, drone_link) = MemoryTransport::pair();
/// let mut ground = Session::new(ground_link, ProtocolConfig::default(), Role::Ground).unwrap();
/// let mut drone = Session::new(drone_link, ProtocolConfig::default(), Role::Airborne).unwrap();
///
/// ground.connect().unwrap();
/// let id = ground.send_package(Package::new(b"telemetry frame".to_vec())).unwrap();
///
/// let mut received = None;
/// for _ in 0..16 {
///     ground.poll().unwrap();
///     drone.poll().unwrap();
///     if let Some(package) = drone.recv_package() {
///         received = Some(package);
///         break;
///     }
/// }
///
/// let package = received.unwrap();
/// assert_eq!(package.id(), id);
/// assert_eq!(package.data(), b"telemetry frame");
/// assert!(drone.is_secure());
/// ```
pub struct Session<T: Transport> {
    transport: T,
    config: ProtocolConfig,
    connection: Connection,
    rtt: RttEstimator,
    chunker: Chunker,

    handshake: HandshakeSession,
    handshake_timer: Option<HandshakeTimer>,
    /// Last handshake message that produced a reply, and that reply.
    handshake_replay: Option<(Vec<u8>, Vec<u8>)>,
    cipher: Option<PacketCipher>,

    active_open: bool,
    close_requested: bool,
    pending_control: Option<PendingControl>,

    outbound: VecDeque<Package>,
    current: Option<Outbound>,
    in_flight: BTreeMap<u32, InFlight>,

    inbound: HashMap<PackageId, InboundPackage>,
    recent: VecDeque<PackageId>,
    delivered: VecDeque<Package>,

    stats: SessionStats,
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.connection.state())
            .field("handshake", &self.handshake)
            .field("secure", &self.cipher.is_some())
            .field("queued", &self.pending_packages())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    /// Create a closed session over `transport`.
    pub fn new(transport: T, config: ProtocolConfig, role: Role) -> LsptResult<Self> {
        config.validate()?;
        let connection = Connection::new(&config);
        let chunker = Chunker::new(config.chunk_size);

        Ok(Self {
            transport,
            config,
            connection,
            rtt: RttEstimator::new(),
            chunker,
            handshake: HandshakeSession::new(role),
            handshake_timer: None,
            handshake_replay: None,
            cipher: None,
            active_open: false,
            close_requested: false,
            pending_control: None,
            outbound: VecDeque::new(),
            current: None,
            in_flight: BTreeMap::new(),
            inbound: HashMap::new(),
            recent: VecDeque::new(),
            delivered: VecDeque::new(),
            stats: SessionStats::default(),
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Check if the connection is ESTABLISHED.
    pub fn is_established(&self) -> bool {
        self.connection.is_established()
    }

    /// Check if data packets are encrypted.
    pub fn is_secure(&self) -> bool {
        self.cipher.is_some()
    }

    /// Secret agreed by the secure handshake, for binding application
    /// credentials to this association.
    ///
    /// Fails with [`SessionError::HandshakeIncomplete`] until data packets
    /// are sealed.
    pub fn shared_secret(&self) -> LsptResult<&[u8]> {
        if !self.is_secure() {
            return Err(SessionError::HandshakeIncomplete.into());
        }
        Ok(self.handshake.shared_secret()?)
    }

    /// Our handshake role.
    pub fn role(&self) -> Role {
        self.handshake.role()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The secure handshake.
    pub fn handshake(&self) -> &HandshakeSession {
        &self.handshake
    }

    /// RTT estimate.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Configuration in use.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Traffic counters.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Packages queued or in transmission.
    pub fn pending_packages(&self) -> usize {
        self.outbound.len() + usize::from(self.current.is_some())
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ---------------------------------------------------------------------
    // Application surface
    // ---------------------------------------------------------------------

    /// Open the connection by sending a SYN.
    ///
    /// With encryption required, the secure handshake starts by itself
    /// once the connection is ESTABLISHED.
    pub fn connect(&mut self) -> LsptResult<()> {
        if !self.connection.initiate() {
            return Err(self.invalid_state("connect"));
        }
        self.active_open = true;
        self.send_packet(PacketType::Syn, CONTROL_ID, 0, 0, &[])?;
        self.pending_control = Some(PendingControl {
            kind: PacketType::Syn,
            sent_at: Instant::now(),
            attempts: 0,
        });
        Ok(())
    }

    /// Start the secure handshake explicitly.
    ///
    /// Only needed on a connection that does not require encryption, or
    /// on the passive side.
    pub fn start_handshake(&mut self) -> LsptResult<()> {
        if !self.connection.is_established() {
            return Err(SessionError::NotEstablished.into());
        }
        if self.handshake.state() != HandshakeState::Initial {
            return Err(SessionError::HandshakeInProgress.into());
        }
        self.send_hello(Instant::now(), 0)
    }

    /// Queue a package for delivery.
    pub fn send_package(&mut self, package: Package) -> LsptResult<PackageId> {
        let open = matches!(
            self.connection.state(),
            ConnectionState::SynSent | ConnectionState::SynReceived | ConnectionState::Established
        );
        if !open || self.close_requested {
            return Err(self.invalid_state("send package"));
        }
        if u32::try_from(self.chunker.chunk_count(package.size())).is_err() {
            return Err(SessionError::PackageTooLarge(package.size()).into());
        }

        let id = package.id();
        trace!(package = %id, size = package.size(), "package queued");
        self.outbound.push_back(package);
        Ok(id)
    }

    /// Take the next reassembled package.
    pub fn recv_package(&mut self) -> Option<Package> {
        self.delivered.pop_front()
    }

    /// Close gracefully.
    ///
    /// The FIN goes out once every queued package has been acknowledged.
    pub fn close(&mut self) -> LsptResult<()> {
        match self.connection.state() {
            ConnectionState::Established | ConnectionState::CloseWait => {
                self.close_requested = true;
                Ok(())
            }
            _ => Err(self.invalid_state("close")),
        }
    }

    /// Abort: send a RST and drop all state.
    pub fn abort(&mut self) -> LsptResult<()> {
        self.abort_at(Instant::now())
    }

    /// Run the session now.
    pub fn poll(&mut self) -> LsptResult<()> {
        self.poll_at(Instant::now())
    }

    /// Run the session at `now`.
    ///
    /// Drains the transport, fires due timers, sends whatever the
    /// congestion and receive windows allow and expires TIME_WAIT.
    pub fn poll_at(&mut self, now: Instant) -> LsptResult<()> {
        while let Some(datagram) = self.transport.receive() {
            self.handle_datagram(&datagram, now)?;
        }

        self.check_control_timer(now)?;
        self.check_handshake_timer(now)?;
        self.check_retransmissions(now)?;

        if self.active_open
            && self.config.require_encryption
            && self.connection.is_established()
            && self.handshake.state() == HandshakeState::Initial
        {
            self.send_hello(now, 0)?;
        }

        self.send_pending(now)?;
        self.send_fin_if_idle(now)?;

        if self.connection.is_established() && self.connection.keep_alive_due(now) {
            trace!("sending keep-alive");
            self.send_packet(PacketType::KeepAlive, CONTROL_ID, 0, 0, &[])?;
            self.connection.touch(now);
        }

        if self.connection.poll_time_wait(now) {
            debug!("connection closed after TIME_WAIT");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    fn handle_datagram(&mut self, datagram: &[u8], now: Instant) -> LsptResult<()> {
        self.stats.record_received(datagram.len());

        let packet = match decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, len = datagram.len(), "dropping undecodable packet");
                self.stats.packets_dropped += 1;
                return Ok(());
            }
        };
        let Some(kind) = packet.kind() else {
            warn!(packet_type = packet.packet_type, "dropping packet of unknown type");
            self.stats.packets_dropped += 1;
            return Ok(());
        };

        if self.connection.state() != ConnectionState::Closed {
            self.connection.touch(now);
        }

        match kind {
            PacketType::Syn => self.on_syn(now),
            PacketType::SynAck => self.on_syn_ack(),
            PacketType::Ack => {
                self.on_ack(&packet, now);
                Ok(())
            }
            PacketType::Fin => self.on_fin(now),
            PacketType::Reset => {
                debug!(state = %self.connection.state(), "connection reset by peer");
                self.reset_local(now);
                Ok(())
            }
            PacketType::KeepAlive => {
                trace!("keep-alive received");
                Ok(())
            }
            PacketType::WindowUpdate => {
                if let Some(window) = read_window(&packet.payload) {
                    trace!(window, "window update");
                    self.apply_window(window);
                }
                Ok(())
            }
            PacketType::Handshake => self.on_handshake(&packet, now),
            PacketType::Data => self.on_data(packet, now),
        }
    }

    fn on_syn(&mut self, now: Instant) -> LsptResult<()> {
        match self.connection.state() {
            ConnectionState::Closed => {
                self.reset_local(now);
                self.connection.handle_syn();
                self.pending_control = Some(PendingControl {
                    kind: PacketType::SynAck,
                    sent_at: now,
                    attempts: 0,
                });
            }
            ConnectionState::SynReceived => trace!("duplicate SYN"),
            state => {
                trace!(%state, "ignoring SYN");
                return Ok(());
            }
        }
        self.send_packet(PacketType::SynAck, CONTROL_ID, 0, 0, &[])
    }

    fn on_syn_ack(&mut self) -> LsptResult<()> {
        match self.connection.state() {
            ConnectionState::SynSent => {
                self.connection.handle_syn_ack();
            }
            // Our ACK was lost.
            ConnectionState::Established => trace!("duplicate SYN-ACK"),
            state => {
                trace!(%state, "ignoring SYN-ACK");
                return Ok(());
            }
        }
        self.send_packet(PacketType::Ack, CONTROL_ID, 0, 0, &[])
    }

    fn on_ack(&mut self, packet: &Packet, now: Instant) {
        if packet.package_id == CONTROL_ID {
            match self.connection.state() {
                ConnectionState::SynReceived
                | ConnectionState::FinWait1
                | ConnectionState::Closing
                | ConnectionState::LastAck => {
                    self.connection.handle_ack();
                    self.after_transition(now);
                }
                state => trace!(%state, "ignoring control ack"),
            }
            return;
        }

        self.accept_implicit_ack();
        let seq = packet.sequence_number;
        let current = self
            .current
            .as_ref()
            .is_some_and(|c| c.id.as_u128() == packet.package_id);
        if !current {
            trace!(seq, "stale ack");
            return;
        }

        if self.connection.acknowledge_packet_at(seq, now) {
            if let Some(flight) = self.in_flight.remove(&seq) {
                // Karn: retransmitted packets give ambiguous samples.
                if !flight.retransmitted {
                    self.rtt.sample(flight.sent_at, now);
                }
                let srtt = self.rtt.srtt();
                self.connection
                    .congestion_mut()
                    .on_ack_received_at(flight.wire_len, srtt, now);
            }
            trace!(seq, "chunk acknowledged");
        }

        if let Some(window) = read_window(&packet.payload) {
            self.apply_window(window);
        }
        self.finish_package_if_done();
    }

    fn on_fin(&mut self, now: Instant) -> LsptResult<()> {
        let state = self.connection.state();
        if self.connection.handle_fin() {
            if state == ConnectionState::Established {
                self.abandon_outbound();
            }
            self.after_transition(now);
        } else if !matches!(
            state,
            ConnectionState::CloseWait
                | ConnectionState::Closing
                | ConnectionState::LastAck
                | ConnectionState::TimeWait
        ) {
            trace!(%state, "ignoring FIN");
            return Ok(());
        }
        // Retransmitted FINs are acknowledged again.
        self.send_packet(PacketType::Ack, CONTROL_ID, 0, 0, &[])
    }

    fn on_handshake(&mut self, packet: &Packet, now: Instant) -> LsptResult<()> {
        self.accept_implicit_ack();
        if !self.connection.is_established() {
            trace!(state = %self.connection.state(), "handshake before establishment");
            return Ok(());
        }
        let message = packet.payload.as_slice();

        if let Some((seen, reply)) = &self.handshake_replay {
            if seen.as_slice() == message {
                trace!("duplicate handshake message, replaying reply");
                let reply = reply.clone();
                return self.send_packet(PacketType::Handshake, CONTROL_ID, 0, 0, &reply);
            }
        }

        let bare_ack = message.len() <= Role::Relay.identifier().len();
        let result = match self.handshake.handle_handshake_message(message) {
            Err(HandshakeError::Protocol(ProtocolViolation::AlreadyEstablished))
                if bare_ack && self.handshake.is_confirmed() =>
            {
                trace!("duplicate handshake ack");
                return Ok(());
            }
            Err(HandshakeError::Protocol(ProtocolViolation::AlreadyEstablished))
                if !self.handshake.is_initiator() && !self.handshake.is_confirmed() =>
            {
                // Our reply never arrived and the peer started over.
                debug!("peer restarted the handshake");
                self.handshake.reset();
                self.cipher = None;
                self.handshake.handle_handshake_message(message)
            }
            other => other,
        };

        match result {
            Ok(reply) => {
                if let Some(reply) = reply {
                    self.send_packet(PacketType::Handshake, CONTROL_ID, 0, 0, &reply)?;
                    self.handshake_replay = Some((message.to_vec(), reply));
                }
                if self.handshake.is_established() && self.cipher.is_none() {
                    let secret = self.handshake.shared_secret()?;
                    self.cipher = Some(PacketCipher::derive(secret, self.handshake.is_initiator())?);
                    self.handshake_timer = None;
                    debug!(role = %self.handshake.role(), "session secured");
                }
                Ok(())
            }
            Err(err) => {
                warn!(%err, "handshake failed, aborting connection");
                self.abort_at(now)?;
                Err(err.into())
            }
        }
    }

    fn on_data(&mut self, packet: Packet, now: Instant) -> LsptResult<()> {
        self.accept_implicit_ack();
        if !self.connection.is_established() {
            trace!(state = %self.connection.state(), "data outside ESTABLISHED");
            return Ok(());
        }
        if !self.data_ready() {
            debug!("data before the secure handshake, dropped");
            self.stats.packets_dropped += 1;
            return Ok(());
        }

        let id = PackageId::from_u128(packet.package_id);
        let seq = packet.sequence_number;
        let total = packet.total_packets;
        let data = match &self.cipher {
            Some(cipher) => {
                let aad = header_prefix(packet.packet_type, packet.package_id, seq, total)?;
                match cipher.open(packet.package_id, seq, &aad, &packet.payload) {
                    Ok(plain) => plain,
                    Err(err) => {
                        warn!(%err, package = %id, seq, "dropping unauthenticated chunk");
                        self.stats.packets_dropped += 1;
                        return Ok(());
                    }
                }
            }
            None => packet.payload,
        };

        let Some(window) = self.connection.receive_data_at(data.len(), now) else {
            return Ok(());
        };

        if self.recent.contains(&id) {
            trace!(package = %id, seq, "chunk of a delivered package");
            return self.send_ack(id, seq, total, window);
        }

        // An empty package travels as a single chunk with no total.
        if total == 0 {
            self.send_ack(id, seq, total, window)?;
            self.deliver(Package::with_id(id, Vec::new()));
            return self.send_window_update(window);
        }

        let outcome = self
            .inbound
            .entry(id)
            .or_insert_with(|| InboundPackage::new(id, total))
            .insert(seq, total, data);
        if !outcome.should_ack() {
            self.stats.packets_dropped += 1;
            return Ok(());
        }
        self.send_ack(id, seq, total, window)?;

        let complete = self.inbound.get(&id).is_some_and(InboundPackage::is_complete);
        if complete {
            if let Some(inbound) = self.inbound.remove(&id) {
                match inbound.into_package() {
                    Ok(package) => {
                        self.deliver(package);
                        self.send_window_update(window)?;
                    }
                    Err(inbound) => {
                        self.inbound.insert(id, inbound);
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, package: Package) {
        debug!(package = %package.id(), size = package.size(), "package received");
        if self.recent.len() == RECENT_PACKAGES {
            self.recent.pop_front();
        }
        self.recent.push_back(package.id());
        self.stats.packages_received += 1;
        self.delivered.push_back(package);
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    fn send_pending(&mut self, now: Instant) -> LsptResult<()> {
        if !self.connection.is_established() || !self.data_ready() {
            return Ok(());
        }

        loop {
            if self.current.is_none() {
                let Some(package) = self.outbound.pop_front() else {
                    break;
                };
                self.current = Some(self.start_package(&package)?);
            }

            let Some(chunk) = self.current.as_mut().and_then(|c| c.unsent.pop_front()) else {
                break;
            };
            if !self.send_chunk(&chunk, now)? {
                if let Some(current) = self.current.as_mut() {
                    current.unsent.push_front(chunk);
                }
                break;
            }
        }
        Ok(())
    }

    fn start_package(&self, package: &Package) -> LsptResult<Outbound> {
        let id = package.id();
        let mut chunks = self.chunker.split(package)?;
        let total = u32::try_from(chunks.len())
            .map_err(|_| SessionError::PackageTooLarge(package.size()))?;
        if chunks.is_empty() {
            chunks.push(Chunk::new(id, 0, Vec::new()));
        }

        debug!(package = %id, size = package.size(), chunks = total, "sending package");
        Ok(Outbound {
            id,
            total,
            unsent: chunks.into(),
        })
    }

    /// Send one chunk if the windows allow it.
    fn send_chunk(&mut self, chunk: &Chunk, now: Instant) -> LsptResult<bool> {
        let Some(current) = &self.current else {
            return Ok(false);
        };
        let (id, total) = (current.id.as_u128(), current.total);
        let seq = chunk.sequence_number;

        let payload = match &self.cipher {
            Some(cipher) => {
                let aad = header_prefix(PacketType::Data.into(), id, seq, total)?;
                cipher.seal(id, seq, &aad, &chunk.data)?
            }
            None => chunk.data.clone(),
        };
        let bytes = encode(PacketType::Data.into(), id, seq, total, &payload)?;
        let wire_len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);

        if !self.connection.can_send_data(payload.len()) {
            trace!(seq, available = self.connection.available_window(), "receive window full");
            return Ok(false);
        }
        if !self.connection.congestion_mut().on_packet_sent_at(wire_len, now) {
            return Ok(false);
        }

        self.connection.send_data_at(payload.len(), now);
        self.transmit(&bytes)?;
        self.connection.send_packet_at(seq, bytes, now);
        self.in_flight.insert(
            seq,
            InFlight {
                sent_at: now,
                wire_len,
                payload_len: payload.len(),
                retransmitted: false,
            },
        );
        Ok(true)
    }

    fn finish_package_if_done(&mut self) {
        let done = self.current.as_ref().is_some_and(|c| c.unsent.is_empty())
            && self.connection.unacknowledged_count() == 0;
        if !done {
            return;
        }
        if let Some(current) = self.current.take() {
            debug!(package = %current.id, chunks = current.total, "package acknowledged");
        }
        self.connection.clear_sequences();
        self.in_flight.clear();
        self.stats.packages_sent += 1;
    }

    fn send_fin_if_idle(&mut self, now: Instant) -> LsptResult<()> {
        if !self.close_requested || self.current.is_some() || !self.outbound.is_empty() {
            return Ok(());
        }
        let started = match self.connection.state() {
            ConnectionState::Established => self.connection.initiate_close(),
            ConnectionState::CloseWait => self.connection.close(),
            _ => false,
        };
        self.close_requested = false;
        if !started {
            return Ok(());
        }

        self.send_packet(PacketType::Fin, CONTROL_ID, 0, 0, &[])?;
        self.pending_control = Some(PendingControl {
            kind: PacketType::Fin,
            sent_at: now,
            attempts: 0,
        });
        Ok(())
    }

    fn send_hello(&mut self, now: Instant, attempts: u32) -> LsptResult<()> {
        let hello = self.handshake.initiate_handshake();
        self.cipher = None;
        self.handshake_replay = None;
        self.send_packet(PacketType::Handshake, CONTROL_ID, 0, 0, &hello)?;
        self.handshake_timer = Some(HandshakeTimer {
            sent_at: now,
            attempts,
        });
        Ok(())
    }

    fn send_ack(&mut self, id: PackageId, seq: u32, total: u32, window: u32) -> LsptResult<()> {
        self.send_packet(PacketType::Ack, id.as_u128(), seq, total, &window.to_le_bytes())
    }

    fn send_window_update(&mut self, window: u32) -> LsptResult<()> {
        self.send_packet(
            PacketType::WindowUpdate,
            CONTROL_ID,
            0,
            0,
            &window.to_le_bytes(),
        )
    }

    fn send_packet(
        &mut self,
        kind: PacketType,
        package_id: u128,
        seq: u32,
        total: u32,
        payload: &[u8],
    ) -> LsptResult<()> {
        let bytes = encode(kind.into(), package_id, seq, total, payload)?;
        trace!(?kind, seq, len = bytes.len(), "sending packet");
        self.transmit(&bytes)
    }

    fn transmit(&mut self, bytes: &[u8]) -> LsptResult<()> {
        if !self.transport.send(bytes) {
            warn!(len = bytes.len(), "transport refused datagram");
            return Err(SessionError::TransportClosed.into());
        }
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    fn check_control_timer(&mut self, now: Instant) -> LsptResult<()> {
        let Some(mut pending) = self.pending_control else {
            return Ok(());
        };
        let state = self.connection.state();
        let waiting = match pending.kind {
            PacketType::Syn => state == ConnectionState::SynSent,
            PacketType::SynAck => state == ConnectionState::SynReceived,
            _ => matches!(
                state,
                ConnectionState::FinWait1 | ConnectionState::Closing | ConnectionState::LastAck
            ),
        };
        if !waiting {
            self.pending_control = None;
            return Ok(());
        }
        if now.saturating_duration_since(pending.sent_at) < self.rtt.rto() {
            return Ok(());
        }

        pending.attempts += 1;
        if pending.attempts > self.config.max_retransmits {
            warn!(kind = ?pending.kind, %state, "control packet unanswered, giving up");
            self.pending_control = None;
            self.connection.on_timeout();
            return Err(self.unresponsive());
        }

        self.rtt.backoff();
        debug!(kind = ?pending.kind, attempt = pending.attempts, "retransmitting control packet");
        self.send_packet(pending.kind, CONTROL_ID, 0, 0, &[])?;
        pending.sent_at = now;
        self.pending_control = Some(pending);
        Ok(())
    }

    fn check_handshake_timer(&mut self, now: Instant) -> LsptResult<()> {
        let Some(timer) = self.handshake_timer else {
            return Ok(());
        };
        if self.handshake.state() != HandshakeState::HelloSent {
            self.handshake_timer = None;
            return Ok(());
        }
        if now.saturating_duration_since(timer.sent_at) < self.rtt.rto() {
            return Ok(());
        }

        let attempts = timer.attempts + 1;
        if attempts > self.config.max_retransmits {
            warn!("handshake unanswered, aborting connection");
            self.abort_at(now)?;
            return Err(self.unresponsive());
        }
        self.rtt.backoff();
        debug!(attempt = attempts, "handshake unanswered, restarting");
        self.send_hello(now, attempts)
    }

    fn check_retransmissions(&mut self, now: Instant) -> LsptResult<()> {
        let Some(oldest) = self.in_flight.values().map(|f| f.sent_at).min() else {
            return Ok(());
        };
        if now.saturating_duration_since(oldest) < self.rtt.rto() {
            return Ok(());
        }

        let resend = self.connection.retransmit_unacknowledged_at(now);
        if resend.is_empty() {
            return Ok(());
        }
        let exhausted = resend.iter().any(|(seq, _)| {
            self.connection.retransmission_attempts(*seq).unwrap_or(0) > self.config.max_retransmits
        });
        if exhausted {
            warn!("chunk retransmission limit reached, aborting connection");
            self.abort_at(now)?;
            return Err(self.unresponsive());
        }

        let rto = self.rtt.backoff();
        self.connection.congestion_mut().on_packet_loss_at(now);
        debug!(count = resend.len(), ?rto, "retransmission timeout");

        for (seq, bytes) in resend {
            self.transmit(&bytes)?;
            self.stats.retransmissions += 1;
            if let Some(flight) = self.in_flight.get_mut(&seq) {
                flight.sent_at = now;
                flight.retransmitted = true;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn data_ready(&self) -> bool {
        match self.handshake.state() {
            HandshakeState::Established => self.cipher.is_some(),
            HandshakeState::Initial => !self.config.require_encryption,
            HandshakeState::HelloSent => false,
        }
    }

    /// A SYN_RECEIVED side whose ACK was lost treats peer traffic as one.
    fn accept_implicit_ack(&mut self) {
        if self.connection.state() == ConnectionState::SynReceived && self.connection.handle_ack() {
            debug!("connection established by implicit ack");
        }
    }

    fn after_transition(&mut self, now: Instant) {
        match self.connection.state() {
            ConnectionState::TimeWait => self.connection.set_time_wait_start(now),
            ConnectionState::Closed => debug!("connection closed"),
            _ => {}
        }
    }

    fn apply_window(&mut self, advertised: u32) {
        let outstanding: usize = self.in_flight.values().map(|f| f.payload_len).sum();
        let outstanding = u32::try_from(outstanding).unwrap_or(u32::MAX);
        self.connection
            .update_available_window(advertised.saturating_sub(outstanding));
    }

    fn abandon_outbound(&mut self) {
        let dropped = self.pending_packages();
        if dropped > 0 {
            warn!(dropped, "peer closed, dropping unsent packages");
        }
        self.outbound.clear();
        self.current = None;
        self.in_flight.clear();
        self.connection.clear_sequences();
    }

    fn abort_at(&mut self, now: Instant) -> LsptResult<()> {
        let open = self.connection.state() != ConnectionState::Closed;
        self.reset_local(now);
        if open {
            self.send_packet(PacketType::Reset, CONTROL_ID, 0, 0, &[])?;
        }
        Ok(())
    }

    fn reset_local(&mut self, now: Instant) {
        self.connection.reset_at(now);
        self.rtt = RttEstimator::new();
        self.handshake.reset();
        self.handshake_timer = None;
        self.handshake_replay = None;
        self.cipher = None;
        self.active_open = false;
        self.close_requested = false;
        self.pending_control = None;
        self.outbound.clear();
        self.current = None;
        self.in_flight.clear();
        self.inbound.clear();
        self.recent.clear();
    }

    fn invalid_state(&self, operation: &'static str) -> LsptError {
        SessionError::InvalidState {
            operation,
            state: self.connection.state().as_str(),
        }
        .into()
    }

    fn unresponsive(&self) -> LsptError {
        SessionError::PeerUnresponsive {
            attempts: self.config.max_retransmits,
        }
        .into()
    }
}

fn read_window(payload: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(payload).ok().map(u32::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    type Wire = Rc<RefCell<VecDeque<Vec<u8>>>>;
    type Hook = Box<dyn FnMut(&mut Vec<u8>) -> bool>;

    struct PipeEnd {
        outgoing: Wire,
        incoming: Wire,
    }

    impl Transport for PipeEnd {
        fn send(&mut self, datagram: &[u8]) -> bool {
            self.outgoing.borrow_mut().push_back(datagram.to_vec());
            true
        }

        fn receive(&mut self) -> Option<Vec<u8>> {
            self.incoming.borrow_mut().pop_front()
        }
    }

    /// Ground session `a` and airborne session `b` on a lossless pipe,
    /// driven by a synthetic clock in 1 ms steps.
    struct Harness {
        a: Session<PipeEnd>,
        b: Session<PipeEnd>,
        ab: Wire,
        ba: Wire,
        /// Applied to every a-to-b datagram; return `false` to drop it.
        hook: Option<Hook>,
        now: Instant,
    }

    impl Harness {
        fn new(config: ProtocolConfig) -> Self {
            let ab = Wire::default();
            let ba = Wire::default();
            let a = Session::new(
                PipeEnd {
                    outgoing: ab.clone(),
                    incoming: ba.clone(),
                },
                config.clone(),
                Role::Ground,
            )
            .unwrap();
            let b = Session::new(
                PipeEnd {
                    outgoing: ba.clone(),
                    incoming: ab.clone(),
                },
                config,
                Role::Airborne,
            )
            .unwrap();
            Self {
                a,
                b,
                ab,
                ba,
                hook: None,
                now: Instant::now(),
            }
        }

        fn connected() -> Self {
            let mut h = Self::new(ProtocolConfig::default());
            h.a.connect().unwrap();
            h.run_until(|h| h.a.is_secure() && h.b.is_secure() && h.b.handshake().is_confirmed());
            h
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.a.poll_at(self.now).unwrap();
            if let Some(hook) = self.hook.as_mut() {
                self.ab.borrow_mut().retain_mut(|datagram| hook(datagram));
            }
            self.b.poll_at(self.now).unwrap();
        }

        fn step(&mut self) {
            self.advance(Duration::from_millis(1));
        }

        fn run_until(&mut self, done: impl Fn(&Self) -> bool) {
            for _ in 0..5000 {
                if done(self) {
                    return;
                }
                self.step();
            }
            panic!("condition not reached");
        }
    }

    fn is_data(datagram: &[u8], seq: u32) -> bool {
        decode(datagram)
            .is_ok_and(|p| p.kind() == Some(PacketType::Data) && p.sequence_number == seq)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_connect_and_secure() {
        let h = Harness::connected();
        assert_eq!(h.a.state(), ConnectionState::Established);
        assert_eq!(h.b.state(), ConnectionState::Established);
        assert!(h.a.handshake().is_initiator());
        assert!(!h.b.handshake().is_initiator());
        assert_eq!(h.a.shared_secret().unwrap(), h.b.shared_secret().unwrap());
        assert_eq!(
            h.a.shared_secret().unwrap(),
            h.a.handshake().shared_secret().unwrap()
        );
    }

    #[test]
    fn test_shared_secret_needs_handshake() {
        let mut h = Harness::new(ProtocolConfig::default());
        let err = h.a.shared_secret().unwrap_err();
        assert!(matches!(
            err,
            LsptError::Session(SessionError::HandshakeIncomplete)
        ));
        assert_eq!(err.kind(), ErrorKind::State);

        h.a.connect().unwrap();
        h.run_until(|h| h.a.is_secure() && h.b.is_secure());
        assert_eq!(h.a.shared_secret().unwrap().len(), 32);

        h.a.abort().unwrap();
        assert!(matches!(
            h.a.shared_secret(),
            Err(LsptError::Session(SessionError::HandshakeIncomplete))
        ));
    }

    #[test]
    fn test_package_transfer() {
        let mut h = Harness::connected();
        let data = pattern(10_000);
        let id = h.a.send_package(Package::new(data.clone())).unwrap();

        h.run_until(|h| h.a.stats().packages_sent == 1);
        let package = h.b.recv_package().unwrap();
        assert_eq!(package.id(), id);
        assert_eq!(package.data(), &data[..]);
        assert!(h.b.recv_package().is_none());
        assert_eq!(h.a.stats().retransmissions, 0);
        assert_eq!(h.a.connection().unacknowledged_count(), 0);
        assert!(h.a.rtt().is_initialized());
    }

    #[test]
    fn test_bidirectional_transfer() {
        let mut h = Harness::connected();
        let window = h.a.config().receive_window;
        let uplink = pattern(20_000);
        let downlink: Vec<u8> = pattern(20_500).into_iter().rev().collect();
        h.a.send_package(Package::new(uplink.clone())).unwrap();
        h.b.send_package(Package::new(downlink.clone())).unwrap();

        for _ in 0..5000 {
            let done = [&h.a, &h.b].iter().all(|s| {
                s.stats().packages_received == 1
                    && s.pending_packages() == 0
                    && s.connection().unacknowledged_count() == 0
            });
            if done {
                break;
            }
            h.step();
            assert!(h.a.connection().available_window() <= window);
            assert!(h.b.connection().available_window() <= window);
        }

        assert_eq!(h.b.recv_package().unwrap().data(), &uplink[..]);
        assert_eq!(h.a.recv_package().unwrap().data(), &downlink[..]);
        assert_eq!(h.a.connection().available_window(), window);
        assert_eq!(h.b.connection().available_window(), window);
        assert_eq!(h.a.stats().packages_sent, 1);
        assert_eq!(h.b.stats().packages_sent, 1);
    }

    #[cfg(feature = "transport")]
    #[tokio::test]
    async fn test_session_over_udp() {
        use crate::transport::DatagramSocket;

        let ground_link = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let drone_link = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        ground_link
            .connect(drone_link.local_addr().unwrap())
            .await
            .unwrap();
        drone_link
            .connect(ground_link.local_addr().unwrap())
            .await
            .unwrap();

        let config = ProtocolConfig::default();
        let mut ground = Session::new(ground_link, config.clone(), Role::Ground).unwrap();
        let mut drone = Session::new(drone_link, config, Role::Airborne).unwrap();
        ground.connect().unwrap();

        let uplink = pattern(6000);
        ground.send_package(Package::new(uplink.clone())).unwrap();

        let mut replied = false;
        let mut at_drone = None;
        let mut at_ground = None;
        for _ in 0..2000 {
            ground.poll().unwrap();
            drone.poll().unwrap();
            if !replied && drone.is_secure() {
                drone
                    .send_package(Package::new(b"downlink status".to_vec()))
                    .unwrap();
                replied = true;
            }
            at_drone = at_drone.or_else(|| drone.recv_package());
            at_ground = at_ground.or_else(|| ground.recv_package());
            if at_drone.is_some() && at_ground.is_some() {
                break;
            }
            // Lets the reactor observe socket readiness.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(at_drone.unwrap().data(), &uplink[..]);
        assert_eq!(at_ground.unwrap().data(), b"downlink status");
        assert!(ground.is_secure());
        assert!(drone.is_secure());
    }

    #[test]
    fn test_payload_encrypted_on_wire() {
        let mut h = Harness::connected();
        let secret = b"coordinates 47.3769N 8.5417E".to_vec();
        h.a.send_package(Package::new(secret.clone())).unwrap();

        h.a.poll_at(h.now).unwrap();
        let wire = h.ab.borrow();
        let packet = wire
            .iter()
            .filter_map(|d| decode(d).ok())
            .find(|p| p.kind() == Some(PacketType::Data))
            .unwrap();
        assert_eq!(packet.payload.len(), secret.len() + 16);
        assert!(!packet.payload.windows(secret.len()).any(|w| w == &secret[..]));
    }

    #[test]
    fn test_packages_in_order() {
        let mut h = Harness::connected();
        let sizes = [3000, 0, 1, 1148];
        for size in sizes {
            h.a.send_package(Package::new(pattern(size))).unwrap();
        }

        h.run_until(|h| h.b.stats().packages_received == sizes.len() as u64);
        for size in sizes {
            let package = h.b.recv_package().unwrap();
            assert_eq!(package.data(), &pattern(size)[..]);
        }
        h.run_until(|h| h.a.pending_packages() == 0);
    }

    #[test]
    fn test_empty_package() {
        let mut h = Harness::connected();
        let id = h.a.send_package(Package::new(Vec::new())).unwrap();

        h.run_until(|h| h.a.stats().packages_sent == 1);
        let package = h.b.recv_package().unwrap();
        assert_eq!(package.id(), id);
        assert!(package.is_empty());
    }

    #[test]
    fn test_lost_chunk_retransmitted() {
        let mut h = Harness::connected();
        let mut dropped = false;
        h.hook = Some(Box::new(move |datagram: &mut Vec<u8>| {
            let hit = !dropped && is_data(datagram, 1);
            dropped |= hit;
            !hit
        }));

        let data = pattern(5000);
        h.a.send_package(Package::new(data.clone())).unwrap();
        h.run_until(|h| h.b.stats().packages_received == 1);

        assert_eq!(h.b.recv_package().unwrap().data(), &data[..]);
        assert!(h.a.stats().retransmissions >= 1);
        assert!(h.a.connection().congestion().w_max() > 0);
    }

    #[test]
    fn test_corrupted_chunk_dropped() {
        let mut h = Harness::connected();
        let mut corrupted = false;
        h.hook = Some(Box::new(move |datagram: &mut Vec<u8>| {
            if !corrupted && is_data(datagram, 0) {
                let last = datagram.len() - 1;
                datagram[last] ^= 0xFF;
                corrupted = true;
            }
            true
        }));

        let data = pattern(2500);
        h.a.send_package(Package::new(data.clone())).unwrap();
        h.run_until(|h| h.b.stats().packages_received == 1);

        assert_eq!(h.b.recv_package().unwrap().data(), &data[..]);
        assert_eq!(h.b.stats().packets_dropped, 1);
        assert!(h.a.stats().retransmissions >= 1);
    }

    #[test]
    fn test_plaintext_session() {
        let config = ProtocolConfig::builder()
            .require_encryption(false)
            .build()
            .unwrap();
        let mut h = Harness::new(config);
        h.a.connect().unwrap();
        let data = pattern(4000);
        h.a.send_package(Package::new(data.clone())).unwrap();

        h.run_until(|h| h.b.stats().packages_received == 1);
        assert_eq!(h.b.recv_package().unwrap().data(), &data[..]);
        assert!(!h.a.is_secure());
        assert_eq!(h.a.handshake().state(), HandshakeState::Initial);
    }

    #[test]
    fn test_graceful_close() {
        let mut h = Harness::connected();
        h.a.close().unwrap();
        h.run_until(|h| {
            h.a.state() == ConnectionState::FinWait2 && h.b.state() == ConnectionState::CloseWait
        });

        h.b.close().unwrap();
        h.run_until(|h| h.b.state() == ConnectionState::Closed);
        assert_eq!(h.a.state(), ConnectionState::TimeWait);

        h.advance(Duration::from_secs(1));
        assert_eq!(h.a.state(), ConnectionState::TimeWait);
        h.advance(Duration::from_secs(2));
        assert_eq!(h.a.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_waits_for_queued_data() {
        let mut h = Harness::connected();
        let data = pattern(8000);
        h.a.send_package(Package::new(data.clone())).unwrap();
        h.a.close().unwrap();
        assert!(h.a.send_package(Package::new(vec![1])).is_err());

        h.run_until(|h| h.b.state() == ConnectionState::CloseWait);
        assert_eq!(h.b.recv_package().unwrap().data(), &data[..]);
    }

    #[test]
    fn test_abort() {
        let mut h = Harness::connected();
        h.a.abort().unwrap();
        assert_eq!(h.a.state(), ConnectionState::Closed);
        assert!(!h.a.is_secure());

        h.step();
        assert_eq!(h.b.state(), ConnectionState::Closed);
        assert!(!h.b.is_secure());
    }

    #[test]
    fn test_handshake_violation_aborts() {
        let mut h = Harness::connected();
        let junk = encode(PacketType::Handshake.into(), 0, 0, 0, b"Xjunk").unwrap();
        h.ab.borrow_mut().push_back(junk);

        let err = h.b.poll_at(h.now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(h.b.state(), ConnectionState::Closed);

        h.a.poll_at(h.now).unwrap();
        assert_eq!(h.a.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_duplicate_handshake_replayed() {
        let mut h = Harness::new(ProtocolConfig::default());
        h.a.connect().unwrap();
        h.step();
        h.now += Duration::from_millis(1);
        h.a.poll_at(h.now).unwrap();
        let hello = h
            .ab
            .borrow()
            .iter()
            .find(|d| decode(d).is_ok_and(|p| p.kind() == Some(PacketType::Handshake)))
            .cloned()
            .unwrap();
        h.b.poll_at(h.now).unwrap();
        h.run_until(|h| h.a.is_secure() && h.b.handshake().is_confirmed());

        // A late copy of the hello gets the stored reply, not a new key.
        let public = h.b.handshake().local_public_key().to_vec();
        let sent_before = h.b.stats().packets_sent;
        h.ab.borrow_mut().push_back(hello);
        h.b.poll_at(h.now).unwrap();
        assert_eq!(h.b.stats().packets_sent, sent_before + 1);
        assert_eq!(h.b.handshake().local_public_key(), &public[..]);
        assert!(h.b.is_secure());

        // A duplicate ack on the initiator side is ignored.
        let sent_before = h.a.stats().packets_sent;
        let ack = encode(PacketType::Handshake.into(), 0, 0, 0, b"E").unwrap();
        h.ba.borrow_mut().clear();
        h.ba.borrow_mut().push_back(ack);
        h.a.poll_at(h.now).unwrap();
        assert!(h.a.is_secure());
        assert_eq!(h.a.stats().packets_sent, sent_before);
    }

    #[test]
    fn test_keep_alive_when_idle() {
        let mut h = Harness::connected();
        h.ab.borrow_mut().clear();

        h.now += Duration::from_secs(61);
        h.a.poll_at(h.now).unwrap();
        let keep_alive = h
            .ab
            .borrow()
            .iter()
            .filter_map(|d| decode(d).ok())
            .any(|p| p.kind() == Some(PacketType::KeepAlive));
        assert!(keep_alive);
        assert!(h.a.connection().is_connection_alive_at(h.now));
    }

    #[test]
    fn test_peer_unresponsive() {
        let mut h = Harness::new(ProtocolConfig::default());
        h.a.connect().unwrap();

        let mut result = Ok(());
        for _ in 0..20 {
            h.now += Duration::from_secs(70);
            result = h.a.poll_at(h.now);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(LsptError::Session(SessionError::PeerUnresponsive { .. }))
        ));
        assert_eq!(h.a.state(), ConnectionState::Closed);
        // Original SYN plus ten retransmissions.
        assert_eq!(h.ab.borrow().len(), 11);
    }

    #[test]
    fn test_invalid_operations() {
        let mut h = Harness::new(ProtocolConfig::default());
        let err = h.a.send_package(Package::new(vec![1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(h.a.close().is_err());
        assert!(matches!(
            h.a.start_handshake(),
            Err(LsptError::Session(SessionError::NotEstablished))
        ));

        h.a.connect().unwrap();
        assert!(h.a.connect().is_err());
        assert!(h.a.send_package(Package::new(vec![1])).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProtocolConfig {
            chunk_size: 0,
            ..ProtocolConfig::default()
        };
        let ab = Wire::default();
        let pipe = PipeEnd {
            outgoing: ab.clone(),
            incoming: ab,
        };
        assert!(matches!(
            Session::new(pipe, config, Role::Ground),
            Err(LsptError::Config(_))
        ));
    }
}
