//! Role-tagged ephemeral key exchange.
//!
//! Every handshake message starts with the sender's role identifier:
//!
//! ```text
//! hello: [ identifier (1-2) | public key (32) ]
//! ack:   [ identifier (1-2) ]
//! ```
//!
//! A full exchange is three messages. The initiator sends its hello, the
//! responder answers with its own hello, and the initiator closes with a
//! bare acknowledgement:
//!
//! ```text
//! Initiator                          Responder
//!   Initial                            Initial
//!   initiate_handshake() --hello--->
//!   HelloSent                          Established
//!             <--------hello---------
//!   Established
//!             ---------ack---------->  (confirmed)
//! ```
//!
//! The relay role sits between ground and airborne nodes. It can act as an
//! endpoint, or pass traffic through with [`HandshakeSession::forward`],
//! which reads the originator from the identifier and re-tags the payload.

use std::fmt;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::X25519;
use crate::core::constants::{GROUND_IDENTIFIER, SPACE_IDENTIFIER};
use crate::core::{HandshakeError, KeyExchange, ProtocolViolation};

const GROUND_TAG: &[u8] = &[GROUND_IDENTIFIER];
const SPACE_TAG: &[u8] = &[SPACE_IDENTIFIER];
const RELAY_TAG: &[u8] = &[GROUND_IDENTIFIER, SPACE_IDENTIFIER];

/// Network segment a handshake endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Ground station.
    Ground,
    /// Airborne node (drone).
    Airborne,
    /// Relay satellite bridging ground and airborne nodes.
    Relay,
}

impl Role {
    /// Identifier bytes this role prefixes to its messages.
    pub fn identifier(self) -> &'static [u8] {
        match self {
            Role::Ground => GROUND_TAG,
            Role::Airborne => SPACE_TAG,
            Role::Relay => RELAY_TAG,
        }
    }

    /// Peer identifiers this role accepts, longest first.
    pub fn accepted_identifiers(self) -> &'static [&'static [u8]] {
        match self {
            Role::Ground => &[RELAY_TAG, SPACE_TAG],
            Role::Airborne => &[RELAY_TAG, GROUND_TAG],
            Role::Relay => &[GROUND_TAG, SPACE_TAG],
        }
    }

    /// Role name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Ground => "ground",
            Role::Airborne => "airborne",
            Role::Relay => "relay",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received.
    Initial,
    /// Our hello is out, waiting for the peer's.
    HelloSent,
    /// Shared secret derived.
    Established,
}

impl HandshakeState {
    /// State name.
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeState::Initial => "Initial",
            HandshakeState::HelloSent => "HelloSent",
            HandshakeState::Established => "Established",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a role-tagged handshake.
pub struct HandshakeSession<K: KeyExchange = X25519> {
    role: Role,
    kx: K,
    state: HandshakeState,
    local_private: K::PrivateKey,
    local_public: Vec<u8>,
    peer_public: Option<Vec<u8>>,
    shared_secret: Option<Zeroizing<Vec<u8>>>,
    initiator: bool,
    confirmed: bool,
}

impl<K: KeyExchange> fmt::Debug for HandshakeSession<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("local_public", &hex::encode(&self.local_public))
            .field("initiator", &self.initiator)
            .field("confirmed", &self.confirmed)
            .finish_non_exhaustive()
    }
}

impl HandshakeSession<X25519> {
    /// Create an X25519 handshake for `role`.
    pub fn new(role: Role) -> Self {
        Self::with_key_exchange(role, X25519)
    }
}

impl<K: KeyExchange> HandshakeSession<K> {
    /// Create a handshake over a custom key exchange.
    pub fn with_key_exchange(role: Role, kx: K) -> Self {
        let local_private = kx.generate_key_pair();
        let local_public = kx.public_key(&local_private);
        Self {
            role,
            kx,
            state: HandshakeState::Initial,
            local_private,
            local_public,
            peer_public: None,
            shared_secret: None,
            initiator: false,
            confirmed: false,
        }
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Check if the shared secret is available.
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Check if this side sent the first hello.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Check if the peer's final acknowledgement has arrived.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Our encoded public key.
    pub fn local_public_key(&self) -> &[u8] {
        &self.local_public
    }

    /// The peer's encoded public key, once received.
    pub fn peer_public_key(&self) -> Option<&[u8]> {
        self.peer_public.as_deref()
    }

    /// Start (or restart) the handshake.
    ///
    /// A fresh ephemeral key pair replaces the previous one and any peer
    /// state is dropped. Returns the tagged hello to send.
    pub fn initiate_handshake(&mut self) -> Vec<u8> {
        self.regenerate();
        self.initiator = true;
        self.state = HandshakeState::HelloSent;
        debug!(role = %self.role, "handshake hello sent");
        self.tagged(&self.local_public)
    }

    /// Drop all progress and return to `Initial` with a fresh key pair.
    pub fn reset(&mut self) {
        self.regenerate();
        self.initiator = false;
        self.state = HandshakeState::Initial;
    }

    /// Process a message from the peer.
    ///
    /// Returns the reply to send, if any: our tagged hello when answering
    /// an unsolicited hello, or a bare acknowledgement when completing our
    /// own exchange.
    pub fn handle_handshake_message(
        &mut self,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, HandshakeError> {
        let payload = self.strip(message)?;

        match self.state {
            HandshakeState::Established => {
                if payload.is_empty() && !self.confirmed {
                    self.confirmed = true;
                    debug!(role = %self.role, "handshake confirmed");
                    return Ok(None);
                }
                warn!(role = %self.role, "handshake message after establishment");
                Err(ProtocolViolation::AlreadyEstablished.into())
            }
            HandshakeState::Initial | HandshakeState::HelloSent => {
                if payload.len() != K::PUBLIC_KEY_LEN {
                    warn!(
                        role = %self.role,
                        len = payload.len(),
                        "handshake key has wrong length"
                    );
                    return Err(ProtocolViolation::InvalidKeyLength {
                        expected: K::PUBLIC_KEY_LEN,
                        actual: payload.len(),
                    }
                    .into());
                }

                let secret = self.kx.shared_secret(&self.local_private, payload)?;
                self.peer_public = Some(payload.to_vec());
                self.shared_secret = Some(Zeroizing::new(secret));

                let reply = if self.state == HandshakeState::Initial {
                    self.tagged(&self.local_public)
                } else {
                    // Both keys are known on both sides now.
                    self.confirmed = true;
                    self.role.identifier().to_vec()
                };
                self.state = HandshakeState::Established;
                debug!(role = %self.role, initiator = self.initiator, "handshake established");
                Ok(Some(reply))
            }
        }
    }

    /// The derived shared secret.
    pub fn shared_secret(&self) -> Result<&[u8], HandshakeError> {
        match (&self.state, &self.shared_secret) {
            (HandshakeState::Established, Some(secret)) => Ok(secret.as_slice()),
            _ => Err(HandshakeError::State {
                expected: HandshakeState::Established.as_str(),
                actual: self.state.as_str(),
            }),
        }
    }

    /// Relay a message between ground and airborne endpoints.
    ///
    /// Only valid for [`Role::Relay`]. The originator is read from the
    /// identifier, the payload is checked to be a public key or an empty
    /// acknowledgement, and the originator's identifier is re-applied.
    pub fn forward(&self, message: &[u8]) -> Result<(Role, Vec<u8>), HandshakeError> {
        if self.role != Role::Relay {
            return Err(ProtocolViolation::NotRelay.into());
        }

        let origin = match message.first() {
            Some(&GROUND_IDENTIFIER) => Role::Ground,
            Some(&SPACE_IDENTIFIER) => Role::Airborne,
            _ => return Err(ProtocolViolation::UnknownIdentifier.into()),
        };
        let payload = &message[origin.identifier().len()..];
        if !payload.is_empty() && payload.len() != K::PUBLIC_KEY_LEN {
            return Err(ProtocolViolation::InvalidKeyLength {
                expected: K::PUBLIC_KEY_LEN,
                actual: payload.len(),
            }
            .into());
        }

        debug!(origin = %origin, len = payload.len(), "relaying handshake message");
        let mut out = origin.identifier().to_vec();
        out.extend_from_slice(payload);
        Ok((origin, out))
    }

    fn regenerate(&mut self) {
        self.local_private = self.kx.generate_key_pair();
        self.local_public = self.kx.public_key(&self.local_private);
        self.peer_public = None;
        self.shared_secret = None;
        self.confirmed = false;
    }

    fn tagged(&self, payload: &[u8]) -> Vec<u8> {
        let tag = self.role.identifier();
        let mut out = Vec::with_capacity(tag.len() + payload.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        out
    }

    /// Strip the longest accepted identifier.
    ///
    /// A key may itself begin with an identifier byte, so a shorter prefix
    /// wins when it is the only one leaving a well-formed payload.
    fn strip<'a>(&self, message: &'a [u8]) -> Result<&'a [u8], HandshakeError> {
        let well_formed = |p: &[u8]| p.is_empty() || p.len() == K::PUBLIC_KEY_LEN;
        let mut candidates = self
            .role
            .accepted_identifiers()
            .iter()
            .filter(|tag| message.starts_with(tag))
            .map(|tag| &message[tag.len()..]);

        let Some(first) = candidates.next() else {
            warn!(role = %self.role, "handshake message with unknown identifier");
            return Err(ProtocolViolation::UnknownIdentifier.into());
        };
        if well_formed(first) {
            return Ok(first);
        }
        Ok(candidates.find(|p| well_formed(*p)).unwrap_or(first))
    }
}
