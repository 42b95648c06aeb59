//! Core traits for LSPT.
//!
//! These traits are the seams between the protocol engine and the
//! outside world: the datagram carrier and the crypto primitives.

use super::error::CryptoError;

/// Unreliable datagram carrier.
///
/// The protocol needs only whole-datagram send and a non-blocking receive.
/// Delivery may drop, duplicate or reorder; the connection layer copes.
///
/// # Example
///
/// ```
/// use std::collections::VecDeque;
/// use lspt_protocol::core::Transport;
///
/// #[derive(Default)]
/// struct Loopback {
///     queue: VecDeque<Vec<u8>>,
/// }
///
/// impl Transport for Loopback {
///     fn send(&mut self, datagram: &[u8]) -> bool {
///         self.queue.push_back(datagram.to_vec());
///         true
///     }
///
///     fn receive(&mut self) -> Option<Vec<u8>> {
///         self.queue.pop_front()
///     }
/// }
///
/// let mut link = Loopback::default();
/// assert!(link.send(b"ping"));
/// assert_eq!(link.receive().as_deref(), Some(&b"ping"[..]));
/// assert!(link.receive().is_none());
/// ```
pub trait Transport {
    /// Hand one datagram to the carrier. Returns `false` if it was refused.
    fn send(&mut self, datagram: &[u8]) -> bool;

    /// Take the next received datagram, if any is ready.
    fn receive(&mut self) -> Option<Vec<u8>>;
}

/// Authenticated encryption with associated data.
///
/// The tag is detached from the ciphertext so the caller decides where it
/// goes on the wire.
pub trait Aead {
    /// Encrypt `plaintext`, returning the ciphertext and its tag.
    fn encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; 16]), CryptoError>;

    /// Decrypt `ciphertext` and verify `tag`.
    ///
    /// MUST fail with [`CryptoError::DecryptionFailed`] if any bit of the
    /// key, IV, ciphertext, AAD or tag differs from what was sealed.
    fn decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Diffie-Hellman style key agreement.
pub trait KeyExchange {
    /// Length of an encoded public key.
    const PUBLIC_KEY_LEN: usize;

    /// Private half of a key pair.
    type PrivateKey;

    /// Generate a fresh ephemeral key pair.
    fn generate_key_pair(&self) -> Self::PrivateKey;

    /// Encode the public half of `private`.
    fn public_key(&self, private: &Self::PrivateKey) -> Vec<u8>;

    /// Derive the shared secret with a peer's encoded public key.
    fn shared_secret(
        &self,
        private: &Self::PrivateKey,
        peer_public: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}
