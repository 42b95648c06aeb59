//! ChaCha20-Poly1305 AEAD and per-packet encryption.
//!
//! After the handshake both sides expand the shared secret with
//! HKDF-SHA256 into one key per direction. Each package is sealed under
//! its own key, expanded from the direction key and the full 128-bit
//! package id, so the key and nonce pair of a chunk is unique for any two
//! distinct ids. The nonce is built from the direction, the package id
//! and the sequence number:
//!
//! ```text
//! [ direction (1) | package id, low 7 bytes LE (7) | sequence LE (4) ]
//! ```
//!
//! The packet header fields (flags and the three varints) are the
//! associated data, so a chunk cannot be replayed under another position.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce, Tag};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::core::constants::{AEAD_IV_SIZE, AEAD_KEY_SIZE, AEAD_TAG_SIZE};
use crate::core::{Aead, CryptoError};

/// HKDF salt for packet keys.
const HKDF_SALT: &[u8] = b"lspt v1 packet keys";

/// HKDF info for packet keys.
const HKDF_INFO: &[u8] = b"initiator->responder|responder->initiator";

/// HKDF info prefix for per-package keys; the big-endian id follows.
const PACKAGE_KEY_INFO: &[u8] = b"lspt v1 package key";

/// Nonce direction byte for initiator-to-responder traffic.
pub const DIRECTION_INITIATOR: u8 = 0x01;

/// Nonce direction byte for responder-to-initiator traffic.
pub const DIRECTION_RESPONDER: u8 = 0x02;

/// ChaCha20-Poly1305 with detached tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaCha20Poly1305Aead;

impl ChaCha20Poly1305Aead {
    fn cipher(key: &[u8], iv: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
        if iv.len() != AEAD_IV_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: AEAD_IV_SIZE,
                actual: iv.len(),
            });
        }
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: AEAD_KEY_SIZE,
            actual: key.len(),
        })
    }
}

impl Aead for ChaCha20Poly1305Aead {
    fn encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; AEAD_TAG_SIZE]), CryptoError> {
        let cipher = Self::cipher(key, iv)?;
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = [0u8; AEAD_TAG_SIZE];
        out.copy_from_slice(tag.as_slice());
        Ok((buffer, out))
    }

    fn decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
        tag: &[u8; AEAD_TAG_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key, iv)?;
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                aad,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }
}

/// Directional packet keys derived from a handshake secret.
pub struct PacketCipher<A: Aead = ChaCha20Poly1305Aead> {
    aead: A,
    send_key: Zeroizing<[u8; AEAD_KEY_SIZE]>,
    recv_key: Zeroizing<[u8; AEAD_KEY_SIZE]>,
    send_direction: u8,
    recv_direction: u8,
}

impl<A: Aead> std::fmt::Debug for PacketCipher<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("send_direction", &self.send_direction)
            .field("recv_direction", &self.recv_direction)
            .finish_non_exhaustive()
    }
}

impl PacketCipher<ChaCha20Poly1305Aead> {
    /// Derive packet keys with ChaCha20-Poly1305.
    ///
    /// `is_initiator` must be `true` on the side that sent the first
    /// handshake hello and `false` on the other.
    pub fn derive(shared_secret: &[u8], is_initiator: bool) -> Result<Self, CryptoError> {
        Self::derive_with(ChaCha20Poly1305Aead, shared_secret, is_initiator)
    }
}

impl<A: Aead> PacketCipher<A> {
    /// Derive packet keys for an arbitrary AEAD.
    pub fn derive_with(aead: A, shared_secret: &[u8], is_initiator: bool) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
        let mut okm = Zeroizing::new([0u8; 2 * AEAD_KEY_SIZE]);
        hkdf.expand(HKDF_INFO, &mut okm[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut initiator_key = Zeroizing::new([0u8; AEAD_KEY_SIZE]);
        let mut responder_key = Zeroizing::new([0u8; AEAD_KEY_SIZE]);
        initiator_key.copy_from_slice(&okm[..AEAD_KEY_SIZE]);
        responder_key.copy_from_slice(&okm[AEAD_KEY_SIZE..]);

        let (send_key, recv_key, send_direction, recv_direction) = if is_initiator {
            (initiator_key, responder_key, DIRECTION_INITIATOR, DIRECTION_RESPONDER)
        } else {
            (responder_key, initiator_key, DIRECTION_RESPONDER, DIRECTION_INITIATOR)
        };

        Ok(Self {
            aead,
            send_key,
            recv_key,
            send_direction,
            recv_direction,
        })
    }

    /// Seal an outbound payload. The tag is appended.
    pub fn seal(
        &self,
        package_id: u128,
        sequence_number: u32,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = package_key(&self.send_key[..], package_id)?;
        let nonce = packet_nonce(self.send_direction, package_id, sequence_number);
        let (mut sealed, tag) = self.aead.encrypt(&key[..], &nonce, plaintext, aad)?;
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    /// Open an inbound payload sealed by the peer.
    pub fn open(
        &self,
        package_id: u128,
        sequence_number: u32,
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < AEAD_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (ciphertext, tag_bytes) = sealed.split_at(sealed.len() - AEAD_TAG_SIZE);
        let mut tag = [0u8; AEAD_TAG_SIZE];
        tag.copy_from_slice(tag_bytes);

        let key = package_key(&self.recv_key[..], package_id)?;
        let nonce = packet_nonce(self.recv_direction, package_id, sequence_number);
        self.aead.decrypt(&key[..], &nonce, ciphertext, aad, &tag)
    }
}

/// Expand a direction key into the key for one package.
pub fn package_key(
    direction_key: &[u8],
    package_id: u128,
) -> Result<Zeroizing<[u8; AEAD_KEY_SIZE]>, CryptoError> {
    let hkdf =
        Hkdf::<Sha256>::from_prk(direction_key).map_err(|_| CryptoError::KeyDerivationFailed)?;
    let mut key = Zeroizing::new([0u8; AEAD_KEY_SIZE]);
    hkdf.expand_multi_info(&[PACKAGE_KEY_INFO, &package_id.to_be_bytes()], &mut key[..])
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

/// Build the 12-byte nonce for one packet.
pub fn packet_nonce(direction: u8, package_id: u128, sequence_number: u32) -> [u8; AEAD_IV_SIZE] {
    let mut nonce = [0u8; AEAD_IV_SIZE];
    nonce[0] = direction;
    nonce[1..8].copy_from_slice(&package_id.to_le_bytes()[..7]);
    nonce[8..12].copy_from_slice(&sequence_number.to_le_bytes());
    nonce
}
