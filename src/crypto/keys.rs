//! X25519 key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::core::constants::PUBLIC_KEY_SIZE;
use crate::core::{CryptoError, KeyExchange};

/// X25519 Diffie-Hellman.
///
/// Private keys are zeroized on drop by `x25519-dalek`.
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519;

impl KeyExchange for X25519 {
    const PUBLIC_KEY_LEN: usize = PUBLIC_KEY_SIZE;

    type PrivateKey = StaticSecret;

    fn generate_key_pair(&self) -> StaticSecret {
        StaticSecret::random_from_rng(OsRng)
    }

    fn public_key(&self, private: &StaticSecret) -> Vec<u8> {
        PublicKey::from(private).as_bytes().to_vec()
    }

    fn shared_secret(
        &self,
        private: &StaticSecret,
        peer_public: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let peer: [u8; PUBLIC_KEY_SIZE] =
            peer_public
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: peer_public.len(),
                })?;

        let shared = private.diffie_hellman(&PublicKey::from(peer));
        // Low-order peer points force an all-zero secret.
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchangeFailed);
        }
        Ok(shared.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pairs_differ() {
        let kx = X25519;
        let a = kx.generate_key_pair();
        let b = kx.generate_key_pair();
        assert_eq!(kx.public_key(&a).len(), X25519::PUBLIC_KEY_LEN);
        assert_ne!(kx.public_key(&a), kx.public_key(&b));
    }

    #[test]
    fn test_shared_secret_agrees() {
        let kx = X25519;
        let a = kx.generate_key_pair();
        let b = kx.generate_key_pair();

        let ab = kx.shared_secret(&a, &kx.public_key(&b)).unwrap();
        let ba = kx.shared_secret(&b, &kx.public_key(&a)).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 32);
    }

    #[test]
    fn test_rfc7748_vector() {
        let alice: [u8; 32] =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap()
                .try_into()
                .unwrap();
        let alice = StaticSecret::from(alice);
        let bob_public =
            hex::decode("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f").unwrap();

        let kx = X25519;
        assert_eq!(
            hex::encode(kx.public_key(&alice)),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        assert_eq!(
            hex::encode(kx.shared_secret(&alice, &bob_public).unwrap()),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }

    #[test]
    fn test_rejects_bad_peer_keys() {
        let kx = X25519;
        let a = kx.generate_key_pair();
        assert_eq!(
            kx.shared_secret(&a, &[1u8; 31]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        );
        assert_eq!(
            kx.shared_secret(&a, &[0u8; 32]),
            Err(CryptoError::KeyExchangeFailed)
        );
    }
}
