use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;

/// Default client nonce lifetime.
pub const CLIENT_NONCE_LIFETIME: Duration = Duration::from_secs(300);

const NONCE_LEN: usize = 16;

/// Client nonce shared by WS-Security tokens and Digest `cnonce`.
#[derive(Debug, Clone)]
pub struct ClientNonce {
    pub bytes: Vec<u8>,
    pub base64: String,
    pub hex: String,
    pub created: Instant,
}

impl ClientNonce {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            base64: general_purpose::STANDARD.encode(&bytes),
            hex: hex::encode(&bytes),
            bytes,
            created: Instant::now(),
        }
    }

    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.created.elapsed() >= lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_nonces_differ() {
        let a = ClientNonce::generate();
        let b = ClientNonce::generate();
        assert_eq!(a.bytes.len(), NONCE_LEN);
        assert_ne!(a.bytes, b.bytes);
    }

    #[test]
    fn test_encodings() {
        let nonce = ClientNonce::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(nonce.hex, "deadbeef");
        assert_eq!(nonce.base64, "3q2+7w==");
    }

    #[test]
    fn test_expiry() {
        let nonce = ClientNonce::generate();
        assert!(!nonce.is_expired(CLIENT_NONCE_LIFETIME));
        assert!(nonce.is_expired(Duration::ZERO));
    }
}
