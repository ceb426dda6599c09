//! Session key derivation and sealed framing for established connections.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// blake3 `derive_key` contexts. Changing either breaks wire compatibility.
const INITIATOR_KEY_CONTEXT: &str = "destra transport v1 2024 initiator to responder";
const RESPONDER_KEY_CONTEXT: &str = "destra transport v1 2024 responder to initiator";

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("frame authentication failed")]
    Decrypt,
    #[error("frame encryption failed")]
    Encrypt,
    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// Directional session keys for one side of a connection.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    send: [u8; 32],
    recv: [u8; 32],
}

impl SessionKeys {
    /// Derive both directions from the X25519 shared secret and the handshake transcript hash.
    pub fn derive(shared_secret: &[u8], transcript: &[u8; 32], is_initiator: bool) -> Self {
        let mut material = Vec::with_capacity(shared_secret.len() + transcript.len());
        material.extend_from_slice(shared_secret);
        material.extend_from_slice(transcript);

        let i2r = blake3::derive_key(INITIATOR_KEY_CONTEXT, &material);
        let r2i = blake3::derive_key(RESPONDER_KEY_CONTEXT, &material);
        material.zeroize();

        if is_initiator {
            Self { send: i2r, recv: r2i }
        } else {
            Self { send: r2i, recv: i2r }
        }
    }

    pub fn split(&self) -> (FrameSealer, FrameOpener) {
        (FrameSealer::new(&self.send), FrameOpener::new(&self.recv))
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Outbound half: seals frames with a monotonically increasing nonce.
pub struct FrameSealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl FrameSealer {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = nonce_for(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        self.counter += 1;
        Ok(ciphertext)
    }
}

/// Inbound half: frames must arrive in order, a gap or replay fails authentication.
pub struct FrameOpener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl FrameOpener {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = nonce_for(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        self.counter += 1;
        Ok(plaintext)
    }
}
