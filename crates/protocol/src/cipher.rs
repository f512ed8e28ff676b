//! Directional AEAD state for the encrypted transport.
//!
//! Each direction of an established connection owns one [`CipherState`]: an
//! AES-256-GCM key and a 64-bit nonce counter. The 96-bit nonce is four zero
//! bytes followed by the big-endian counter, matching the Noise AESGCM
//! cipher functions so the states continue where the handshake left off.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Error, Result};
use crate::noise::Role;

/// Length of a transport key in bytes.
pub const CIPHER_KEY_LENGTH: usize = 32;

/// Authentication tag appended to every ciphertext.
pub const TAG_LENGTH: usize = 16;

/// An AES-256-GCM key plus a strictly increasing nonce counter.
pub struct CipherState {
    cipher: Aes256Gcm,
    nonce: u64,
}

impl CipherState {
    /// Creates a state from a raw key, starting at nonce 0.
    pub fn new(key: [u8; CIPHER_KEY_LENGTH]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            nonce: 0,
        }
    }

    /// Returns the nonce the next operation will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    fn next_nonce(&self) -> Result<[u8; 12]> {
        // u64::MAX is reserved, as in Noise
        if self.nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.nonce.to_be_bytes());
        Ok(nonce)
    }

    /// Encrypts with empty associated data. The counter advances only on success.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with_ad(&[], plaintext)
    }

    /// Encrypts with associated data.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|e| Error::Encryption(e.to_string()))?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    /// Decrypts with empty associated data. The counter advances only on success.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_with_ad(&[], ciphertext)
    }

    /// Decrypts with associated data.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LENGTH {
            return Err(Error::Decryption(format!(
                "ciphertext of {} bytes is shorter than the tag",
                ciphertext.len()
            )));
        }
        let nonce = self.next_nonce()?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| Error::Decryption("authentication tag mismatch".to_string()))?;
        self.nonce += 1;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// The two cipher states produced by a completed handshake.
///
/// The states are labelled by how the responder uses them: the responder
/// encrypts with `encrypt` and decrypts with `decrypt`. An initiator uses
/// them the other way round.
#[derive(Debug)]
pub struct CipherPair {
    /// Responder to initiator direction.
    pub encrypt: CipherState,
    /// Initiator to responder direction.
    pub decrypt: CipherState,
}

impl CipherPair {
    /// Builds the pair from the raw split keys `(k1, k2)`, where `k1` protects
    /// initiator to responder traffic.
    pub fn from_split(k1: [u8; CIPHER_KEY_LENGTH], k2: [u8; CIPHER_KEY_LENGTH]) -> Self {
        Self {
            encrypt: CipherState::new(k2),
            decrypt: CipherState::new(k1),
        }
    }

    /// Assigns the states to directions for the given role, returning
    /// `(inbound, outbound)`.
    pub fn into_directions(self, role: Role) -> (CipherState, CipherState) {
        match role {
            Role::Initiator => (self.encrypt, self.decrypt),
            Role::Responder => (self.decrypt, self.encrypt),
        }
    }
}
