//! Static key management for XXMP endpoints.
//!
//! This module provides X25519 static keypair generation, loading from raw
//! bytes, and short human-readable key fingerprints.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Length of an X25519 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of a key ID in bytes (SHA-256 output truncated to 16 bytes).
pub const KEY_ID_LENGTH: usize = 16;

/// A compact identifier derived from a public key.
///
/// Derived by hashing the public key with SHA-256 and keeping the first 16
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(#[serde(with = "serde_bytes")] pub [u8; KEY_ID_LENGTH]);

impl KeyId {
    /// Derives the ID of a raw public key.
    pub fn from_public_key(public_key: &[u8; KEY_LENGTH]) -> Self {
        let hash = Sha256::digest(public_key);
        let mut id = [0u8; KEY_ID_LENGTH];
        id.copy_from_slice(&hash[..KEY_ID_LENGTH]);
        Self(id)
    }

    /// Returns the raw bytes of this ID.
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LENGTH] {
        &self.0
    }

    /// Formats the ID as colon separated groups of 4 hex characters,
    /// for example `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        self.0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// A local X25519 static keypair.
///
/// Holds the secret half and should be kept confidential. The secret bytes
/// are handed to the Noise handshake as the local static key.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random keypair from the operating system RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restores a keypair from its 32 secret bytes.
    pub fn from_private_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restores a keypair from a slice, checking its length.
    pub fn from_private_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            Error::InvalidConfig(format!(
                "static key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self::from_private_bytes(bytes))
    }

    /// Returns the secret key bytes.
    pub fn private_bytes(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_bytes(&self) -> [u8; KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Returns the ID of the public key.
    pub fn key_id(&self) -> KeyId {
        KeyId::from_public_key(self.public.as_bytes())
    }

    /// Returns the fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.key_id().fingerprint()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Returns the fingerprint of a raw peer public key.
pub fn fingerprint(public_key: &[u8; KEY_LENGTH]) -> String {
    KeyId::from_public_key(public_key).fingerprint()
}
