//! Noise XX handshake state.
//!
//! This module wraps a `snow` handshake for the XX pattern with Curve25519,
//! AES-256-GCM and SHA-256, tracks whose turn it is, and splits the finished
//! transcript into a [`CipherPair`].
//!
//! ## Noise XX Pattern
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```

use snow::{Builder, HandshakeState};

use crate::cipher::{CipherPair, TAG_LENGTH};
use crate::crypto::{KeyPair, KEY_LENGTH};
use crate::error::{Error, Result};

/// The Noise protocol name.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_AESGCM_SHA256";

/// Maximum size of a single Noise message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Length of a public DH key on the wire.
pub const DH_LENGTH: usize = KEY_LENGTH;

/// Length of an encrypted static key on the wire.
pub const ENCRYPTED_STATIC_LENGTH: usize = DH_LENGTH + TAG_LENGTH;

/// Largest payload the initiator can put in its final message.
pub const MAX_FINISH_PAYLOAD: usize = MAX_NOISE_MESSAGE_SIZE - ENCRYPTED_STATIC_LENGTH - TAG_LENGTH;

/// Largest payload the responder can put in its reply.
pub const MAX_REPLY_PAYLOAD: usize =
    MAX_NOISE_MESSAGE_SIZE - DH_LENGTH - ENCRYPTED_STATIC_LENGTH - TAG_LENGTH;

/// Position in the three message exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: ready to send first message (-> e)
    InitiatorStart,
    /// Initiator: waiting for response (<- e, ee, s, es)
    InitiatorWaitingForResponse,
    /// Initiator: ready to send final message (-> s, se)
    InitiatorSendFinal,
    /// Responder: waiting for first message (-> e)
    ResponderStart,
    /// Responder: ready to send response (<- e, ee, s, es)
    ResponderSendResponse,
    /// Responder: waiting for final message (-> s, se)
    ResponderWaitingForFinal,
    /// All three messages processed
    Complete,
}

/// Role in the Noise handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (client)
    Initiator,
    /// Responds to the handshake (server)
    Responder,
}

/// A Noise XX handshake in progress.
pub struct NoiseHandshake {
    state: HandshakeState,
    phase: HandshakePhase,
    role: Role,
    buffer: Vec<u8>,
}

impl NoiseHandshake {
    /// Starts a handshake as initiator.
    pub fn new_initiator(
        keypair: &KeyPair,
        prologue: &[u8],
        fixed_ephemeral: Option<&[u8; KEY_LENGTH]>,
    ) -> Result<Self> {
        Self::build(Role::Initiator, keypair, prologue, fixed_ephemeral)
    }

    /// Starts a handshake as responder.
    pub fn new_responder(
        keypair: &KeyPair,
        prologue: &[u8],
        fixed_ephemeral: Option<&[u8; KEY_LENGTH]>,
    ) -> Result<Self> {
        Self::build(Role::Responder, keypair, prologue, fixed_ephemeral)
    }

    fn build(
        role: Role,
        keypair: &KeyPair,
        prologue: &[u8],
        fixed_ephemeral: Option<&[u8; KEY_LENGTH]>,
    ) -> Result<Self> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e| Error::Handshake(format!("invalid noise pattern: {}", e)))?;
        let private = keypair.private_bytes();

        let mut builder = Builder::new(params)
            .local_private_key(&private)
            .prologue(prologue);
        if let Some(ephemeral) = fixed_ephemeral {
            builder = builder.fixed_ephemeral_key_for_testing_only(ephemeral);
        }

        let (state, phase) = match role {
            Role::Initiator => (builder.build_initiator()?, HandshakePhase::InitiatorStart),
            Role::Responder => (builder.build_responder()?, HandshakePhase::ResponderStart),
        };

        Ok(Self {
            state,
            phase,
            role,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        })
    }

    /// Returns the current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether all three messages have been processed.
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Produces the next outgoing handshake message carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Initiator, HandshakePhase::InitiatorSendFinal) => HandshakePhase::Complete,
            (Role::Responder, HandshakePhase::ResponderSendResponse) => {
                HandshakePhase::ResponderWaitingForFinal
            }
            _ => {
                return Err(Error::Handshake(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )))
            }
        };

        let len = self.state.write_message(payload, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Consumes an incoming handshake message, returning its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::InitiatorSendFinal
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            (Role::Responder, HandshakePhase::ResponderWaitingForFinal) => {
                HandshakePhase::Complete
            }
            _ => {
                return Err(Error::Handshake(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )))
            }
        };

        let len = self.state.read_message(message, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Returns the peer's static public key once it has been received.
    pub fn remote_static(&self) -> Option<[u8; KEY_LENGTH]> {
        let remote = self.state.get_remote_static()?;
        remote.try_into().ok()
    }

    /// Splits the finished transcript into the transport cipher states.
    pub fn split(mut self) -> Result<CipherPair> {
        if !self.is_complete() {
            return Err(Error::Handshake(format!(
                "cannot split in phase {:?}",
                self.phase
            )));
        }
        let (k1, k2) = self.state.dangerously_get_raw_split();
        Ok(CipherPair::from_split(k1, k2))
    }
}

impl std::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("has_remote_static", &self.state.get_remote_static().is_some())
            .finish()
    }
}
