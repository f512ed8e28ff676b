//! The connection handshake: preamble, header and Noise XX records.
//!
//! A client opens a connection by writing, unframed:
//! - optionally the routing preamble `ED 00 01` + 3 byte length + routing bytes,
//! - the 4 byte header `WA` + major + minor, which is also the Noise prologue.
//!
//! The three Noise messages then travel as plaintext frames, each one a
//! MessagePack encoded [`HandshakeMessage`]. After the final message both
//! sides split the transcript into a [`CipherPair`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::cipher::{CipherPair, TAG_LENGTH};
use crate::crypto::{fingerprint, KeyPair, KEY_LENGTH};
use crate::error::{Error, Result};
use crate::framing::{FrameReader, FrameWriter};
use crate::noise::{
    NoiseHandshake, DH_LENGTH, ENCRYPTED_STATIC_LENGTH, MAX_FINISH_PAYLOAD, MAX_REPLY_PAYLOAD,
};

/// Magic bytes opening the header.
pub const HEADER_MAGIC: [u8; 2] = *b"WA";

/// Marker opening the optional routing preamble.
pub const ROUTING_MARKER: [u8; 4] = *b"ED\x00\x01";

/// Largest routing info the 3 byte length can describe.
pub const MAX_ROUTING_INFO: usize = 0xFF_FFFF;

/// Default protocol version written in the header.
pub const DEFAULT_VERSION_MAJOR: u8 = 6;

/// Default protocol minor version.
pub const DEFAULT_VERSION_MINOR: u8 = 3;

/// First handshake record, initiator to responder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Initiator ephemeral public key.
    #[serde(with = "serde_bytes")]
    pub ephemeral: Vec<u8>,
    /// Unused in XX, kept for wire compatibility.
    #[serde(
        rename = "static",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub static_key: Option<Vec<u8>>,
    /// Unencrypted early payload, unused by this client.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub payload: Option<Vec<u8>>,
}

/// Second handshake record, responder to initiator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Responder ephemeral public key.
    #[serde(with = "serde_bytes")]
    pub ephemeral: Vec<u8>,
    /// Encrypted responder static key.
    #[serde(rename = "static", with = "serde_bytes")]
    pub static_key: Vec<u8>,
    /// Encrypted responder payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Third handshake record, initiator to responder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFinish {
    /// Encrypted initiator static key.
    #[serde(rename = "static", with = "serde_bytes")]
    pub static_key: Vec<u8>,
    /// Encrypted authentication payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Envelope carrying exactly one handshake record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Set in the first message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_hello: Option<ClientHello>,
    /// Set in the second message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_hello: Option<ServerHello>,
    /// Set in the third message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_finish: Option<ClientFinish>,
}

impl HandshakeMessage {
    /// Serializes to MessagePack with named fields.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl ClientHello {
    fn from_noise(message: &[u8]) -> Result<Self> {
        let (ephemeral, payload) = split_field(message, DH_LENGTH, "ephemeral")?;
        Ok(Self {
            ephemeral: ephemeral.to_vec(),
            static_key: None,
            payload: (!payload.is_empty()).then(|| payload.to_vec()),
        })
    }

    fn to_noise(&self) -> Result<Vec<u8>> {
        check_len(&self.ephemeral, DH_LENGTH, "ephemeral")?;
        let mut message = self.ephemeral.clone();
        if let Some(payload) = &self.payload {
            message.extend_from_slice(payload);
        }
        Ok(message)
    }
}

impl ServerHello {
    fn from_noise(message: &[u8]) -> Result<Self> {
        let (ephemeral, rest) = split_field(message, DH_LENGTH, "ephemeral")?;
        let (static_key, payload) = split_field(rest, ENCRYPTED_STATIC_LENGTH, "static")?;
        Ok(Self {
            ephemeral: ephemeral.to_vec(),
            static_key: static_key.to_vec(),
            payload: payload.to_vec(),
        })
    }

    fn to_noise(&self) -> Result<Vec<u8>> {
        check_len(&self.ephemeral, DH_LENGTH, "ephemeral")?;
        check_len(&self.static_key, ENCRYPTED_STATIC_LENGTH, "static")?;
        check_min_len(&self.payload, TAG_LENGTH, "payload")?;
        Ok([
            self.ephemeral.as_slice(),
            self.static_key.as_slice(),
            self.payload.as_slice(),
        ]
        .concat())
    }
}

impl ClientFinish {
    fn from_noise(message: &[u8]) -> Result<Self> {
        let (static_key, payload) = split_field(message, ENCRYPTED_STATIC_LENGTH, "static")?;
        Ok(Self {
            static_key: static_key.to_vec(),
            payload: payload.to_vec(),
        })
    }

    fn to_noise(&self) -> Result<Vec<u8>> {
        check_len(&self.static_key, ENCRYPTED_STATIC_LENGTH, "static")?;
        check_min_len(&self.payload, TAG_LENGTH, "payload")?;
        Ok([self.static_key.as_slice(), self.payload.as_slice()].concat())
    }
}

fn split_field<'a>(message: &'a [u8], len: usize, field: &str) -> Result<(&'a [u8], &'a [u8])> {
    if message.len() < len {
        return Err(Error::MalformedHandshake(format!(
            "{} needs {} bytes, message has {}",
            field,
            len,
            message.len()
        )));
    }
    Ok(message.split_at(len))
}

fn check_len(value: &[u8], len: usize, field: &str) -> Result<()> {
    if value.len() != len {
        return Err(Error::MalformedHandshake(format!(
            "{} must be {} bytes, got {}",
            field,
            len,
            value.len()
        )));
    }
    Ok(())
}

fn check_min_len(value: &[u8], len: usize, field: &str) -> Result<()> {
    if value.len() < len {
        return Err(Error::MalformedHandshake(format!(
            "{} must be at least {} bytes, got {}",
            field,
            len,
            value.len()
        )));
    }
    Ok(())
}

/// Decides whether a peer's static key and payload are acceptable.
pub trait PeerVerifier: Send + Sync {
    /// Returns an error to reject the peer.
    fn verify(&self, peer_static: &[u8; KEY_LENGTH], payload: &[u8]) -> Result<()>;
}

impl<F> PeerVerifier for F
where
    F: Fn(&[u8; KEY_LENGTH], &[u8]) -> Result<()> + Send + Sync,
{
    fn verify(&self, peer_static: &[u8; KEY_LENGTH], payload: &[u8]) -> Result<()> {
        self(peer_static, payload)
    }
}

fn run_verifier(
    verifier: Option<&Arc<dyn PeerVerifier>>,
    peer_static: &[u8; KEY_LENGTH],
    payload: &[u8],
) -> Result<()> {
    let Some(verifier) = verifier else {
        return Ok(());
    };
    verifier.verify(peer_static, payload).map_err(|err| match err {
        Error::PeerRejected(_) => err,
        other => Error::PeerRejected(other.to_string()),
    })
}

/// Builds the 4 byte header, which doubles as the Noise prologue.
pub fn header(version_major: u8, version_minor: u8) -> [u8; 4] {
    [HEADER_MAGIC[0], HEADER_MAGIC[1], version_major, version_minor]
}

/// Builds the routing preamble for `routing_info`.
pub fn routing_preamble(routing_info: &[u8]) -> Result<Vec<u8>> {
    if routing_info.len() > MAX_ROUTING_INFO {
        return Err(Error::InvalidRoutingInfo(format!(
            "{} bytes exceeds maximum of {} bytes",
            routing_info.len(),
            MAX_ROUTING_INFO
        )));
    }
    let len = routing_info.len();
    let mut out = Vec::with_capacity(ROUTING_MARKER.len() + 3 + len);
    out.extend_from_slice(&ROUTING_MARKER);
    out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    out.extend_from_slice(routing_info);
    Ok(out)
}

/// Inputs of a client handshake.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Header major version.
    pub version_major: u8,
    /// Header minor version.
    pub version_minor: u8,
    /// Local static keypair.
    pub static_key: Option<KeyPair>,
    /// Routing info sent ahead of the header, if any.
    pub routing_info: Option<Vec<u8>>,
    /// Authentication payload carried in the final message.
    pub payload: Vec<u8>,
    /// Called with the server's static key and payload.
    pub verifier: Option<Arc<dyn PeerVerifier>>,
    #[doc(hidden)]
    pub fixed_ephemeral: Option<[u8; KEY_LENGTH]>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            version_major: DEFAULT_VERSION_MAJOR,
            version_minor: DEFAULT_VERSION_MINOR,
            static_key: None,
            routing_info: None,
            payload: Vec::new(),
            verifier: None,
            fixed_ephemeral: None,
        }
    }
}

impl std::fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("version", &(self.version_major, self.version_minor))
            .field("static_key", &self.static_key)
            .field("routing_info_len", &self.routing_info.as_ref().map(Vec::len))
            .field("payload_len", &self.payload.len())
            .field("has_verifier", &self.verifier.is_some())
            .finish()
    }
}

impl HandshakeConfig {
    /// Checks every precondition that can be checked without I/O.
    pub fn validate(&self) -> Result<()> {
        if self.static_key.is_none() {
            return Err(Error::MissingStaticKey);
        }
        if self.payload.is_empty() {
            return Err(Error::MissingPayload);
        }
        if self.payload.len() > MAX_FINISH_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_FINISH_PAYLOAD,
            });
        }
        if let Some(routing_info) = &self.routing_info {
            if routing_info.len() > MAX_ROUTING_INFO {
                return Err(Error::InvalidRoutingInfo(format!(
                    "{} bytes exceeds maximum of {} bytes",
                    routing_info.len(),
                    MAX_ROUTING_INFO
                )));
            }
        }
        Ok(())
    }

    /// Returns the header for the configured version.
    pub fn header(&self) -> [u8; 4] {
        header(self.version_major, self.version_minor)
    }

    /// Returns the unframed bytes written before the first record.
    pub fn preamble(&self) -> Result<Vec<u8>> {
        let mut out = match &self.routing_info {
            Some(routing_info) => routing_preamble(routing_info)?,
            None => Vec::new(),
        };
        out.extend_from_slice(&self.header());
        Ok(out)
    }
}

/// Client handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Nothing sent yet.
    Init,
    /// Preamble and ClientHello written.
    SentHello,
    /// ServerHello read and verified.
    ReceivedHello,
    /// ClientFinish written.
    SentFinish,
    /// Cipher states produced.
    Established,
    /// Aborted; the context cannot be reused.
    Failed,
}

/// What a successful handshake hands back.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Transport cipher states.
    pub ciphers: CipherPair,
    /// The peer's static public key.
    pub peer_static: [u8; KEY_LENGTH],
    /// The peer's decrypted payload.
    pub peer_payload: Vec<u8>,
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct HandshakeContext {
    config: HandshakeConfig,
    phase: ClientPhase,
}

impl HandshakeContext {
    /// Creates a context in [`ClientPhase::Init`].
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            phase: ClientPhase::Init,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Runs the handshake to completion over a framed connection.
    ///
    /// Preconditions are checked before anything is written. On failure the
    /// context moves to [`ClientPhase::Failed`] and no cipher state exists.
    pub async fn run<R, W>(
        &mut self,
        reader: &FrameReader<R>,
        writer: &FrameWriter<W>,
    ) -> Result<HandshakeOutcome>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if self.phase != ClientPhase::Init {
            return Err(Error::Handshake(format!(
                "handshake already run, phase {:?}",
                self.phase
            )));
        }
        if let Err(err) = self.config.validate() {
            warn!(error = %err, "handshake config rejected");
            self.phase = ClientPhase::Failed;
            return Err(err);
        }

        match self.drive(reader, writer).await {
            Ok(outcome) => {
                self.phase = ClientPhase::Established;
                info!(
                    peer = %fingerprint(&outcome.peer_static),
                    "handshake established"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(phase = ?self.phase, error = %err, "handshake failed");
                self.phase = ClientPhase::Failed;
                Err(err)
            }
        }
    }

    async fn drive<R, W>(
        &mut self,
        reader: &FrameReader<R>,
        writer: &FrameWriter<W>,
    ) -> Result<HandshakeOutcome>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let keypair = self.config.static_key.as_ref().ok_or(Error::MissingStaticKey)?;
        let header = self.config.header();
        let mut noise =
            NoiseHandshake::new_initiator(keypair, &header, self.config.fixed_ephemeral.as_ref())?;

        writer.write_preamble(&self.config.preamble()?).await?;

        let hello = ClientHello::from_noise(&noise.write_message(&[])?)?;
        let message = HandshakeMessage {
            client_hello: Some(hello),
            ..Default::default()
        };
        writer.write_frame(&message.to_msgpack()?).await?;
        self.phase = ClientPhase::SentHello;
        debug!(phase = ?self.phase, "handshake phase");

        let reply = HandshakeMessage::from_msgpack(&reader.read_frame().await?)?;
        let server_hello = reply
            .server_hello
            .ok_or_else(|| Error::MalformedHandshake("expected server hello".to_string()))?;
        let peer_payload = noise.read_message(&server_hello.to_noise()?)?;
        let peer_static = noise
            .remote_static()
            .ok_or_else(|| Error::Handshake("server sent no static key".to_string()))?;
        run_verifier(self.config.verifier.as_ref(), &peer_static, &peer_payload)?;
        self.phase = ClientPhase::ReceivedHello;
        debug!(phase = ?self.phase, "handshake phase");

        let finish = ClientFinish::from_noise(&noise.write_message(&self.config.payload)?)?;
        let message = HandshakeMessage {
            client_finish: Some(finish),
            ..Default::default()
        };
        writer.write_frame(&message.to_msgpack()?).await?;
        self.phase = ClientPhase::SentFinish;
        debug!(phase = ?self.phase, "handshake phase");

        Ok(HandshakeOutcome {
            ciphers: noise.split()?,
            peer_static,
            peer_payload,
        })
    }
}

/// Inputs of the responder side.
#[derive(Clone)]
pub struct ResponderConfig {
    /// Local static keypair.
    pub static_key: KeyPair,
    /// Payload carried in the ServerHello.
    pub payload: Vec<u8>,
    /// Called with the client's static key and payload.
    pub verifier: Option<Arc<dyn PeerVerifier>>,
    #[doc(hidden)]
    pub fixed_ephemeral: Option<[u8; KEY_LENGTH]>,
}

impl ResponderConfig {
    /// Creates a responder config answering with `payload`.
    pub fn new(static_key: KeyPair, payload: Vec<u8>) -> Self {
        Self {
            static_key,
            payload,
            verifier: None,
            fixed_ephemeral: None,
        }
    }
}

/// What the responder learns from a successful handshake.
#[derive(Debug)]
pub struct ResponderOutcome {
    /// Transport cipher states.
    pub ciphers: CipherPair,
    /// The client's static public key.
    pub peer_static: [u8; KEY_LENGTH],
    /// The client's authentication payload.
    pub peer_payload: Vec<u8>,
    /// Routing info from the preamble, if one was sent.
    pub routing_info: Option<Vec<u8>>,
    /// Version from the client header.
    pub version: (u8, u8),
}

/// Runs the responder side of the handshake over a framed connection.
pub async fn respond<R, W>(
    config: &ResponderConfig,
    reader: &FrameReader<R>,
    writer: &FrameWriter<W>,
) -> Result<ResponderOutcome>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    if config.payload.len() > MAX_REPLY_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            size: config.payload.len(),
            max: MAX_REPLY_PAYLOAD,
        });
    }

    let mut head = reader.read_raw(4).await?;
    let mut routing_info = None;
    if head[..] == ROUTING_MARKER {
        let len = reader.read_raw(3).await?;
        let len = ((len[0] as usize) << 16) | ((len[1] as usize) << 8) | len[2] as usize;
        routing_info = Some(reader.read_raw(len).await?);
        head = reader.read_raw(4).await?;
    }
    if head[..2] != HEADER_MAGIC {
        return Err(Error::MalformedHandshake(format!(
            "bad header magic {:02x}{:02x}",
            head[0], head[1]
        )));
    }
    let version = (head[2], head[3]);
    debug!(?version, routed = routing_info.is_some(), "client header received");

    let mut noise =
        NoiseHandshake::new_responder(&config.static_key, &head, config.fixed_ephemeral.as_ref())?;

    let first = HandshakeMessage::from_msgpack(&reader.read_frame().await?)?;
    let hello = first
        .client_hello
        .ok_or_else(|| Error::MalformedHandshake("expected client hello".to_string()))?;
    noise.read_message(&hello.to_noise()?)?;

    let server_hello = ServerHello::from_noise(&noise.write_message(&config.payload)?)?;
    let reply = HandshakeMessage {
        server_hello: Some(server_hello),
        ..Default::default()
    };
    writer.write_frame(&reply.to_msgpack()?).await?;

    let last = HandshakeMessage::from_msgpack(&reader.read_frame().await?)?;
    let finish = last
        .client_finish
        .ok_or_else(|| Error::MalformedHandshake("expected client finish".to_string()))?;
    let peer_payload = noise.read_message(&finish.to_noise()?)?;
    let peer_static = noise
        .remote_static()
        .ok_or_else(|| Error::Handshake("client sent no static key".to_string()))?;
    run_verifier(config.verifier.as_ref(), &peer_static, &peer_payload)?;

    info!(peer = %fingerprint(&peer_static), "handshake accepted");
    Ok(ResponderOutcome {
        ciphers: noise.split()?,
        peer_static,
        peer_payload,
        routing_info,
        version,
    })
}
