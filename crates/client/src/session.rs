//! Client sessions.
//!
//! A [`Session`] owns one connection from dial to close. It runs the Noise
//! handshake on the raw stream, installs the transport ciphers, and then
//! hands every inbound frame to a [`SessionHandler`] from a single read-loop
//! task. Outbound frames go through a shared [`FrameWriter`], which keeps
//! concurrent writers from interleaving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxmp_protocol::{
    install_cipher_pair, Dictionary, Error, FrameReader, FrameWriter, HandshakeConfig,
    HandshakeContext, Node, Result, Role, KEY_LENGTH,
};

use crate::transport::Dialer;

/// Write half of a session's stream, boxed so one session type serves every
/// transport.
type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// Running the Noise handshake.
    Handshaking,
    /// Handshake done, frames flowing.
    Connected,
    /// The connection broke or the handshake failed.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Callbacks from a running session.
///
/// Methods are called from the session's read-loop task, or from
/// [`Session::connect`] when connecting fails, and must not block.
pub trait SessionHandler: Send + Sync + 'static {
    /// One decrypted frame payload, in arrival order.
    fn on_data_received(&self, payload: Vec<u8>);

    /// The session ended, or the server could not be reached. Called at most
    /// once per session.
    fn on_disconnected(&self, reason: Option<&Error>);

    /// The handshake failed. Called at most once per session.
    fn on_handshake_failed(&self, error: &Error);
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server address as `host:port`.
    pub address: String,
    /// Optional `http://` proxy URL.
    pub proxy: Option<String>,
    /// Handshake inputs.
    pub handshake: HandshakeConfig,
    /// Dictionary used by [`Session::send_node`] and by handlers decoding
    /// inbound nodes.
    pub dictionary: Arc<Dictionary>,
}

impl SessionConfig {
    /// Creates a config with the built-in dictionary and no proxy.
    pub fn new(address: impl Into<String>, handshake: HandshakeConfig) -> Self {
        Self {
            address: address.into(),
            proxy: None,
            handshake,
            dictionary: Arc::new(Dictionary::builtin()),
        }
    }

    /// Sets the proxy URL.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets the dictionary.
    pub fn with_dictionary(mut self, dictionary: Dictionary) -> Self {
        self.dictionary = Arc::new(dictionary);
        self
    }
}

/// State shared between the session handle and its read loop.
struct Shared {
    state: RwLock<SessionState>,
    handler: Arc<dyn SessionHandler>,
    disconnected: AtomicBool,
}

impl Shared {
    async fn set_state(&self, state: SessionState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!(from = %*current, to = %state, "Session state changed");
            *current = state;
        }
    }

    /// Fires `on_disconnected` unless it already fired.
    fn notify_disconnected(&self, reason: Option<&Error>) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.handler.on_disconnected(reason);
        }
    }
}

/// An established client session.
pub struct Session {
    shared: Arc<Shared>,
    writer: Arc<FrameWriter<BoxedWrite>>,
    dictionary: Arc<Dictionary>,
    shutdown_token: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
    peer_static: [u8; KEY_LENGTH],
    peer_payload: Vec<u8>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &xxmp_protocol::crypto::fingerprint(&self.peer_static))
            .field("dictionary_version", &self.dictionary.version())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Dials the configured server and establishes a session over it.
    ///
    /// The proxy URL is validated before any connection attempt and a bad
    /// value is returned without notifying the handler. A failed dial is
    /// reported through [`SessionHandler::on_disconnected`].
    pub async fn connect(config: SessionConfig, handler: Arc<dyn SessionHandler>) -> Result<Self> {
        let dialer = Dialer::new(config.address.clone(), config.proxy.as_deref())?;
        info!(address = %dialer.address(), "Connecting");
        let stream = match dialer.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(address = %dialer.address(), error = %e, "Connection failed");
                handler.on_disconnected(Some(&e));
                return Err(e);
            }
        };
        Self::establish(stream, config, handler).await
    }

    /// Runs the handshake over an already-connected stream and starts the
    /// read loop.
    pub async fn establish<S>(
        stream: S,
        config: SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: RwLock::new(SessionState::Connecting),
            handler,
            disconnected: AtomicBool::new(false),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::new(read_half);
        let writer: FrameWriter<BoxedWrite> = FrameWriter::new(Box::new(write_half));

        shared.set_state(SessionState::Handshaking).await;
        let mut context = HandshakeContext::new(config.handshake);
        let outcome = match context.run(&reader, &writer).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = writer.shutdown().await;
                shared.set_state(SessionState::Failed).await;
                shared.handler.on_handshake_failed(&e);
                return Err(e);
            }
        };

        if let Err(e) =
            install_cipher_pair(&reader, &writer, outcome.ciphers, Role::Initiator).await
        {
            let _ = writer.shutdown().await;
            shared.set_state(SessionState::Failed).await;
            shared.handler.on_handshake_failed(&e);
            return Err(e);
        }
        shared.set_state(SessionState::Connected).await;

        let writer = Arc::new(writer);
        let shutdown_token = CancellationToken::new();
        let read_task = tokio::spawn(run_read_loop(
            reader,
            writer.clone(),
            shared.clone(),
            shutdown_token.clone(),
        ));

        Ok(Self {
            shared,
            writer,
            dictionary: config.dictionary,
            shutdown_token,
            read_task: Mutex::new(Some(read_task)),
            peer_static: outcome.peer_static,
            peer_payload: outcome.peer_payload,
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    /// The server's static public key.
    pub fn peer_static(&self) -> &[u8; KEY_LENGTH] {
        &self.peer_static
    }

    /// The payload the server sent during the handshake.
    pub fn peer_payload(&self) -> &[u8] {
        &self.peer_payload
    }

    /// The session's dictionary.
    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Sends one application frame.
    pub async fn write_application_payload(&self, payload: &[u8]) -> Result<()> {
        let state = self.state().await;
        if state != SessionState::Connected {
            return Err(Error::ConnectionClosed(format!("session is {}", state)));
        }
        self.writer.write_frame(payload).await
    }

    /// Marshals a node with the session's dictionary and sends it.
    pub async fn send_node(&self, node: &Node) -> Result<()> {
        let bytes = node.marshal(&self.dictionary)?;
        self.write_application_payload(&bytes).await
    }

    /// Closes the session.
    ///
    /// Stops the read loop and waits for it to exit, then shuts the stream
    /// down. Safe to call more than once and from several tasks.
    pub async fn close(&self) -> Result<()> {
        let mut read_task = self.read_task.lock().await;
        let Some(handle) = read_task.take() else {
            return Ok(());
        };

        self.shutdown_token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Read loop task panicked");
        }
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Stream shutdown failed");
        }

        {
            let mut state = self.shared.state.write().await;
            if *state == SessionState::Connected {
                debug!(from = %*state, to = %SessionState::Disconnected, "Session state changed");
                *state = SessionState::Disconnected;
            }
        }
        self.shared.notify_disconnected(None);
        info!("Session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

/// Reads frames until the stream ends, an error occurs, or the session is
/// closed. On error the stream is shut down before the handler hears of it.
async fn run_read_loop<S>(
    reader: FrameReader<ReadHalf<S>>,
    writer: Arc<FrameWriter<BoxedWrite>>,
    shared: Arc<Shared>,
    shutdown_token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!("Read loop started");
    let exit = loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break None,
            frame = reader.read_frame() => match frame {
                Ok(payload) => shared.handler.on_data_received(payload),
                Err(e) => break Some(e),
            },
        }
    };

    match exit {
        None => debug!("Read loop stopped"),
        Some(e) => {
            warn!(error = %e, kind = ?e.kind(), "Read loop ended");
            if let Err(shutdown_err) = writer.shutdown().await {
                debug!(error = %shutdown_err, "Stream shutdown failed");
            }
            shared.set_state(SessionState::Failed).await;
            shared.notify_disconnected(Some(&e));
        }
    }
}
