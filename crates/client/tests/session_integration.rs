//! Session tests against a loopback mock server.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use xxmp_client::{Session, SessionConfig, SessionHandler, SessionState};
use xxmp_protocol::{
    install_cipher_pair, respond, Dictionary, Error, ErrorKind, FrameReader, FrameWriter,
    HandshakeConfig, KeyPair, Node, PeerVerifier, ResponderConfig, Role, KEY_LENGTH,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Data(Vec<u8>),
    Disconnected(Option<ErrorKind>),
    HandshakeFailed(ErrorKind),
}

struct ChannelHandler {
    events: mpsc::UnboundedSender<Event>,
}

impl SessionHandler for ChannelHandler {
    fn on_data_received(&self, payload: Vec<u8>) {
        let _ = self.events.send(Event::Data(payload));
    }

    fn on_disconnected(&self, reason: Option<&Error>) {
        let _ = self.events.send(Event::Disconnected(reason.map(Error::kind)));
    }

    fn on_handshake_failed(&self, error: &Error) {
        let _ = self.events.send(Event::HandshakeFailed(error.kind()));
    }
}

fn handler() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<Event>) {
    let (events, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler { events }), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("handler dropped")
}

#[derive(Clone, Copy)]
enum ServerMode {
    /// Send a greeting, then echo every frame until the client leaves.
    Echo,
    /// Send a greeting, then hang up.
    HangUp,
}

/// Accepts one connection, completes the handshake and serves it.
async fn spawn_server(mode: ServerMode) -> (String, tokio::task::JoinHandle<Option<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let reader = FrameReader::new(read);
        let writer = FrameWriter::new(write);

        let config = ResponderConfig::new(KeyPair::from_private_bytes([0x33; 32]), b"cert".to_vec());
        let outcome = respond(&config, &reader, &writer).await.ok()?;
        install_cipher_pair(&reader, &writer, outcome.ciphers, Role::Responder)
            .await
            .unwrap();

        writer.write_frame(b"greeting").await.unwrap();
        if let ServerMode::Echo = mode {
            while let Ok(frame) = reader.read_frame().await {
                writer.write_frame(&frame).await.unwrap();
            }
        }
        Some(outcome.peer_payload)
    });

    (address, task)
}

/// Completes the handshake but only keys the inbound direction, then sends
/// one plaintext frame the client cannot authenticate. Returns whether the
/// client hung up afterwards.
async fn spawn_unkeyed_server() -> (String, tokio::task::JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let reader = FrameReader::new(read);
        let writer = FrameWriter::new(write);

        let config = ResponderConfig::new(KeyPair::generate(), b"cert".to_vec());
        let outcome = respond(&config, &reader, &writer).await.unwrap();
        let (inbound, _outbound) = outcome.ciphers.into_directions(Role::Responder);
        reader.install(inbound).await.unwrap();

        writer.write_frame(&[0xAB; 40]).await.unwrap();
        matches!(timeout(WAIT, reader.read_frame()).await, Ok(Err(_)))
    });

    (address, task)
}

fn session_config(address: String) -> SessionConfig {
    SessionConfig::new(
        address,
        HandshakeConfig {
            static_key: Some(KeyPair::generate()),
            payload: b"login".to_vec(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_connect_echo_and_close() {
    let (address, server) = spawn_server(ServerMode::Echo).await;
    let (handler, mut events) = handler();

    let session = Session::connect(session_config(address), handler).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(session.peer_payload(), b"cert");
    assert_eq!(
        session.peer_static(),
        &KeyPair::from_private_bytes([0x33; 32]).public_bytes()
    );
    assert_eq!(next_event(&mut events).await, Event::Data(b"greeting".to_vec()));

    for i in 0..5u8 {
        session.write_application_payload(&[i; 100]).await.unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(next_event(&mut events).await, Event::Data(vec![i; 100]));
    }

    session.close().await.unwrap();
    assert_eq!(session.state().await, SessionState::Disconnected);
    assert_eq!(next_event(&mut events).await, Event::Disconnected(None));

    assert_eq!(server.await.unwrap(), Some(b"login".to_vec()));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_send_node_arrives_marshalled() {
    let (address, _server) = spawn_server(ServerMode::Echo).await;
    let (handler, mut events) = handler();
    let session = Session::connect(session_config(address), handler).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(b"greeting".to_vec()));

    let node = Node::new("iq")
        .with_attr("id", "1")
        .with_attr("type", "get")
        .with_children(vec![Node::new("ping")]);
    session.send_node(&node).await.unwrap();

    let Event::Data(echoed) = next_event(&mut events).await else {
        panic!("expected data");
    };
    assert_eq!(Node::unmarshal(&echoed, session.dictionary()).unwrap(), node);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_server_hangup_fails_session_once() {
    let (address, server) = spawn_server(ServerMode::HangUp).await;
    let (handler, mut events) = handler();
    let session = Session::connect(session_config(address), handler).await.unwrap();

    assert_eq!(next_event(&mut events).await, Event::Data(b"greeting".to_vec()));
    server.await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(Some(ErrorKind::Io))
    );
    assert_eq!(session.state().await, SessionState::Failed);

    // Closing afterwards keeps the failure and does not report again.
    session.close().await.unwrap();
    assert_eq!(session.state().await, SessionState::Failed);
    assert!(events.try_recv().is_err());

    let err = session.write_application_payload(b"late").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_concurrent_close_reports_once() {
    let (address, _server) = spawn_server(ServerMode::Echo).await;
    let (handler, mut events) = handler();
    let session = Arc::new(Session::connect(session_config(address), handler).await.unwrap());
    assert_eq!(next_event(&mut events).await, Event::Data(b"greeting".to_vec()));

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap().unwrap();
    }

    assert_eq!(next_event(&mut events).await, Event::Disconnected(None));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_rejected_server_reports_handshake_failure() {
    let (address, server) = spawn_server(ServerMode::Echo).await;
    let (handler, mut events) = handler();

    let reject: Arc<dyn PeerVerifier> =
        Arc::new(|_key: &[u8; KEY_LENGTH], _payload: &[u8]| -> xxmp_protocol::Result<()> {
            Err(Error::PeerRejected("unknown server".to_string()))
        });
    let mut config = session_config(address);
    config.handshake.verifier = Some(reject);

    let err = Session::connect(config, handler).await.unwrap_err();
    assert!(matches!(err, Error::PeerRejected(_)));
    assert_eq!(
        next_event(&mut events).await,
        Event::HandshakeFailed(ErrorKind::Crypto)
    );
    assert!(events.try_recv().is_err());

    // The server never sees a ClientFinish.
    assert_eq!(server.await.unwrap(), None);
}

#[tokio::test]
async fn test_invalid_proxy_fails_before_dialing() {
    let (handler, mut events) = handler();
    let config = session_config("127.0.0.1:1".to_string()).with_proxy("socks5://127.0.0.1:1080");

    let err = Session::connect(config, handler).await.unwrap_err();
    assert!(matches!(err, Error::InvalidProxy(_)));
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_custom_dictionary_is_used() {
    let (address, _server) = spawn_server(ServerMode::Echo).await;
    let (handler, mut events) = handler();
    let dictionary = Dictionary::from_tables(xxmp_protocol::DictionaryTables {
        version: 9,
        primary: vec![String::new(), "custom".to_string()],
        secondary: Vec::new(),
    })
    .unwrap();

    let config = session_config(address).with_dictionary(dictionary);
    let session = Session::connect(config, handler).await.unwrap();
    assert_eq!(session.dictionary().version(), 9);
    assert_eq!(next_event(&mut events).await, Event::Data(b"greeting".to_vec()));

    session.send_node(&Node::new("custom")).await.unwrap();
    let Event::Data(echoed) = next_event(&mut events).await else {
        panic!("expected data");
    };
    // flag, short list of one item, primary index 1
    assert_eq!(echoed, vec![0x00, 0xF8, 0x01, 0x01]);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_undecryptable_frame_closes_connection() {
    let (address, server) = spawn_unkeyed_server().await;
    let (handler, mut events) = handler();
    let session = Session::connect(session_config(address), handler).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(Some(ErrorKind::Crypto))
    );
    assert_eq!(session.state().await, SessionState::Failed);

    // The server sees the client hang up without the session being closed
    // or dropped.
    assert!(server.await.unwrap());
    assert!(events.try_recv().is_err());

    session.close().await.unwrap();
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_refused_dial_notifies_handler_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let (handler, mut events) = handler();
    let err = Session::connect(session_config(address), handler).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(Some(ErrorKind::Io))
    );
    assert!(events.try_recv().is_err());
}
