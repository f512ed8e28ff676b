//! # XXMP Protocol Library
//!
//! This crate provides the wire layers of an XXMP client: a compact,
//! dictionary-compressed tree encoding, a Noise XX handshake, and the
//! length-prefixed frames that carry both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Node trees                 │  tag, attributes, content
//! ├─────────────────────────────────────────┤
//! │        Lists and dictionary tokens      │  1-2 byte words, JIDs, strings
//! ├─────────────────────────────────────────┤
//! │       Frames (AES-256-GCM once keyed)   │  3 byte length prefix
//! ├─────────────────────────────────────────┤
//! │      Noise_XX_25519_AESGCM_SHA256       │  3 plaintext frames
//! ├─────────────────────────────────────────┤
//! │        Transport (TCP, proxied)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use xxmp_protocol::{Dictionary, FrameCodec, Node};
//!
//! let dict = Dictionary::builtin();
//! let node = Node::new("iq")
//!     .with_attr("type", "get")
//!     .with_attr("to", "s.whatsapp.net")
//!     .with_children(vec![Node::new("ping")]);
//!
//! let bytes = node.marshal(&dict).unwrap();
//! assert_eq!(Node::unmarshal(&bytes, &dict).unwrap(), node);
//!
//! let frame = FrameCodec::new().encode(&bytes).unwrap();
//! assert_eq!(frame.len(), bytes.len() + 3);
//! ```
//!
//! ## Modules
//!
//! - [`dictionary`]: versioned string tables
//! - [`token`]: the token wire format
//! - [`list`]: token lists
//! - [`node`]: message trees and their envelope
//! - [`crypto`]: static keypairs and fingerprints
//! - [`cipher`]: transport cipher states
//! - [`noise`]: the Noise XX state machine
//! - [`handshake`]: preamble, header and handshake records
//! - [`framing`]: frame codec, writer and reader
//! - [`error`]: error types

pub mod cipher;
pub mod crypto;
pub mod dictionary;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod list;
pub mod node;
pub mod noise;
pub mod token;

pub use cipher::{CipherPair, CipherState, TAG_LENGTH};
pub use crypto::{KeyId, KeyPair, KEY_LENGTH};
pub use dictionary::{Dictionary, DictionaryTables, BUILTIN_VERSION};
pub use error::{Error, ErrorKind, Result};
pub use framing::{
    install_cipher_pair, FrameCodec, FrameReader, FrameWriter, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use handshake::{
    respond, ClientPhase, HandshakeConfig, HandshakeContext, HandshakeMessage, HandshakeOutcome,
    PeerVerifier, ResponderConfig, ResponderOutcome, DEFAULT_VERSION_MAJOR, DEFAULT_VERSION_MINOR,
};
pub use list::{Item, List, SizeClass};
pub use node::{Content, Node};
pub use noise::{HandshakePhase, NoiseHandshake, Role, NOISE_PATTERN};
pub use token::Token;
