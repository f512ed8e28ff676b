//! Error types for the protocol crate.

use thiserror::Error;

/// Broad failure class of an [`Error`].
///
/// Sessions use the kind to decide how to react: configuration problems are
/// detected before any I/O, while I/O, crypto and protocol failures are fatal
/// to the connection they occur on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid inputs, detected before any network I/O.
    Config,
    /// Transport failure, EOF or truncated input.
    Io,
    /// Handshake, AEAD or peer verification failure.
    Crypto,
    /// Malformed or oversized wire data.
    Protocol,
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    /// The handshake was started without an authentication payload.
    #[error("handshake payload is missing")]
    MissingPayload,

    /// The handshake was started without a local static keypair.
    #[error("local static keypair is missing")]
    MissingStaticKey,

    /// The authentication payload does not fit in a single handshake message.
    #[error("handshake payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Routing info cannot be represented in the preamble.
    #[error("invalid routing info: {0}")]
    InvalidRoutingInfo(String),

    /// Dictionary tables violate the token space constraints.
    #[error("invalid dictionary: {0}")]
    InvalidDictionary(String),

    /// A proxy URL could not be parsed or uses an unsupported scheme.
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    /// Any other invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    /// Underlying transport error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Input ended before the bytes announced by a length field.
    #[error("truncated input: need {needed} more bytes, have {available}")]
    Truncated {
        /// Bytes required to finish the current item.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// The session is closed and cannot carry more frames.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    // Cryptographic errors
    /// Noise handshake failure (DH, transcript or message authentication).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A cipher state ran out of nonces.
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// The peer identity callback refused the server's static key.
    #[error("peer rejected: {0}")]
    PeerRejected(String),

    // Wire format errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Decoder met a byte that is not a known marker in this position.
    #[error("unknown token marker: {0:#04x}")]
    UnknownMarker(u8),

    /// Packed digit string contains a reserved nibble.
    #[error("invalid packed nibble: {0}")]
    InvalidNibble(u8),

    /// A string cannot be packed into the requested packed variant.
    #[error("invalid packed string: {0}")]
    InvalidPackedString(String),

    /// Dictionary index that has no entry in the active tables.
    #[error("unknown dictionary index {index} in {table} table")]
    UnknownToken {
        /// Which table was consulted.
        table: &'static str,
        /// The missing index.
        index: u16,
    },

    /// A string or byte payload is larger than its variant can carry.
    #[error("string too long: {size} bytes exceeds maximum of {max} bytes")]
    StringTooLong {
        /// Actual length.
        size: usize,
        /// Maximum for the variant.
        max: usize,
    },

    /// A list holds more items than a long list can count.
    #[error("list too long: {0} items")]
    ListTooLong(usize),

    /// Text token does not hold valid UTF-8.
    #[error("invalid utf-8 in text token")]
    InvalidUtf8,

    /// Decoded list does not describe a valid node.
    #[error("malformed node: {0}")]
    MalformedNode(String),

    /// Handshake record is missing fields or has the wrong shape.
    #[error("malformed handshake message: {0}")]
    MalformedHandshake(String),

    /// A cipher state was installed into a slot that already holds one.
    #[error("cipher state already installed for {0} direction")]
    CipherAlreadyInstalled(&'static str),
}

impl Error {
    /// Returns the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingPayload
            | Error::MissingStaticKey
            | Error::PayloadTooLarge { .. }
            | Error::InvalidRoutingInfo(_)
            | Error::InvalidDictionary(_)
            | Error::InvalidProxy(_)
            | Error::InvalidConfig(_) => ErrorKind::Config,

            Error::Io(_) | Error::Truncated { .. } | Error::ConnectionClosed(_) => ErrorKind::Io,

            Error::Handshake(_)
            | Error::Encryption(_)
            | Error::Decryption(_)
            | Error::NonceExhausted
            | Error::PeerRejected(_) => ErrorKind::Crypto,

            Error::FrameTooLarge { .. }
            | Error::UnknownMarker(_)
            | Error::InvalidNibble(_)
            | Error::InvalidPackedString(_)
            | Error::UnknownToken { .. }
            | Error::StringTooLong { .. }
            | Error::ListTooLong(_)
            | Error::InvalidUtf8
            | Error::MalformedNode(_)
            | Error::MalformedHandshake(_)
            | Error::CipherAlreadyInstalled(_) => ErrorKind::Protocol,
        }
    }

    /// Returns whether the error is fatal to the connection it occurred on.
    ///
    /// Only configuration errors leave a connection untouched, since they are
    /// raised before anything is sent.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Config
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

// Conversions from underlying crate errors

impl From<snow::Error> for Error {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => Error::Decryption(err.to_string()),
            _ => Error::Handshake(err.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::MalformedHandshake(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::MalformedHandshake(err.to_string())
    }
}
