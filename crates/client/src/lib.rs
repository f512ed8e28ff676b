//! # XXMP Client Library
//!
//! Connection management on top of [`xxmp_protocol`]: dialing (directly or
//! through an HTTP proxy), running the handshake, and delivering decrypted
//! frames to application code.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xxmp_client::{Config, Session, SessionHandler};
//! use xxmp_protocol::Error;
//!
//! struct Printer;
//!
//! impl SessionHandler for Printer {
//!     fn on_data_received(&self, payload: Vec<u8>) {
//!         println!("received {} bytes", payload.len());
//!     }
//!     fn on_disconnected(&self, reason: Option<&Error>) {
//!         println!("disconnected: {:?}", reason.map(|e| e.to_string()));
//!     }
//!     fn on_handshake_failed(&self, error: &Error) {
//!         eprintln!("handshake failed: {}", error);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let session = Session::connect(config.session_config()?, Arc::new(Printer)).await?;
//!     session.write_application_payload(b"hello").await?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`transport`]: TCP and HTTP CONNECT dialing
//! - [`session`]: Session lifecycle and the read loop

pub mod config;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use xxmp_protocol;

pub use config::{Config, ConfigError};
pub use session::{Session, SessionConfig, SessionHandler, SessionState};
pub use transport::Dialer;
