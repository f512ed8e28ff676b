//! XXMP Client
//!
//! Command line tools for XXMP connections.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use xxmp_client::config::{default_key_path, save_key, Config};
use xxmp_client::{Session, SessionHandler};
use xxmp_protocol::{Dictionary, Error, KeyPair, Node};

/// XXMP Client - connect to an XXMP server and inspect its wire format.
#[derive(Parser, Debug)]
#[command(name = "xxmp-client")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect and print every node the server sends
    Connect {
        /// Server address (host:port), overriding the config file
        #[arg(long)]
        address: Option<String>,

        /// HTTP proxy URL, overriding the config file
        #[arg(long)]
        proxy: Option<String>,
    },

    /// Decode a hex-encoded marshalled node
    Decode {
        /// Hex bytes, starting with the flag byte
        hex: String,
    },

    /// Generate a static keypair
    Keygen {
        /// Where to write the private key (defaults to the config directory)
        path: Option<PathBuf>,

        /// Overwrite an existing key
        #[arg(long, short)]
        force: bool,
    },
}

/// Prints inbound nodes and wakes the main task when the session ends.
struct NodePrinter {
    dictionary: Arc<Dictionary>,
    finished: Arc<Notify>,
}

impl SessionHandler for NodePrinter {
    fn on_data_received(&self, payload: Vec<u8>) {
        match Node::unmarshal(&payload, &self.dictionary) {
            Ok(node) => print!("{}", node.render_debug_string()),
            Err(e) => tracing::warn!(
                "Undecodable frame ({} bytes): {}",
                payload.len(),
                e
            ),
        }
    }

    fn on_disconnected(&self, reason: Option<&Error>) {
        match reason {
            Some(e) => tracing::warn!("Disconnected: {}", e),
            None => tracing::info!("Disconnected"),
        }
        self.finished.notify_one();
    }

    fn on_handshake_failed(&self, error: &Error) {
        tracing::error!("Handshake failed: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Connect { address, proxy } => {
            if let Some(address) = address {
                config.connection.address = address;
            }
            if proxy.is_some() {
                config.connection.proxy = proxy;
            }
            config.validate()?;
            run_connect(&config).await?;
        }
        Commands::Decode { hex } => {
            config.validate()?;
            let bytes = hex::decode(hex.trim()).context("Input is not valid hex")?;
            let dictionary = config.load_dictionary()?;
            let node = Node::unmarshal(&bytes, &dictionary).context("Failed to decode node")?;
            print!("{}", node.render_debug_string());
        }
        Commands::Keygen { path, force } => {
            let path = path.unwrap_or_else(default_key_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "Key file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            let key = KeyPair::generate();
            save_key(&key, &path)?;
            println!("Wrote static key to {}", path.display());
            println!("Public key:  {}", hex::encode(key.public_bytes()));
            println!("Fingerprint: {}", key.fingerprint());
        }
    }

    Ok(())
}

async fn run_connect(config: &Config) -> anyhow::Result<()> {
    let session_config = config.session_config()?;
    let finished = Arc::new(Notify::new());
    let handler = Arc::new(NodePrinter {
        dictionary: session_config.dictionary.clone(),
        finished: finished.clone(),
    });

    let session = Session::connect(session_config, handler)
        .await
        .with_context(|| format!("Failed to connect to {}", config.connection.address))?;
    tracing::info!(
        "Connected to {} (server key {})",
        config.connection.address,
        xxmp_protocol::crypto::fingerprint(session.peer_static())
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, closing session"),
        _ = finished.notified() => {}
    }

    session.close().await?;
    Ok(())
}
