//! Outbound byte-stream connections.
//!
//! A [`Dialer`] opens a TCP connection to the server, either directly or
//! through an HTTP `CONNECT` proxy. The proxy URL is parsed up front so a bad
//! value is reported before anything touches the network.

use base64::Engine;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;
use xxmp_protocol::{Error, Result};

/// Upper bound on a proxy's response head.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Default port for `http://` proxies without an explicit port.
const DEFAULT_PROXY_PORT: u16 = 80;

/// Parses a proxy URL. Only `http://host[:port]` proxies are supported.
pub fn parse_proxy(proxy: &str) -> Result<Url> {
    let url = Url::parse(proxy).map_err(|e| Error::InvalidProxy(format!("{}: {}", proxy, e)))?;
    if url.scheme() != "http" {
        return Err(Error::InvalidProxy(format!(
            "unsupported proxy scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidProxy(format!("{}: missing host", proxy)));
    }
    Ok(url)
}

/// Checks that an address has the form `host:port`.
pub fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("address '{}' has no port", address)))?;
    if host.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "address '{}' has no host",
            address
        )));
    }
    port.parse::<u16>()
        .map_err(|_| Error::InvalidConfig(format!("address '{}' has an invalid port", address)))?;
    Ok(())
}

/// Opens TCP connections to one server address.
#[derive(Debug, Clone)]
pub struct Dialer {
    address: String,
    proxy: Option<Url>,
}

impl Dialer {
    /// Creates a dialer, validating the address and proxy.
    pub fn new(address: impl Into<String>, proxy: Option<&str>) -> Result<Self> {
        let address = address.into();
        validate_address(&address)?;
        let proxy = proxy.map(parse_proxy).transpose()?;
        Ok(Self { address, proxy })
    }

    /// The server address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The proxy in use, if any.
    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    /// Connects to the server.
    pub async fn dial(&self) -> Result<TcpStream> {
        match &self.proxy {
            None => {
                debug!(address = %self.address, "Dialing server");
                let stream = TcpStream::connect(&self.address).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Some(proxy) => {
                let host = proxy.host_str().unwrap_or_default();
                let port = proxy.port().unwrap_or(DEFAULT_PROXY_PORT);
                debug!(address = %self.address, proxy = %host, port, "Dialing through proxy");
                let mut stream = TcpStream::connect((host, port)).await?;
                stream.set_nodelay(true)?;
                proxy_connect(&mut stream, &self.address, proxy).await?;
                Ok(stream)
            }
        }
    }
}

/// Asks an HTTP proxy to open a tunnel to `target`.
///
/// The response head is read one byte at a time so nothing after the blank
/// line is consumed.
async fn proxy_connect<S>(stream: &mut S, target: &str, proxy: &Url) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(credentials) = proxy_credentials(proxy) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(proxy_failure("response head too large"));
        }
        head.push(stream.read_u8().await?);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if !status_line.starts_with("HTTP/1.") || status != Some("200") {
        return Err(proxy_failure(&format!("tunnel refused: {}", status_line)));
    }
    debug!(target, "Proxy tunnel established");
    Ok(())
}

/// Decoded `user:password` from the proxy URL's userinfo, if any.
fn proxy_credentials(proxy: &Url) -> Option<String> {
    if proxy.username().is_empty() {
        return None;
    }
    let user = percent_decode_str(proxy.username()).decode_utf8_lossy();
    let password = percent_decode_str(proxy.password().unwrap_or("")).decode_utf8_lossy();
    Some(format!("{}:{}", user, password))
}

fn proxy_failure(message: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        format!("proxy: {}", message),
    ))
}
