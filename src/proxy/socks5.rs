use log::debug;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid SOCKS5 proxy address '{0}': {1}")]
    InvalidProxyAddress(String, &'static str),
    #[error("SOCKS5 CONNECT to {target} failed: {source}")]
    ConnectFailed {
        target: String,
        source: tokio_socks::Error,
    },
}

/// Dials TCP connections through a SOCKS5 proxy without authentication.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: String,
}

impl Socks5Dialer {
    /// Checks the `host:port` shape only; nothing is resolved until [`connect`](Self::connect).
    pub fn new(proxy_addr: &str) -> Result<Self, Socks5Error> {
        validate_proxy_address(proxy_addr)?;
        Ok(Socks5Dialer {
            proxy_addr: proxy_addr.to_string(),
        })
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Opens a tunnel to `host:port` and returns the stream positioned at the
    /// first tunneled byte.
    ///
    /// Domain names are sent unresolved (ATYP 3); the proxy resolves them.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, Socks5Error> {
        let stream = Socks5Stream::connect(self.proxy_addr.as_str(), (host, port))
            .await
            .map_err(|source| Socks5Error::ConnectFailed {
                target: format!("{}:{}", host, port),
                source,
            })?;

        let stream = stream.into_inner();
        stream.set_nodelay(true)?;

        debug!(
            "SOCKS5 tunnel to {}:{} via {} established",
            host, port, self.proxy_addr
        );
        Ok(stream)
    }
}

fn validate_proxy_address(addr: &str) -> Result<(), Socks5Error> {
    let invalid = |reason| Socks5Error::InvalidProxyAddress(addr.to_string(), reason);

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    if host.starts_with('[') != host.ends_with(']') {
        return Err(invalid("unbalanced brackets"));
    }
    if !host.starts_with('[') && host.contains(':') {
        return Err(invalid("IPv6 host must be bracketed"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok(())
}
