use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::debug;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio_native_tls::TlsConnector;
use tower_service::Service;

use crate::common::config::UpstreamOrigin;
use crate::net::conn::UpstreamConnection;
use crate::proxy::http::ProxyBody;
use crate::proxy::socks5::{Socks5Dialer, Socks5Error};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("SOCKS5 error: {0}")]
    Socks5Error(#[from] Socks5Error),
    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),
    #[error("HTTP error: {0}")]
    HttpError(#[from] hyper_util::client::legacy::Error),
}

/// Opens upstream connections: SOCKS5 tunnel first, then TLS for https.
///
/// The client only ever talks to one origin, so the requested URI is used for
/// logging and the dial target always comes from the configured upstream.
#[derive(Clone)]
pub struct SocksConnector {
    upstream: UpstreamOrigin,
    dialer: Socks5Dialer,
    tls: TlsConnector,
}

impl SocksConnector {
    async fn connect(self) -> Result<UpstreamConnection, TransportError> {
        let stream = self
            .dialer
            .connect(self.upstream.dial_host(), self.upstream.port())
            .await?;

        let conn = if self.upstream.is_tls() {
            UpstreamConnection::tls(self.tls.connect(self.upstream.dial_host(), stream).await?)
        } else {
            UpstreamConnection::plain(stream)
        };

        debug!(
            "Upstream connection to {} open (tls: {})",
            self.upstream.host(),
            conn.is_tls()
        );
        Ok(conn)
    }
}

impl Service<Uri> for SocksConnector {
    type Response = UpstreamConnection;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamConnection, TransportError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        debug!(
            "New upstream connection for {} via SOCKS5 {}",
            dst,
            self.dialer.proxy_addr()
        );
        Box::pin(self.clone().connect())
    }
}

/// Performs HTTP round trips to the upstream origin over pooled connections,
/// every one of them dialed through the SOCKS5 proxy.
///
/// A connection goes back to the pool once its response body has been read to
/// the end. Dropping a response future or body before that closes it.
pub struct UpstreamTransport {
    connector: SocksConnector,
    client: Client<SocksConnector, ProxyBody>,
}

impl UpstreamTransport {
    pub fn new(upstream: UpstreamOrigin, dialer: Socks5Dialer) -> Result<Self, TransportError> {
        let tls = TlsConnector::from(native_tls::TlsConnector::new()?);
        let connector = SocksConnector {
            upstream,
            dialer,
            tls,
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .build(connector.clone());

        Ok(UpstreamTransport { connector, client })
    }

    pub fn socks_proxy_addr(&self) -> &str {
        self.connector.dialer.proxy_addr()
    }

    /// `req` must carry an absolute URI; the client writes it in origin form.
    pub async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, TransportError> {
        Ok(self.client.request(req).await?)
    }
}
