use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task;

use crate::proxy::http::ReverseProxy;

#[derive(Error, Debug)]
pub enum TcpProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("HTTP error: {0}")]
    HttpError(#[from] hyper::Error),
}

/// Accepts inbound connections and serves each one on its own task.
pub struct TcpProxy {
    proxy: Arc<ReverseProxy>,
}

impl TcpProxy {
    pub fn new(proxy: Arc<ReverseProxy>) -> Self {
        TcpProxy { proxy }
    }

    /// Serves until the listener fails with a non-transient error.
    pub async fn run(&self, listener: TcpListener) -> Result<(), TcpProxyError> {
        info!("Reverse proxy listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => {
                    error!("Listener failed: {}", e);
                    return Err(TcpProxyError::IoError(e));
                }
            };

            let proxy = self.proxy.clone();
            task::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, proxy).await {
                    debug!("Connection from {} ended: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        proxy: Arc<ReverseProxy>,
    ) -> Result<(), TcpProxyError> {
        debug!("Connection from {}", addr);
        stream.set_nodelay(true)?;

        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, addr).await) }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await?;
        Ok(())
    }
}

/// Errors that concern one pending connection, or descriptor exhaustion that
/// clears up as other connections close.
fn is_transient(e: &io::Error) -> bool {
    is_out_of_descriptors(e)
        || matches!(
            e.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
        )
}

// EMFILE and ENFILE have no ErrorKind of their own.
#[cfg(unix)]
fn is_out_of_descriptors(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
fn is_out_of_descriptors(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::UpstreamOrigin;
    use crate::proxy::socks5::Socks5Dialer;
    use crate::proxy::transport::UpstreamTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    const UPSTREAM_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
        Content-Type: text/plain\r\n\
        Content-Length: 5\r\n\
        Content-Security-Policy: default-src 'self'\r\n\
        Clear-Site-Data: \"cache\"\r\n\
        Access-Control-Allow-Origin: https://huggingface.co\r\n\
        X-Repo-Commit: abc123\r\n\
        Connection: close\r\n\
        \r\n\
        hello";

    /// Upstream reached through the mock SOCKS5 proxy: reports each forwarded
    /// request head, then answers with `UPSTREAM_RESPONSE`.
    async fn mock_socks_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = mock_socks_with(move |mut stream, head| {
            let tx = tx.clone();
            async move {
                tx.send(head).unwrap();
                stream.write_all(UPSTREAM_RESPONSE).await.unwrap();
                let _ = stream.shutdown().await;
            }
        })
        .await;
        (addr, rx)
    }

    async fn start_proxy(socks_addr: &str) -> SocketAddr {
        let upstream = UpstreamOrigin::parse("http://upstream.test").unwrap();
        let dialer = Socks5Dialer::new(socks_addr).unwrap();
        let transport = UpstreamTransport::new(upstream.clone(), dialer).unwrap();
        let proxy = TcpProxy::new(Arc::new(ReverseProxy::new(upstream, transport)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = proxy.run(listener).await;
        });
        addr
    }

    async fn send_raw(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_basic_forward() {
        let (socks_addr, mut forwarded) = mock_socks_upstream().await;
        let proxy_addr = start_proxy(&socks_addr.to_string()).await;

        let response = send_raw(
            proxy_addr,
            "GET /models/bert?full=true HTTP/1.1\r\n\
             Host: proxy.local\r\n\
             Referer: https://proxy.local/previous\r\n\
             Connection: close\r\n\
             \r\n",
        )
        .await;

        let head = forwarded.recv().await.unwrap().to_lowercase();
        assert!(head.starts_with("get /models/bert?full=true http/1.1\r\n"));
        assert!(head.contains("host: upstream.test\r\n"));
        assert!(head.contains("referer: http://upstream.test\r\n"));
        assert!(head.contains("x-forwarded-for: 127.0.0.1\r\n"));
        assert!(!head.contains("proxy.local"));
        assert!(!head.contains("connection: close"));

        let response_lower = response.to_lowercase();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response_lower.contains("access-control-allow-origin: *\r\n"));
        assert!(response_lower.contains("access-control-allow-credentials: true\r\n"));
        assert!(response_lower.contains("x-repo-commit: abc123\r\n"));
        assert!(!response_lower.contains("content-security-policy"));
        assert!(!response_lower.contains("clear-site-data"));
        assert!(!response_lower.contains("https://huggingface.co"));
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let (socks_addr, mut forwarded) = mock_socks_upstream().await;
        let proxy_addr = start_proxy(&socks_addr.to_string()).await;

        let requests = (0..4).map(|i| {
            let request = format!(
                "GET /datasets/{} HTTP/1.1\r\nHost: proxy.local\r\nConnection: close\r\n\r\n",
                i
            );
            tokio::spawn(async move { send_raw(proxy_addr, &request).await })
        });

        for handle in requests.collect::<Vec<_>>() {
            let response = handle.await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        }

        let mut paths = Vec::new();
        for _ in 0..4 {
            let head = forwarded.recv().await.unwrap();
            paths.push(head.split(' ').nth(1).unwrap().to_string());
        }
        paths.sort();
        assert_eq!(
            paths,
            vec!["/datasets/0", "/datasets/1", "/datasets/2", "/datasets/3"]
        );
    }

    #[tokio::test]
    async fn test_upstream_unreachable_returns_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let proxy_addr = start_proxy(&closed.to_string()).await;
        let request = "GET /models/bert HTTP/1.1\r\nHost: proxy.local\r\nConnection: close\r\n\r\n";

        let first = send_raw(proxy_addr, request).await;
        assert!(first.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));

        // The server keeps serving after a failed round trip.
        let second = send_raw(proxy_addr, request).await;
        assert!(second.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    /// SOCKS5 proxy whose tunnel lands on `upstream`, called with the stream
    /// and the first request head.
    async fn mock_socks_with<F, Fut>(upstream: F) -> SocketAddr
    where
        F: Fn(TcpStream, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = Arc::new(upstream);

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    let mut greeting = [0u8; 3];
                    stream.read_exact(&mut greeting).await.unwrap();
                    stream.write_all(&[0x05, 0x00]).await.unwrap();

                    let mut header = [0u8; 5];
                    stream.read_exact(&mut header).await.unwrap();
                    let mut rest = vec![0u8; header[4] as usize + 2];
                    stream.read_exact(&mut rest).await.unwrap();
                    stream
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                        .await
                        .unwrap();

                    let head = read_head(&mut stream).await;
                    (*upstream)(stream, head).await;
                });
            }
        });

        addr
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    #[tokio::test]
    async fn test_upgrade_is_tunneled() {
        let (tx, mut forwarded) = mpsc::unbounded_channel();
        let socks_addr = mock_socks_with(move |mut stream, head| {
            let tx = tx.clone();
            async move {
                tx.send(head).unwrap();
                stream
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\n\
                          Connection: Upgrade\r\n\
                          Upgrade: websocket\r\n\
                          \r\n",
                    )
                    .await
                    .unwrap();

                let mut frame = [0u8; 4];
                stream.read_exact(&mut frame).await.unwrap();
                stream.write_all(&frame).await.unwrap();
            }
        })
        .await;
        let proxy_addr = start_proxy(&socks_addr.to_string()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(
                b"GET /socket HTTP/1.1\r\n\
                  Host: proxy.local\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let response = read_head(&mut client).await.to_lowercase();
        assert!(response.starts_with("http/1.1 101 switching protocols\r\n"));
        assert!(response.contains("upgrade: websocket\r\n"));

        let head = forwarded.recv().await.unwrap().to_lowercase();
        assert!(head.contains("connection: upgrade\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));
        assert!(head.contains("host: upstream.test\r\n"));

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn test_client_disconnect_closes_upstream() {
        let (received_tx, mut received) = mpsc::unbounded_channel();
        let (closed_tx, mut closed) = mpsc::unbounded_channel();
        let socks_addr = mock_socks_with(move |mut stream, _head| {
            let received_tx = received_tx.clone();
            let closed_tx = closed_tx.clone();
            async move {
                received_tx.send(()).unwrap();
                // Never answer; wait for the proxy to give up on the request.
                let mut buf = [0u8; 64];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                closed_tx.send(n).unwrap();
            }
        })
        .await;
        let proxy_addr = start_proxy(&socks_addr.to_string()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET /models/slow HTTP/1.1\r\nHost: proxy.local\r\n\r\n")
            .await
            .unwrap();
        received.recv().await.unwrap();
        drop(client);

        let n = tokio::time::timeout(Duration::from_secs(5), closed.recv())
            .await
            .expect("upstream connection left open")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_is_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EACCES)));
    }
}
