use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error};
use std::error::Error as StdError;
use std::net::SocketAddr;
use thiserror::Error;

use crate::common::config::UpstreamOrigin;
use crate::proxy::rewrite::{
    append_forwarded_for, remove_hop_by_hop_except_upgrade, remove_hop_by_hop_headers,
    remove_request_hop_by_hop_headers, rewrite_request, rewrite_response, upgrade_protocol,
};
use crate::proxy::transport::{TransportError, UpstreamTransport};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("Upstream switched to protocol '{offered}' when '{requested}' was requested")]
    UpgradeMismatch { requested: String, offered: String },
}

/// Single-host reverse proxy: every request goes to the same upstream origin.
pub struct ReverseProxy {
    upstream: UpstreamOrigin,
    transport: UpstreamTransport,
}

impl ReverseProxy {
    pub fn new(upstream: UpstreamOrigin, transport: UpstreamTransport) -> Self {
        ReverseProxy {
            upstream,
            transport,
        }
    }

    /// Never fails: upstream errors turn into `502 Bad Gateway`.
    pub async fn handle(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
        debug!("{} {} from {}", req.method(), req.uri(), client_addr);

        match self.forward(req.map(|body| body.boxed()), client_addr).await {
            Ok(resp) => resp.map(|body| body.boxed()),
            Err(e) => {
                error!("proxy error: {}", describe(&e));
                bad_gateway()
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        client_addr: SocketAddr,
    ) -> Result<Response<Incoming>, ProxyError> {
        let client_upgrade =
            upgrade_protocol(req.headers()).map(|protocol| (protocol, hyper::upgrade::on(&mut req)));

        remove_request_hop_by_hop_headers(req.headers_mut());
        append_forwarded_for(req.headers_mut(), client_addr.ip());
        let req = rewrite_request(req, &self.upstream)?;

        let mut resp = self.transport.round_trip(req).await?;
        debug!("Upstream answered {}", resp.status());

        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            remove_hop_by_hop_headers(resp.headers_mut());
            return Ok(rewrite_response(resp));
        }

        let offered = upgrade_protocol(resp.headers());
        let (requested, client_upgrade) = match (client_upgrade, &offered) {
            (Some((requested, client_upgrade)), Some(offered))
                if requested.as_bytes().eq_ignore_ascii_case(offered.as_bytes()) =>
            {
                (requested, client_upgrade)
            }
            (requested, offered) => {
                return Err(ProxyError::UpgradeMismatch {
                    requested: protocol_name(requested.as_ref().map(|(protocol, _)| protocol)),
                    offered: protocol_name(offered.as_ref()),
                });
            }
        };

        debug!("Switching to {:?} for {}", requested, client_addr);
        let upstream_upgrade = hyper::upgrade::on(&mut resp);
        tokio::spawn(tunnel(client_upgrade, upstream_upgrade, client_addr));

        remove_hop_by_hop_except_upgrade(resp.headers_mut());
        Ok(rewrite_response(resp))
    }
}

/// Relays bytes both ways once the client and upstream have both switched protocols.
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade, client_addr: SocketAddr) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            error!("Upgrade for {} failed: {}", client_addr, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(
            "Upgraded connection for {} closed ({} bytes up, {} bytes down)",
            client_addr, sent, received
        ),
        Err(e) => debug!("Upgraded connection for {} ended: {}", client_addr, e),
    }
}

fn protocol_name(value: Option<&HeaderValue>) -> String {
    value
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// `e` followed by those of its causes its own message does not already contain.
fn describe(e: &dyn StdError) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message = format!("{}: {}", message, text);
        }
        source = cause.source();
    }
    message
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn bad_gateway() -> Response<ProxyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}
