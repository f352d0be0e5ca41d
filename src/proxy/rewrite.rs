//! Header and target rewriting applied around the upstream round trip.
//!
//! Everything here is pure: no I/O, no shared state.

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use std::net::IpAddr;

use crate::common::config::UpstreamOrigin;

/// Removed from every relayed response.
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = [
    "content-security-policy",
    "content-security-policy-report-only",
    "clear-site-data",
];

/// Headers that only apply to a single transport connection (RFC 9110 §7.6.1).
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Points the request at the upstream origin and overwrites `Host` and `Referer`.
///
/// Method, body and the remaining headers are left as they are.
pub fn rewrite_request<B>(
    mut req: Request<B>,
    upstream: &UpstreamOrigin,
) -> Result<Request<B>, http::Error> {
    *req.uri_mut() = upstream_uri(req.uri(), upstream)?;

    let headers = req.headers_mut();
    headers.insert(header::HOST, upstream.host_header().clone());
    headers.insert(header::REFERER, upstream.referer_header().clone());

    Ok(req)
}

/// Forces permissive CORS and drops headers that would restrict the page.
///
/// Idempotent.
pub fn rewrite_response<B>(mut resp: Response<B>) -> Response<B> {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }
    resp
}

/// Drops the fixed hop-by-hop set plus anything listed in `Connection`.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Like [`remove_hop_by_hop_headers`], but an upgrade handshake survives as
/// `Connection: upgrade` plus its `Upgrade` value.
pub fn remove_hop_by_hop_except_upgrade(headers: &mut HeaderMap) {
    let protocol = upgrade_protocol(headers);
    remove_hop_by_hop_headers(headers);
    if let Some(protocol) = protocol {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
}

/// Outbound request variant: also keeps `TE: trailers`.
pub fn remove_request_hop_by_hop_headers(headers: &mut HeaderMap) {
    let trailers = has_token(headers, &header::TE, "trailers");
    remove_hop_by_hop_except_upgrade(headers);
    if trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

/// The `Upgrade` value, when `Connection` asks for an upgrade.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    if !has_token(headers, &header::CONNECTION, "upgrade") {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Appends `client_ip` to `X-Forwarded-For`, folding prior values into one line.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");

    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior, client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn upstream_uri(uri: &Uri, upstream: &UpstreamOrigin) -> Result<Uri, http::Error> {
    let path = join_path(upstream.base_path(), uri.path());

    let target_query = upstream.query().unwrap_or("");
    let request_query = uri.query().unwrap_or("");
    let query = if target_query.is_empty() || request_query.is_empty() {
        format!("{}{}", target_query, request_query)
    } else {
        format!("{}&{}", target_query, request_query)
    };

    let path_and_query = if query.is_empty() {
        path
    } else {
        format!("{}?{}", path, query)
    };

    Uri::builder()
        .scheme(upstream.scheme())
        .authority(upstream.host())
        .path_and_query(path_and_query)
        .build()
}

/// Joins with exactly one `/` between the two parts.
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
