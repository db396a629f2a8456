//! Header rewrites between the relay and local services.
//!
//! Requests arriving through the tunnel must look like ordinary local traffic
//! to the device's web service, and responses must point the remote browser
//! back at the relay hostname rather than at loopback.

use hyper::Uri;
use tracing::{info, warn};

pub const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";

/// Request headers dropped before forwarding to a local service.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "accept-encoding",
    "transfer-encoding",
    "upgrade-insecure-requests",
    "x-forwarded-for",
    "x-real-ip",
    "x-original-proto",
];

/// Response headers never sent back to the relay.
const DROPPED_RESPONSE_HEADERS: &[&str] = &["transfer-encoding", "x-clacks-overhead"];

/// Protocol the remote client used to reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseProtocol {
    Http,
    WebSocket,
}

impl BaseProtocol {
    fn forwarded_proto(self) -> &'static str {
        match self {
            BaseProtocol::Http => "https",
            BaseProtocol::WebSocket => "wss",
        }
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Rewrite relay request headers for a local HTTP call.
///
/// `local_host` replaces `Host`, `Referer` and `Origin`; `external_host` is
/// what the remote user typed and becomes `X-Forwarded-Host`.
pub fn gather_request_headers(
    headers: &[(String, String)],
    local_host: &str,
    external_host: Option<&str>,
    protocol: BaseProtocol,
) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(headers.len() + 3);
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if DROPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        let value = match lower.as_str() {
            "host" => local_host.to_string(),
            "referer" | "origin" => format!("http://{local_host}"),
            _ => value.clone(),
        };
        out.push((name.clone(), value));
    }

    if let Some(host) = external_host {
        out.push((X_FORWARDED_HOST.to_string(), host.to_string()));
    }
    out.push((
        X_FORWARDED_PROTO.to_string(),
        protocol.forwarded_proto().to_string(),
    ));
    out.push(("Accept-Encoding".to_string(), String::new()));
    out
}

/// Headers forwarded on a local WebSocket upgrade: API keys, cookies and
/// the requested subprotocols. Everything else is supplied by the client library.
pub fn gather_websocket_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            lower.starts_with("x-api-key") || lower == "cookie" || lower == "sec-websocket-protocol"
        })
        .cloned()
        .collect()
}

/// Drop response headers that describe the local hop only.
pub fn filter_response_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| {
            !DROPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str())
        })
        .collect()
}

/// Rewrite a `Location` header so redirects land on the relay hostname.
///
/// Returns `None` when the value should be passed through untouched.
pub fn correct_location(
    request_path: &str,
    location: &str,
    sent_headers: &[(String, String)],
) -> Option<String> {
    let lower = location.to_ascii_lowercase();
    if lower.starts_with("ws") {
        return None;
    }
    let Some(host) = header_value(sent_headers, X_FORWARDED_HOST) else {
        warn!("Location header present but no {X_FORWARDED_HOST} was sent");
        return None;
    };
    let proto = header_value(sent_headers, X_FORWARDED_PROTO)?;

    let (path, query) = if lower.starts_with("http") {
        let uri: Uri = location.parse().ok()?;
        (uri.path().to_string(), uri.query().map(ToString::to_string))
    } else if let Some(rest) = location.strip_prefix("./") {
        let request_path = request_path.split('?').next().unwrap_or_default();
        let dir = match request_path.rfind('/') {
            Some(idx) => &request_path[..=idx],
            None => "/",
        };
        let (rest, query) = split_query(rest);
        (format!("{dir}{rest}"), query)
    } else if location.starts_with('/') {
        let (path, query) = split_query(location);
        (path.to_string(), query)
    } else {
        return None;
    };

    let mut corrected = format!("{proto}://{host}{path}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        corrected.push('?');
        corrected.push_str(&query);
    }
    info!("Corrected response location header {location} -> {corrected}");
    Some(corrected)
}

fn split_query(value: &str) -> (&str, Option<String>) {
    match value.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (value, None),
    }
}

/// True when the request's conditional headers prove the client's cached
/// copy is current, so the response can become a bodiless 304.
pub fn is_not_modified(sent_headers: &[(String, String)], response_headers: &[(String, String)]) -> bool {
    if let (Some(etag), Some(response_etag)) = (
        header_value(sent_headers, "if-none-match"),
        header_value(response_headers, "etag"),
    ) {
        let etag = etag.strip_prefix("W/").unwrap_or(etag);
        if etag == response_etag {
            return true;
        }
    }
    if let (Some(since), Some(modified)) = (
        header_value(sent_headers, "if-modified-since"),
        header_value(response_headers, "last-modified"),
    ) {
        return since == modified;
    }
    false
}

/// Headers that must not accompany a synthesized 304.
pub fn strip_for_not_modified(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("content-type")
    });
}
