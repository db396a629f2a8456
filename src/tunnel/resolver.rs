//! Local endpoint resolution.
//!
//! The device's port topology is not known in advance: the web service may be
//! reachable directly, only through a local reverse proxy, only on the LAN
//! address, or (for webcams) on a separate hardcoded port. Relative paths are
//! tried against each candidate in order until one answers with something
//! other than 404.
//!
//! ```text
//! 1. http://{host}:{port}{path}                 direct service
//! 2. {proxy_scheme}://{host}:{proxy_port}{path}  local reverse proxy
//! 3. {proxy_scheme}://{lan_ip}:{proxy_port}{path}
//! 4. http://{lan_ip}:{port}{path}
//! 5. http://{host}:{webcam_port}{rest}           only for /webcam/... paths
//! ```

use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Request};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};

use super::body::LocalBody;
use super::codec::PathType;
use crate::config::LocalConfig;
use crate::error::{BoxError, FetchError};

const WEBCAM_PATH_PREFIX: &str = "/webcam";

/// Stream URLs some frontends emit without the trailing slash; the webcam
/// server redirects them to the slashed form.
const UNSLASHED_WEBCAM_QUERY: &str = "/webcam?action";

/// A request ready to be sent to any candidate.
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A local service's response with the body still unread.
pub struct LocalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// The candidate URL that produced this response.
    pub url: String,
    pub body: LocalBody,
}

impl std::fmt::Debug for LocalResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalResponse")
            .field("status", &self.status)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Issues one HTTP request against one URL. Redirects are never followed.
#[async_trait]
pub trait LocalFetcher: Send + Sync {
    async fn fetch(&self, url: &str, request: &LocalRequest) -> Result<LocalResponse, FetchError>;
}

/// [`LocalFetcher`] backed by a pooled hyper client.
///
/// Local reverse proxies commonly use self-signed certificates, so TLS
/// verification is disabled. The traffic never leaves the device or LAN.
pub struct HyperFetcher {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HyperFetcher {
    pub fn new(timeout: Duration) -> Result<Self, native_tls::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl LocalFetcher for HyperFetcher {
    async fn fetch(&self, url: &str, request: &LocalRequest) -> Result<LocalResponse, FetchError> {
        let mut builder = Request::builder().method(request.method.clone()).uri(url);
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Skipping unrepresentable request header {name}"),
            }
        }
        let req = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| FetchError::InvalidUrl {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
            })?
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                source: Box::new(e),
            })?;

        let (parts, body) = response.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(LocalResponse {
            status: parts.status.as_u16(),
            headers,
            url: url.to_string(),
            body: body.map_err(BoxError::from).boxed(),
        })
    }
}

/// One URL to try, with a label for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub label: &'static str,
    pub url: String,
}

/// Result of walking the candidate chain.
#[derive(Debug)]
pub enum ResolveOutcome {
    Response(LocalResponse),
    /// Every candidate failed at the transport level.
    TransportFailure,
}

/// Builds candidate URLs from the configured local topology.
#[derive(Debug, Clone)]
pub struct Resolver {
    host: String,
    port: u16,
    proxy_port: Option<u16>,
    proxy_https: bool,
    webcam_port: u16,
    lan_ip: Option<String>,
}

impl Resolver {
    pub fn new(config: &LocalConfig) -> Self {
        let lan_ip = config.lan_ip.clone().or_else(detect_lan_ip);
        match &lan_ip {
            Some(ip) => info!("Local LAN address: {ip}"),
            None => warn!("Could not detect a LAN address, LAN fallbacks disabled"),
        }
        Self {
            host: config.host.clone(),
            port: config.port,
            proxy_port: config.proxy_port,
            proxy_https: config.proxy_is_https(),
            webcam_port: config.webcam_fallback_port,
            lan_ip,
        }
    }

    /// Loopback host used for `Host`, `Referer` and `Origin` rewrites.
    pub fn local_host(&self) -> &str {
        &self.host
    }

    pub fn lan_ip(&self) -> Option<&str> {
        self.lan_ip.as_deref()
    }

    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy_port
    }

    /// Ordered HTTP candidates for `path`.
    pub fn http_candidates(&self, path: &str, path_type: PathType) -> Vec<Candidate> {
        if path_type == PathType::Absolute {
            return vec![Candidate {
                label: "absolute",
                url: path.to_string(),
            }];
        }
        let slashed;
        let path = match path.strip_prefix(UNSLASHED_WEBCAM_QUERY) {
            Some(rest) => {
                slashed = format!("/webcam/?action{rest}");
                slashed.as_str()
            }
            None => path,
        };
        let proxy_scheme = if self.proxy_https { "https" } else { "http" };
        let mut candidates = self.relative_candidates(path, "http", proxy_scheme);

        if path.to_ascii_lowercase().starts_with(WEBCAM_PATH_PREFIX) {
            if let Some(second_slash) = path[1..].find('/') {
                candidates.push(Candidate {
                    label: "webcam fallback",
                    url: format!(
                        "http://{}:{}{}",
                        self.host,
                        self.webcam_port,
                        &path[second_slash + 1..]
                    ),
                });
            }
        }
        candidates
    }

    /// Ordered WebSocket candidates for `path`.
    pub fn ws_candidates(&self, path: &str, path_type: PathType) -> Vec<Candidate> {
        if path_type == PathType::Absolute {
            return vec![Candidate {
                label: "absolute",
                url: path.to_string(),
            }];
        }
        let proxy_scheme = if self.proxy_https { "wss" } else { "ws" };
        self.relative_candidates(path, "ws", proxy_scheme)
    }

    fn relative_candidates(&self, path: &str, scheme: &str, proxy_scheme: &str) -> Vec<Candidate> {
        let mut candidates = vec![Candidate {
            label: "main",
            url: format!("{scheme}://{}:{}{path}", self.host, self.port),
        }];
        if let Some(proxy_port) = self.proxy_port {
            candidates.push(Candidate {
                label: "proxy",
                url: format!("{proxy_scheme}://{}:{proxy_port}{path}", self.host),
            });
        }
        if let Some(lan_ip) = &self.lan_ip {
            if let Some(proxy_port) = self.proxy_port {
                candidates.push(Candidate {
                    label: "lan proxy",
                    url: format!("{proxy_scheme}://{lan_ip}:{proxy_port}{path}"),
                });
            }
            candidates.push(Candidate {
                label: "lan",
                url: format!("{scheme}://{lan_ip}:{}{path}", self.port),
            });
        }
        candidates
    }

    /// Walk the candidate chain for `path`.
    ///
    /// The first non-404 response wins. If every candidate answered 404 or
    /// failed, the earliest 404 is returned; if none answered at all the
    /// outcome is a transport failure.
    pub async fn fetch(
        &self,
        fetcher: &dyn LocalFetcher,
        path: &str,
        path_type: PathType,
        request: &LocalRequest,
    ) -> ResolveOutcome {
        let mut best: Option<LocalResponse> = None;
        for candidate in self.http_candidates(path, path_type) {
            match attempt(fetcher, &candidate, request).await {
                Ok(response) if response.status != 404 => {
                    return ResolveOutcome::Response(response);
                }
                Ok(response) => {
                    debug!(url = %candidate.url, "Local {} candidate returned 404", candidate.label);
                    if best.is_none() {
                        best = Some(response);
                    }
                }
                Err(e) => info!("Local {} candidate failed: {e}", candidate.label),
            }
        }
        match best {
            Some(response) => ResolveOutcome::Response(response),
            None => {
                warn!("All local candidates failed for {path}");
                ResolveOutcome::TransportFailure
            }
        }
    }
}

/// One candidate; a 431 (headers too large) is retried without headers.
async fn attempt(
    fetcher: &dyn LocalFetcher,
    candidate: &Candidate,
    request: &LocalRequest,
) -> Result<LocalResponse, FetchError> {
    let response = fetcher.fetch(&candidate.url, request).await?;
    if response.status != 431 {
        return Ok(response);
    }
    info!(url = %candidate.url, "Local call returned 431, retrying with no headers");
    let bare = LocalRequest {
        headers: Vec::new(),
        ..request.clone()
    };
    fetcher.fetch(&candidate.url, &bare).await
}

/// The address this machine would use to reach the wider network.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for a route.
fn detect_lan_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.254.254.254:1").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4.to_string()),
        _ => None,
    }
}
