//! Capabilities a job may import.
//!
//! A job module reaches the outside world only through imports. Each import
//! names a namespace; the namespaces below are the complete allow-list and
//! everything else is a `require_module` violation.

use crate::netpolicy::{self, CheckedUrl, PolicyError, Resolve};
use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Namespace of the job's own interface with the sandbox, always linked.
pub const JOB_NAMESPACE: &str = "job";

/// An allow-listed capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SecureTransport,
    ContextRead,
    Compression,
    UrlParsing,
    Physics,
    Crypto,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::SecureTransport,
        Capability::ContextRead,
        Capability::Compression,
        Capability::UrlParsing,
        Capability::Physics,
        Capability::Crypto,
    ];

    /// Import namespace of this capability.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::SecureTransport => "https",
            Self::ContextRead => "read_context",
            Self::Compression => "zlib",
            Self::UrlParsing => "url",
            Self::Physics => "openmm",
            Self::Crypto => "crypto",
        }
    }

    pub fn from_namespace(namespace: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.namespace() == namespace)
    }
}

/// Whether a job may import from `namespace`.
pub fn is_allowed_namespace(namespace: &str) -> bool {
    namespace == JOB_NAMESPACE || Capability::from_namespace(namespace).is_some()
}

// ── Secure transport ───────────────────────────────────────────────────────

/// Request accepted by `https.request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpsRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response returned by `https.request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpsResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination is prohibited; always a violation.
    #[error("prohibited host: {0}")]
    Prohibited(String),

    #[error("request rejected: {0}")]
    Rejected(PolicyError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(String),
}

/// Outbound HTTPS with destination checks and a fixed timeout.
///
/// Each request gets a client pinned to the addresses the policy vetted,
/// with redirects disabled.
pub struct SecureTransport {
    timeout: Duration,
    resolve: Resolve,
}

impl SecureTransport {
    pub fn new(timeout: Duration) -> Self {
        Self::with_resolver(timeout, netpolicy::system_resolve)
    }

    pub fn with_resolver(timeout: Duration, resolve: Resolve) -> Self {
        Self { timeout, resolve }
    }

    fn client(&self, checked: &CheckedUrl) -> Result<Client, TransportError> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .redirect(Policy::none());
        if let Some(domain) = checked.domain() {
            builder = builder.resolve_to_addrs(domain, &checked.addrs);
        }
        builder
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    pub fn request(&self, request: &HttpsRequest) -> Result<HttpsResponse, TransportError> {
        let checked = netpolicy::check_url_with(&request.url, self.resolve).map_err(|e| match e {
            PolicyError::Prohibited(host) => TransportError::Prohibited(host),
            other => TransportError::Rejected(other),
        })?;
        debug!(method = %request.method, url = %checked.url, addrs = ?checked.addrs, "job https request");

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransportError::Request(format!("unsupported method {}", request.method)))?;
        let mut builder = self.client(&checked)?.request(method, checked.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Request(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(HttpsResponse {
            status,
            headers,
            body,
        })
    }
}

// ── Context read ───────────────────────────────────────────────────────────

/// Reads the job's saved context.
#[derive(Debug, Clone)]
pub struct ContextReader {
    path: PathBuf,
}

impl ContextReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parsed context, or `None` when the file is missing or not JSON.
    pub fn read(&self) -> Option<serde_json::Value> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }
}

// ── Compression, URL parsing, crypto ──────────────────────────────────────

pub use gcomp_common::compress::{gunzip, gzip};

/// Components of a URL as JSON.
pub fn parse_url(raw: &str) -> Result<serde_json::Value, url::ParseError> {
    let url = url::Url::parse(raw)?;
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    Ok(serde_json::json!({
        "href": url.as_str(),
        "protocol": format!("{}:", url.scheme()),
        "host": url.host_str(),
        "port": url.port_or_known_default(),
        "pathname": url.path(),
        "query": query,
        "hash": url.fragment(),
    }))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Physics ────────────────────────────────────────────────────────────────

/// Native simulation engine exposed under the `openmm` namespace.
///
/// No engine ships with the sandbox; jobs importing `openmm` only link when
/// one is provided.
pub trait PhysicsBinding: Send {
    fn call(&mut self, request: serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Everything injected into a job.
pub struct Capabilities {
    pub transport: SecureTransport,
    pub context: ContextReader,
    pub physics: Option<Box<dyn PhysicsBinding>>,
}

impl Capabilities {
    pub fn new(request_timeout: Duration, context_path: impl Into<PathBuf>) -> Self {
        Self {
            transport: SecureTransport::new(request_timeout),
            context: ContextReader::new(context_path),
            physics: None,
        }
    }

    pub fn with_physics(mut self, binding: Box<dyn PhysicsBinding>) -> Self {
        self.physics = Some(binding);
        self
    }
}
