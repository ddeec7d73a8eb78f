//! HTTP side of the fetch protocol.

use super::description::{ParsedDescription, ProjectAttributes, parse_job_description};
use super::storage::StorageConfig;
use super::{FetchError, gunzip, gzip};
use gcomp_common::Violation;
use gcomp_common::config::JobServerConfig;
use reqwest::header::{ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONTENT_ENCODING, HeaderMap};
use reqwest::{Client, Identity, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info};

/// Body of the job description request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub category: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub app_version: String,
    pub app_platform: String,
    pub os_version: String,
    pub arch: String,
}

/// Raw job description as received.
#[derive(Debug, Clone)]
pub struct DescriptionResponse {
    pub encoding: Option<String>,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

/// Body of a violation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationReport {
    #[serde(flatten)]
    pub violation: Violation,
    pub project_public_certificate: Option<String>,
}

/// Client for the job server, project servers and object storage.
#[derive(Debug, Clone)]
pub struct JobFetcher {
    http: Client,
    server: JobServerConfig,
    timeout: Duration,
}

impl JobFetcher {
    pub fn new(server: JobServerConfig, timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(server.accept_invalid_certs)
            .build()
            .map_err(FetchError::Transport)?;
        Ok(Self {
            http,
            server,
            timeout,
        })
    }

    pub fn server(&self) -> &JobServerConfig {
        &self.server
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(err)
        }
    }

    fn check_status(response: &Response) -> Result<(), FetchError> {
        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(FetchError::Status {
                status: response.status().as_u16(),
            })
        }
    }

    async fn decoded_body(&self, response: Response) -> Result<Vec<u8>, FetchError> {
        let gzipped = content_encoding(response.headers()).is_some_and(|e| e.eq_ignore_ascii_case("gzip"));
        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        if gzipped {
            gunzip(&body).map_err(FetchError::Decompress)
        } else {
            Ok(body.to_vec())
        }
    }

    /// POST the compressed job request to the job server.
    pub async fn get_job_description(
        &self,
        request: &JobRequest,
    ) -> Result<DescriptionResponse, FetchError> {
        let body = gzip(&serde_json::to_vec(request)?).map_err(FetchError::Compress)?;
        let url = self.server.job_url();
        debug!(%url, "requesting job description");

        let response = self
            .http
            .post(&url)
            .header(CONTENT_ENCODING, "gzip")
            .header(ACCEPT_ENCODING, "gzip")
            .header(CACHE_CONTROL, "no-cache")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        Self::check_status(&response)?;

        let encoding = content_encoding(response.headers()).map(str::to_string);
        let remote_addr = response.remote_addr();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        Ok(DescriptionResponse {
            encoding,
            body: body.to_vec(),
            remote_addr,
        })
    }

    pub fn parse_job_description(
        &self,
        encoding: Option<&str>,
        body: &[u8],
    ) -> Result<ParsedDescription, FetchError> {
        parse_job_description(encoding, body, &self.server.project_attributes_oid)
    }

    /// GET the script from the project server named in the attributes.
    pub async fn get_job(
        &self,
        path: &str,
        client_cert: &str,
        client_key: &str,
        attributes: &ProjectAttributes,
    ) -> Result<Vec<u8>, FetchError> {
        let identity_pem = format!("{client_cert}\n{client_key}");
        let identity = Identity::from_pem(identity_pem.as_bytes())
            .map_err(|e| FetchError::BadCertificate(e.to_string()))?;
        let http = Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.server.accept_invalid_certs)
            .identity(identity)
            .build()
            .map_err(FetchError::Transport)?;

        let url = format!(
            "{}://{}:{}{}",
            self.server.scheme, attributes.server_address, attributes.server_port, path
        );
        info!(%url, "downloading job script");
        let mut request = http.get(&url).header(ACCEPT_ENCODING, "gzip");
        if let Some(token) = &self.server.script_authorization {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().await.map_err(|e| self.classify(e))?;
        Self::check_status(&response)?;
        self.decoded_body(response).await
    }

    /// Address of the storage host, for the `job_received` notification.
    pub async fn resolve_storage_host(&self, config: &StorageConfig) -> std::io::Result<IpAddr> {
        let url = config.object_url(self.server.storage_endpoint.as_deref());
        let parsed = url::Url::parse(&url)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(443);
        let addr = tokio::net::lookup_host((host.as_str(), port)).await?.next();
        addr.map(|addr| addr.ip())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, host))
    }

    /// GET the script from object storage with a signed request.
    pub async fn get_storage_job(&self, config: &StorageConfig) -> Result<Vec<u8>, FetchError> {
        let url = config.object_url(self.server.storage_endpoint.as_deref());
        info!(%url, "downloading job script from storage");
        let response = self
            .http
            .get(&url)
            .header("X-Amz-Date", &config.params.request_date)
            .header(AUTHORIZATION, config.authorization()?)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        Self::check_status(&response)?;
        self.decoded_body(response).await
    }

    /// POST a compressed violation report to the job server.
    pub async fn report_violation(&self, report: &ViolationReport) -> Result<(), FetchError> {
        let body = gzip(&serde_json::to_vec(report)?).map_err(FetchError::Compress)?;
        let response = self
            .http
            .post(self.server.report_url())
            .header(CONTENT_ENCODING, "gzip")
            .header(ACCEPT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        Self::check_status(&response)?;
        info!(violation = %report.violation.violation, "violation reported");
        Ok(())
    }
}

fn content_encoding(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok())
}
