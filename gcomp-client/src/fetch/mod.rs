//! Job description and script retrieval.
//!
//! A job is acquired in three steps: a compressed job description is
//! requested from the job server, validated, and then used to download the
//! script either from the project server (by certificate) or from object
//! storage (by storage url). The script is persisted before it runs.

pub mod certificate;
pub mod client;
pub mod description;
pub mod storage;

pub use client::{DescriptionResponse, JobFetcher, JobRequest, ViolationReport};
pub use description::{JobDescription, JobSource, ParsedDescription, ProjectAttributes, Statistics};
pub use storage::StorageConfig;

use crate::host::HostSender;
use crate::persistence::{MIB, PauseStore, PersistError, PersistedAttributes};
use chrono::{DateTime, Utc};
use gcomp_common::ClientMessage;
use serde_json::{Map, Value};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const HOUR_MS: f64 = 3_600_000.0;
const DAY_MS: f64 = 86_400_000.0;
/// Upper bound on a limit in its stored unit (milliseconds or MiB).
const MAX_LIMIT: f64 = 1e15;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded with status {status}")]
    Status { status: u16 },

    #[error("failed to decompress response: {0}")]
    Decompress(#[source] io::Error),

    #[error("failed to compress request: {0}")]
    Compress(#[source] io::Error),

    #[error("job description is not valid JSON: {0}")]
    Unparsable(#[from] serde_json::Error),

    #[error("job description in bad format")]
    MalformedDescription,

    #[error("project attributes in bad format: {0}")]
    MalformedProjectAttributes(String),

    #[error("project certificate unreadable: {0}")]
    BadCertificate(String),

    #[error("storage configuration in bad format: {0}")]
    BadStorageConfig(String),

    #[error("failed to persist job: {0}")]
    Persist(#[from] PersistError),
}

impl FetchError {
    /// Whether the server sent something the client cannot use.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::Decompress(_)
                | Self::Unparsable(_)
                | Self::MalformedDescription
                | Self::MalformedProjectAttributes(_)
                | Self::BadCertificate(_)
                | Self::BadStorageConfig(_)
        )
    }
}

pub use gcomp_common::compress::{gunzip, gzip};

/// Limits a new job is persisted with.
#[derive(Debug, Clone, PartialEq)]
struct JobLimits {
    execution_time_limit_hours: f64,
    run_time_limit_days: f64,
    storage_limit_mib: f64,
    /// Attribute keys stored as they are.
    rest: Map<String, Value>,
    by_storage: bool,
}

impl JobLimits {
    fn from_project(attributes: &ProjectAttributes) -> Result<Self, FetchError> {
        let mut rest = match serde_json::to_value(attributes) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        rest.remove("storage_limit");
        Self {
            execution_time_limit_hours: attributes.execution_time_limit,
            run_time_limit_days: attributes.run_time_limit,
            storage_limit_mib: attributes.storage_limit,
            rest,
            by_storage: false,
        }
        .validated()
    }

    fn from_storage(config: &StorageConfig) -> Result<Self, FetchError> {
        let mut rest = config.extra.clone();
        rest.insert("server_address".to_string(), Value::from(config.host()));
        rest.insert("server_port".to_string(), Value::from(443));
        rest.insert(
            "run_time_limit".to_string(),
            Value::from(config.run_time_limit_days()),
        );
        rest.insert(
            "execution_time_limit".to_string(),
            Value::from(config.execution_time_limit_hours()),
        );
        Self {
            execution_time_limit_hours: config.execution_time_limit_hours(),
            run_time_limit_days: config.run_time_limit_days(),
            storage_limit_mib: config.storage_limit_mib(),
            rest,
            by_storage: true,
        }
        .validated()
    }

    fn invalid(&self, message: String) -> FetchError {
        if self.by_storage {
            FetchError::BadStorageConfig(message)
        } else {
            FetchError::MalformedProjectAttributes(message)
        }
    }

    fn validated(self) -> Result<Self, FetchError> {
        let limits = [
            ("execution_time_limit", self.execution_time_limit_hours, HOUR_MS),
            ("run_time_limit", self.run_time_limit_days, DAY_MS),
            ("storage_limit", self.storage_limit_mib, 1.0),
        ];
        for (name, value, scale) in limits {
            if !value.is_finite() || value < 0.0 || value * scale > MAX_LIMIT {
                return Err(self.invalid(format!("{name} out of range: {value}")));
            }
        }
        Ok(self)
    }

    /// Attributes for a job received at `now`, charging the stored bytes
    /// against the storage limit.
    fn attributes(
        &self,
        now: DateTime<Utc>,
        script: &[u8],
        certificate: Option<&str>,
    ) -> Result<PersistedAttributes, FetchError> {
        let expiry_date = now
            .timestamp_millis()
            .checked_add((self.run_time_limit_days * DAY_MS) as i64)
            .ok_or_else(|| self.invalid(format!("run_time_limit out of range: {}", self.run_time_limit_days)))?;
        let mut attributes = PersistedAttributes {
            remaining_run_time: Some(self.execution_time_limit_hours * HOUR_MS),
            expiry_date: Some(expiry_date),
            storage_limit: Some(self.storage_limit_mib),
            rest: self.rest.clone(),
        };
        let attributes_len = serde_json::to_vec(&attributes).map(|v| v.len()).unwrap_or(0);
        let stored = script.len() + attributes_len + certificate.map_or(0, str::len);
        attributes.storage_limit = Some(self.storage_limit_mib - stored as f64 / MIB);
        Ok(attributes)
    }
}

/// Fetch a new job and persist it for pause/resume.
///
/// Host notifications are sent along the way: `number_of_users` before the
/// script is requested, then `job_received` (or `dns_error`), and
/// `limit_storage` if the job cannot be persisted.
pub async fn acquire_job(
    fetcher: &JobFetcher,
    request: &JobRequest,
    store: &PauseStore,
    host: &HostSender,
) -> Result<Vec<u8>, FetchError> {
    let response = fetcher.get_job_description(request).await?;
    let parsed = fetcher.parse_job_description(response.encoding.as_deref(), &response.body)?;
    info!(
        number_of_users = parsed.number_of_users,
        by_storage = matches!(parsed.source, JobSource::ByStorage(_)),
        "job description received"
    );
    host.send(ClientMessage::NumberOfUsers {
        number_of_users: parsed.number_of_users,
    });

    let (script, limits, certificate) = match &parsed.source {
        JobSource::ByCertificate {
            path,
            client_key,
            client_cert,
            project_public_certificate,
            attributes,
        } => {
            let limits = JobLimits::from_project(attributes)?;
            let script = fetcher
                .get_job(path, client_cert, client_key, attributes)
                .await?;
            host.send(ClientMessage::JobReceived {
                ip_address: response.remote_addr.map(|addr| addr.ip().to_string()),
            });
            (script, limits, Some(project_public_certificate.as_str()))
        }
        JobSource::ByStorage(config) => {
            let limits = JobLimits::from_storage(config)?;
            match fetcher.resolve_storage_host(config).await {
                Ok(ip) => host.send(ClientMessage::JobReceived {
                    ip_address: Some(ip.to_string()),
                }),
                Err(e) => {
                    warn!(error = %e, "storage host lookup failed");
                    host.send(ClientMessage::DnsError {
                        error: e.to_string(),
                    });
                }
            }
            let script = fetcher.get_storage_job(config).await?;
            (script, limits, None)
        }
    };

    store.clear();
    let attributes = limits.attributes(Utc::now(), &script, certificate)?;
    if let Err(e) = store.save_job(&script, &attributes, certificate) {
        warn!(error = %e, "failed to persist job");
        host.send(ClientMessage::LimitStorage(Default::default()));
        return Err(e.into());
    }
    info!(script_bytes = script.len(), "job acquired");
    Ok(script)
}
