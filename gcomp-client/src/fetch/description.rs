//! Job descriptions and the attributes derived from them.

use super::FetchError;
use super::certificate;
use super::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job description returned by the job server.
///
/// Exactly one shape is valid: by certificate (`path`, `client_key`,
/// `client_cert`, `project_public_certificate`) or by storage url
/// (`s3_config`). Fields are optional so that a malformed description still
/// deserializes and can be rejected with a precise error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_public_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_users: Option<u64>,
}

impl JobDescription {
    pub fn is_by_certificate(&self) -> bool {
        self.path.is_some()
            && self.client_key.is_some()
            && self.client_cert.is_some()
            && self.project_public_certificate.is_some()
    }

    pub fn is_by_storage(&self) -> bool {
        self.s3_config.is_some()
    }

    /// Exactly one shape, with the user count present.
    pub fn validate_format(&self) -> bool {
        (self.is_by_certificate() != self.is_by_storage()) && self.number_of_users().is_some()
    }

    pub fn number_of_users(&self) -> Option<u64> {
        self.statistics.as_ref().and_then(|s| s.number_of_users)
    }
}

/// Project attributes carried in the project certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAttributes {
    pub server_address: String,
    pub server_port: u16,
    pub category: Value,
    pub max_job_count: Value,
    /// Days.
    pub run_time_limit: f64,
    /// Hours.
    pub execution_time_limit: f64,
    /// MiB.
    pub storage_limit: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How the script is to be fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSource {
    ByCertificate {
        path: String,
        client_key: String,
        client_cert: String,
        project_public_certificate: String,
        attributes: ProjectAttributes,
    },
    ByStorage(StorageConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDescription {
    pub description: JobDescription,
    pub number_of_users: u64,
    pub source: JobSource,
}

/// Decode and validate a job description body.
pub fn parse_job_description(
    encoding: Option<&str>,
    body: &[u8],
    attributes_oid: &str,
) -> Result<ParsedDescription, FetchError> {
    let decoded;
    let body = if encoding.is_some_and(|e| e.eq_ignore_ascii_case("gzip")) {
        decoded = super::gunzip(body).map_err(FetchError::Decompress)?;
        decoded.as_slice()
    } else {
        body
    };

    let description: JobDescription = serde_json::from_slice(body)?;
    if !description.validate_format() {
        return Err(FetchError::MalformedDescription);
    }
    let number_of_users = description
        .number_of_users()
        .ok_or(FetchError::MalformedDescription)?;

    let source = match (&description.s3_config, description.is_by_certificate()) {
        (Some(config), false) => JobSource::ByStorage(StorageConfig::from_value(config)?),
        (None, true) => {
            let project_public_certificate = description
                .project_public_certificate
                .clone()
                .ok_or(FetchError::MalformedDescription)?;
            let attributes =
                certificate::project_attributes(&project_public_certificate, attributes_oid)?;
            JobSource::ByCertificate {
                path: description.path.clone().unwrap_or_default(),
                client_key: description.client_key.clone().unwrap_or_default(),
                client_cert: description.client_cert.clone().unwrap_or_default(),
                project_public_certificate,
                attributes,
            }
        }
        _ => return Err(FetchError::MalformedDescription),
    };

    Ok(ParsedDescription {
        description,
        number_of_users,
        source,
    })
}
