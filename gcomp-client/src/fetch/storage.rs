//! Job scripts hosted in object storage.
//!
//! Requests are authorized with a pre-shared credential: the signature is
//! `base64(HMAC-SHA1(secret, "GET\n\n\n\nx-amz-date:{date}\n/{bucket}/{key}"))`.

use super::FetchError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_RUN_TIME_LIMIT_DAYS: f64 = 1.0;
pub const DEFAULT_EXECUTION_TIME_LIMIT_HOURS: f64 = 1.0;
pub const DEFAULT_STORAGE_LIMIT_MIB: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageCredentials {
    #[serde(rename = "accessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageParams {
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    pub request_date: String,
}

/// The `s3_config` block of a job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub credentials: StorageCredentials,
    pub params: StorageParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StorageConfig {
    pub fn from_value(value: &Value) -> Result<Self, FetchError> {
        serde_json::from_value(value.clone()).map_err(|e| FetchError::BadStorageConfig(e.to_string()))
    }

    pub fn host(&self) -> String {
        format!("s3-{}.amazonaws.com", self.credentials.region)
    }

    pub fn object_path(&self) -> String {
        format!("/{}/{}", self.params.bucket, self.params.key)
    }

    /// Object URL, against `endpoint` when one is configured.
    pub fn object_url(&self, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!("{}{}", endpoint.trim_end_matches('/'), self.object_path()),
            None => format!("https://{}{}", self.host(), self.object_path()),
        }
    }

    pub fn string_to_sign(&self) -> String {
        format!(
            "GET\n\n\n\nx-amz-date:{}\n{}",
            self.params.request_date,
            self.object_path()
        )
    }

    pub fn signature(&self) -> Result<String, FetchError> {
        let mut mac = HmacSha1::new_from_slice(self.credentials.secret_access_key.as_bytes())
            .map_err(|e| FetchError::BadStorageConfig(e.to_string()))?;
        mac.update(self.string_to_sign().as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> Result<String, FetchError> {
        Ok(format!(
            "AWS {}:{}",
            self.credentials.access_key_id,
            self.signature()?
        ))
    }

    pub fn run_time_limit_days(&self) -> f64 {
        self.run_time_limit.unwrap_or(DEFAULT_RUN_TIME_LIMIT_DAYS)
    }

    pub fn execution_time_limit_hours(&self) -> f64 {
        self.execution_time_limit
            .unwrap_or(DEFAULT_EXECUTION_TIME_LIMIT_HOURS)
    }

    pub fn storage_limit_mib(&self) -> f64 {
        self.storage_limit.unwrap_or(DEFAULT_STORAGE_LIMIT_MIB)
    }
}
