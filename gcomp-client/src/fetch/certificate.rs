//! Project attributes embedded in the project certificate.
//!
//! The project signs its certificate with a subject attribute, under a
//! project-specific OID, whose value is a JSON object of project attributes.

use super::FetchError;
use super::description::ProjectAttributes;
use serde_json::Value;
use x509_parser::pem::parse_x509_pem;

const REQUIRED_KEYS: [&str; 7] = [
    "server_address",
    "server_port",
    "category",
    "max_job_count",
    "run_time_limit",
    "execution_time_limit",
    "storage_limit",
];

/// Raw value of the subject attribute `oid` in a PEM certificate.
pub fn subject_attribute(pem: &str, oid: &str) -> Result<String, FetchError> {
    let (_, pem) =
        parse_x509_pem(pem.as_bytes()).map_err(|e| FetchError::BadCertificate(e.to_string()))?;
    let certificate = pem
        .parse_x509()
        .map_err(|e| FetchError::BadCertificate(e.to_string()))?;

    let attribute = certificate
        .subject()
        .iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == oid)
        .ok_or_else(|| {
            FetchError::MalformedProjectAttributes(format!("subject has no attribute {oid}"))
        })?;
    let value = attribute
        .as_str()
        .map_err(|e| FetchError::MalformedProjectAttributes(e.to_string()))?;
    Ok(value.to_string())
}

/// Project attributes from the project certificate.
pub fn project_attributes(pem: &str, oid: &str) -> Result<ProjectAttributes, FetchError> {
    let raw = subject_attribute(pem, oid)?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| FetchError::MalformedProjectAttributes(e.to_string()))?;

    if let Some(missing) = REQUIRED_KEYS.iter().find(|key| value.get(**key).is_none()) {
        return Err(FetchError::MalformedProjectAttributes(format!(
            "missing {missing}"
        )));
    }
    serde_json::from_value(value).map_err(|e| FetchError::MalformedProjectAttributes(e.to_string()))
}
