//! Pause/resume persistence for the current job.
//!
//! A job in flight is kept as four files in the state directory: the script,
//! its attributes, the last saved context and the project certificate. Only
//! the script and the attributes are needed to resume.

use chrono::{DateTime, Utc};
use gcomp_common::config::StateConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("job attributes are malformed: {0}")]
    Attributes(#[from] serde_json::Error),
}

impl PersistError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Attributes stored next to the job script.
///
/// Times are milliseconds, the storage limit is in MiB. Keys of the project
/// attributes that the client does not interpret are kept as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_run_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<f64>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// A job that can be resumed.
#[derive(Debug, Clone, PartialEq)]
pub struct PausedJob {
    pub script: Vec<u8>,
    /// Time left before the job must be cancelled.
    pub run_budget: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveContextOutcome {
    Saved,
    /// Context of `length` bytes is over the storage limit and was not written.
    Exceeded { length: usize },
}

/// File-backed store for the paused job.
#[derive(Debug, Clone)]
pub struct PauseStore {
    state: StateConfig,
}

impl PauseStore {
    pub fn new(state: StateConfig) -> Self {
        Self { state }
    }

    pub fn dir(&self) -> &Path {
        &self.state.dir
    }

    pub fn context_path(&self) -> PathBuf {
        self.state.context_path()
    }

    pub fn ensure_dir(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.state.dir).map_err(|e| PersistError::io(&self.state.dir, e))
    }

    /// The paused job, if one is still within its time limits at `now`.
    ///
    /// Never fails: anything unreadable means there is nothing to resume.
    pub fn paused_job(&self, now: DateTime<Utc>) -> Option<PausedJob> {
        let script = fs::read(self.state.script_path()).ok()?;
        let attributes = match self.read_attributes() {
            Ok(attributes) => attributes,
            Err(e) => {
                debug!(error = %e, "paused job attributes unreadable");
                return None;
            }
        };
        let expiry = attributes.expiry_date?;
        let remaining = attributes.remaining_run_time?;

        let until_expiry = expiry.saturating_sub(now.timestamp_millis());
        if until_expiry <= 0 || remaining <= 0.0 {
            debug!(until_expiry, remaining, "paused job is out of time");
            return None;
        }

        let budget_ms = (until_expiry as f64).min(remaining);
        Some(PausedJob {
            script,
            run_budget: Duration::from_millis(budget_ms as u64),
        })
    }

    /// Remove every persisted file, ignoring ones that are absent.
    pub fn clear(&self) {
        for path in [
            self.state.script_path(),
            self.state.attributes_path(),
            self.state.context_path(),
            self.state.certificate_path(),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove job state"),
            }
        }
    }

    pub fn read_attributes(&self) -> Result<PersistedAttributes, PersistError> {
        let path = self.state.attributes_path();
        let text = fs::read_to_string(&path).map_err(|e| PersistError::io(&path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_attributes(&self, attributes: &PersistedAttributes) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec(attributes)?;
        write_atomic(&self.state.attributes_path(), &bytes)
    }

    /// Charge `elapsed` run time against the paused job.
    ///
    /// Does nothing when no attributes are stored.
    pub fn decrement_remaining_run_time(&self, elapsed: Duration) -> Result<(), PersistError> {
        if !self.state.attributes_path().exists() {
            return Ok(());
        }
        let mut attributes = self.read_attributes()?;
        let remaining = attributes.remaining_run_time.unwrap_or_default();
        let updated = remaining - elapsed.as_millis() as f64;
        attributes.remaining_run_time = Some(updated);
        self.write_attributes(&attributes)?;
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            remaining_ms = updated,
            "charged run time to paused job"
        );
        Ok(())
    }

    /// Persist a freshly received job.
    ///
    /// The attributes are written last, so an interrupted save never leaves a
    /// resumable job behind.
    pub fn save_job(
        &self,
        script: &[u8],
        attributes: &PersistedAttributes,
        certificate: Option<&str>,
    ) -> Result<(), PersistError> {
        self.ensure_dir()?;
        write_atomic(&self.state.script_path(), script)?;
        if let Some(certificate) = certificate {
            write_atomic(&self.state.certificate_path(), certificate.as_bytes())?;
        }
        self.write_attributes(attributes)?;
        debug!(script_bytes = script.len(), "job persisted");
        Ok(())
    }

    /// Store the job's context if it fits in the storage limit.
    pub fn save_context(&self, context: &Value) -> Result<SaveContextOutcome, PersistError> {
        let attributes = self.read_attributes()?;
        let text = serde_json::to_string(context)?;
        let limit = attributes.storage_limit.unwrap_or_default();
        if text.len() as f64 / MIB > limit {
            return Ok(SaveContextOutcome::Exceeded { length: text.len() });
        }
        write_atomic(&self.state.context_path(), text.as_bytes())?;
        Ok(SaveContextOutcome::Saved)
    }

    /// Certificate of the project the current job belongs to.
    pub fn project_certificate(&self) -> Option<String> {
        fs::read_to_string(self.state.certificate_path()).ok()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, bytes).map_err(|e| PersistError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PersistError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, PauseStore) {
        let dir = TempDir::new().unwrap();
        let state = StateConfig {
            dir: dir.path().to_path_buf(),
            ..StateConfig::default()
        };
        (dir, PauseStore::new(state))
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn attributes(remaining: f64, expiry: i64, storage: f64) -> PersistedAttributes {
        PersistedAttributes {
            remaining_run_time: Some(remaining),
            expiry_date: Some(expiry),
            storage_limit: Some(storage),
            rest: Map::new(),
        }
    }

    #[test]
    fn test_paused_job_budget_is_min_of_expiry_and_remaining() {
        let (_dir, store) = store();
        store
            .save_job(b"(module)", &attributes(5_000.0, 1_000_000, 10.0), None)
            .unwrap();

        let job = store.paused_job(at(990_000)).unwrap();
        assert_eq!(job.script, b"(module)");
        assert_eq!(job.run_budget, Duration::from_millis(5_000));

        let job = store.paused_job(at(998_000)).unwrap();
        assert_eq!(job.run_budget, Duration::from_millis(2_000));
    }

    #[test]
    fn test_no_paused_job_when_out_of_time() {
        let (_dir, store) = store();
        store
            .save_job(b"(module)", &attributes(0.0, 1_000_000, 10.0), None)
            .unwrap();
        assert!(store.paused_job(at(0)).is_none());

        store
            .save_job(b"(module)", &attributes(100.0, 1_000_000, 10.0), None)
            .unwrap();
        assert!(store.paused_job(at(1_000_000)).is_none());
    }

    #[test]
    fn test_no_paused_job_without_script_or_attributes() {
        let (_dir, store) = store();
        assert!(store.paused_job(at(0)).is_none());

        fs::write(store.state.script_path(), b"(module)").unwrap();
        assert!(store.paused_job(at(0)).is_none());

        fs::write(store.state.attributes_path(), b"{not json").unwrap();
        assert!(store.paused_job(at(0)).is_none());

        fs::write(store.state.attributes_path(), br#"{"remaining_run_time": 10}"#).unwrap();
        assert!(store.paused_job(at(0)).is_none());
    }

    #[test]
    fn test_clear_removes_everything_and_tolerates_absence() {
        let (_dir, store) = store();
        store
            .save_job(b"(module)", &attributes(1.0, 2, 3.0), Some("CERT"))
            .unwrap();
        store.save_context(&json!({})).unwrap();

        store.clear();
        assert!(!store.state.script_path().exists());
        assert!(!store.state.attributes_path().exists());
        assert!(!store.state.context_path().exists());
        assert!(!store.state.certificate_path().exists());

        store.clear();
    }

    #[test]
    fn test_decrement_remaining_run_time() {
        let (_dir, store) = store();
        store
            .save_job(b"(module)", &attributes(10_000.0, 5, 1.0), None)
            .unwrap();
        store
            .decrement_remaining_run_time(Duration::from_millis(2_500))
            .unwrap();
        let attrs = store.read_attributes().unwrap();
        assert_eq!(attrs.remaining_run_time, Some(7_500.0));
        assert_eq!(attrs.expiry_date, Some(5));
    }

    #[test]
    fn test_decrement_without_attributes_is_noop() {
        let (_dir, store) = store();
        store
            .decrement_remaining_run_time(Duration::from_secs(1))
            .unwrap();
        assert!(!store.state.attributes_path().exists());
    }

    #[test]
    fn test_decrement_with_corrupt_attributes_fails() {
        let (_dir, store) = store();
        fs::write(store.state.attributes_path(), b"[").unwrap();
        assert!(matches!(
            store.decrement_remaining_run_time(Duration::from_secs(1)),
            Err(PersistError::Attributes(_))
        ));
    }

    #[test]
    fn test_unknown_attribute_keys_survive() {
        let (_dir, store) = store();
        let mut attrs = attributes(1.0, 2, 3.0);
        attrs.rest.insert("category".to_string(), json!("proteins"));
        store.save_job(b"x", &attrs, None).unwrap();
        store
            .decrement_remaining_run_time(Duration::from_millis(1))
            .unwrap();
        let reread = store.read_attributes().unwrap();
        assert_eq!(reread.rest["category"], "proteins");
    }

    #[test]
    fn test_save_context_respects_storage_limit() {
        let (_dir, store) = store();
        store
            .save_job(b"x", &attributes(1.0, 2, 0.000_01), None)
            .unwrap();

        assert_eq!(
            store.save_context(&json!({"a": 1})).unwrap(),
            SaveContextOutcome::Saved
        );
        assert_eq!(
            fs::read_to_string(store.context_path()).unwrap(),
            r#"{"a":1}"#
        );

        let big = json!({"data": "x".repeat(64)});
        let length = serde_json::to_string(&big).unwrap().len();
        assert_eq!(
            store.save_context(&big).unwrap(),
            SaveContextOutcome::Exceeded { length }
        );
        assert_eq!(
            fs::read_to_string(store.context_path()).unwrap(),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn test_save_context_without_attributes_fails() {
        let (_dir, store) = store();
        assert!(store.save_context(&json!({})).is_err());
    }

    #[test]
    fn test_project_certificate() {
        let (_dir, store) = store();
        assert_eq!(store.project_certificate(), None);
        store
            .save_job(b"x", &attributes(1.0, 2, 3.0), Some("-----BEGIN CERTIFICATE-----"))
            .unwrap();
        assert_eq!(
            store.project_certificate().as_deref(),
            Some("-----BEGIN CERTIFICATE-----")
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_resume_eligibility_is_monotonic_in_time(
            remaining in 0.0f64..1e9,
            expiry in 0i64..1_000_000_000,
            t1 in 0i64..1_000_000_000,
            dt in 0i64..1_000_000_000,
        ) {
            let (_dir, store) = store();
            store.save_job(b"x", &attributes(remaining, expiry, 1.0), None).unwrap();
            let earlier = store.paused_job(at(t1)).is_some();
            let later = store.paused_job(at(t1 + dt)).is_some();
            prop_assert!(earlier || !later);
        }
    }
}
