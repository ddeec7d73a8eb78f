//! Client configuration.
//!
//! Values are resolved in order: built-in defaults, an optional TOML file,
//! then `GCOMP_*` environment variables.

use super::env::{EnvError, EnvParser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default OID of the subject attribute carrying project attributes.
pub const DEFAULT_PROJECT_ATTRIBUTES_OID: &str = "1.3.6.1.4.1.47195.1.1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub job_server: JobServerConfig,
    pub timeouts: TimeoutConfig,
    pub state: StateConfig,
    pub sandbox: SandboxConfig,
    /// Retry failed fetches on a short fixed interval.
    pub test_mode: bool,
}

/// Where and how jobs are requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobServerConfig {
    pub scheme: String,
    pub address: String,
    pub port: u16,
    pub job_path: String,
    pub report_path: String,
    pub category: String,
    pub project_attributes_oid: String,
    /// Base URL replacing `https://s3-{region}.amazonaws.com` for storage jobs.
    pub storage_endpoint: Option<String>,
    /// `Authorization` header sent with script requests.
    pub script_authorization: Option<String>,
    pub accept_invalid_certs: bool,
}

impl Default for JobServerConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            address: "jobs.gcomp.org".to_string(),
            port: 443,
            job_path: "/getjob".to_string(),
            report_path: "/report".to_string(),
            category: "default".to_string(),
            project_attributes_oid: DEFAULT_PROJECT_ATTRIBUTES_OID.to_string(),
            storage_endpoint: None,
            script_authorization: None,
            accept_invalid_certs: true,
        }
    }
}

impl JobServerConfig {
    /// Base URL of the job server, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.address, self.port)
    }

    pub fn job_url(&self) -> String {
        format!("{}{}", self.base_url(), self.job_path)
    }

    pub fn report_url(&self) -> String {
        format!("{}{}", self.base_url(), self.report_path)
    }
}

/// Timeouts and retry bounds, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_ms: u64,
    pub pause_job_ms: u64,
    pub term_job_ms: u64,
    pub now_try_ms: u64,
    pub min_try_ms: u64,
    pub max_try_ms: u64,
    pub test_mode_try_ms: u64,
    pub startup_delay_ms: u64,
    pub sandbox_request_ms: u64,
    pub sandbox_start_delay_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 60_000,
            pause_job_ms: 20_000,
            term_job_ms: 10_000,
            now_try_ms: 0,
            min_try_ms: 1_000,
            max_try_ms: 3_600_000,
            test_mode_try_ms: 2_000,
            startup_delay_ms: 0,
            sandbox_request_ms: 30_000,
            sandbox_start_delay_ms: 200,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn pause_job(&self) -> Duration {
        Duration::from_millis(self.pause_job_ms)
    }

    pub fn term_job(&self) -> Duration {
        Duration::from_millis(self.term_job_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Local files holding a paused job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub script_file: String,
    pub attributes_file: String,
    pub context_file: String,
    pub certificate_file: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        let dir = dirs::data_local_dir()
            .map(|d| d.join("gcomp"))
            .unwrap_or_else(|| PathBuf::from(".gcomp"));
        Self {
            dir,
            script_file: "job_script".to_string(),
            attributes_file: "job_attributes.json".to_string(),
            context_file: "job_script_context.json".to_string(),
            certificate_file: "project_certificate.pem".to_string(),
        }
    }
}

impl StateConfig {
    pub fn script_path(&self) -> PathBuf {
        self.dir.join(&self.script_file)
    }

    pub fn attributes_path(&self) -> PathBuf {
        self.dir.join(&self.attributes_file)
    }

    pub fn context_path(&self) -> PathBuf {
        self.dir.join(&self.context_file)
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.dir.join(&self.certificate_file)
    }
}

/// How the sandbox process is launched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Sandbox executable; defaults to `gcomp-sandbox` next to the client binary.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl SandboxConfig {
    /// Resolve the sandbox executable.
    pub fn resolve_program(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }
        std::env::current_exe()
            .map(|exe| exe.with_file_name(sandbox_binary_name()))
            .unwrap_or_else(|_| PathBuf::from(sandbox_binary_name()))
    }
}

fn sandbox_binary_name() -> &'static str {
    if cfg!(windows) {
        "gcomp-sandbox.exe"
    } else {
        "gcomp-sandbox"
    }
}

impl ClientConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override values with `GCOMP_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut env = EnvParser::new();

        let server = &mut self.job_server;
        server.scheme = env.get_string("JOB_SERVER_SCHEME", &server.scheme).value;
        server.address = env.get_string("JOB_SERVER_ADDRESS", &server.address).value;
        server.port = env.get_port("JOB_SERVER_PORT", server.port).value;
        server.job_path = env.get_string("JOB_PATH", &server.job_path).value;
        server.report_path = env.get_string("REPORT_PATH", &server.report_path).value;
        server.category = env.get_string("JOB_CATEGORY", &server.category).value;
        server.project_attributes_oid = env
            .get_string("PROJECT_ATTRIBUTES_OID", &server.project_attributes_oid)
            .value;
        env.get_optional_string("STORAGE_ENDPOINT")
            .apply_to(&mut server.storage_endpoint);
        env.get_optional_string("SCRIPT_AUTHORIZATION")
            .apply_to(&mut server.script_authorization);
        server.accept_invalid_certs = env
            .get_bool("ACCEPT_INVALID_CERTS", server.accept_invalid_certs)
            .value;

        let timeouts = &mut self.timeouts;
        timeouts.request_ms = env.get_duration_ms("REQUEST_TIMEOUT", timeouts.request_ms).value;
        timeouts.pause_job_ms = env
            .get_duration_ms("PAUSE_JOB_TIMEOUT", timeouts.pause_job_ms)
            .value;
        timeouts.term_job_ms = env
            .get_duration_ms("TERM_JOB_TIMEOUT", timeouts.term_job_ms)
            .value;
        timeouts.min_try_ms = env.get_duration_ms("MIN_TRY", timeouts.min_try_ms).value;
        timeouts.max_try_ms = env.get_duration_ms("MAX_TRY", timeouts.max_try_ms).value;
        timeouts.startup_delay_ms = env
            .get_duration_ms("STARTUP_DELAY", timeouts.startup_delay_ms)
            .value;

        if let Some(dir) = env.get_optional_path("STATE_DIR", false).value {
            self.state.dir = dir;
        }

        let program = env.get_optional_path("SANDBOX_PROGRAM", true);
        if program.is_set() {
            self.sandbox.program = program.value;
        }

        self.test_mode = env.get_bool("TEST_MODE", self.test_mode).value;

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(())
    }
}
