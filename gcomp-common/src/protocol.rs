//! Wire protocols of the GComp client.
//!
//! Three newline-delimited JSON streams exist:
//!
//! - host ↔ client, over the client's standard I/O ([`HostCommand`], [`ClientMessage`]);
//! - client → sandbox, over the sandbox's standard input ([`SandboxInput`]);
//! - sandbox → client, over the sandbox's standard output ([`JobEvent`]).

use crate::types::{PlatformInfo, ResearchDetails, Violation};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Empty `{}` content carried by several messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// ── Host → Client ──────────────────────────────────────────────────────────

/// Command received from the host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "content", rename_all = "snake_case")]
pub enum HostCommand {
    /// Credentials and platform identity for this client.
    Key(KeyContent),
    /// Stop the client, immediately or after pausing the job.
    Kill(KillMode),
    /// Cancel a pending graceful kill and resume the job.
    Continue(Empty),
}

/// Identity delivered with the `key` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    #[serde(default)]
    pub key: Option<String>,
    pub uuid: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub arch: String,
}

impl KeyContent {
    pub fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            platform: self.platform.clone(),
            os_version: self.os_version.clone(),
            arch: self.arch.clone(),
        }
    }
}

/// How a `kill` command should stop the client.
///
/// The host sends the literal string `"SIGKILL"` for an immediate kill; any
/// other content requests the graceful pause-then-escalate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum KillMode {
    Immediate,
    Graceful,
}

impl From<serde_json::Value> for KillMode {
    fn from(value: serde_json::Value) -> Self {
        match value.as_str() {
            Some("SIGKILL") => Self::Immediate,
            _ => Self::Graceful,
        }
    }
}

impl From<KillMode> for serde_json::Value {
    fn from(mode: KillMode) -> Self {
        match mode {
            KillMode::Immediate => serde_json::Value::from("SIGKILL"),
            KillMode::Graceful => serde_json::Value::from("SIGTERM"),
        }
    }
}

// ── Client → Host ──────────────────────────────────────────────────────────

/// Message sent from the client to the host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "content", rename_all = "snake_case")]
pub enum ClientMessage {
    GetKey(Empty),
    KeyAccepted(Empty),
    ExecutingJob(Empty),
    JobFinished { exit_code: i32 },
    JobExecutionError { exit_code: i32, error: String },
    JobReceived { ip_address: Option<String> },
    NumberOfUsers { number_of_users: u64 },
    ClientKilled(Empty),
    LimitStorage(Empty),
    ResearchDetails(ResearchDetails),
    DnsError { error: String },
}

impl ClientMessage {
    /// The `action` tag of this message.
    pub fn action(&self) -> &'static str {
        match self {
            Self::GetKey(_) => "get_key",
            Self::KeyAccepted(_) => "key_accepted",
            Self::ExecutingJob(_) => "executing_job",
            Self::JobFinished { .. } => "job_finished",
            Self::JobExecutionError { .. } => "job_execution_error",
            Self::JobReceived { .. } => "job_received",
            Self::NumberOfUsers { .. } => "number_of_users",
            Self::ClientKilled(_) => "client_killed",
            Self::LimitStorage(_) => "limit_storage",
            Self::ResearchDetails(_) => "research_details",
            Self::DnsError { .. } => "dns_error",
        }
    }
}

// ── Client → Sandbox ───────────────────────────────────────────────────────

/// Line written to the sandbox's standard input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxInput {
    /// First line: the job module and its environment.
    Bootstrap(Bootstrap),
    /// Every later line: a lifecycle control signal.
    Control { signal: ControlSignal },
}

/// Everything the sandbox needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Job module, WebAssembly binary or text format.
    #[serde(with = "base64_bytes")]
    pub script: Vec<u8>,
    pub platform: PlatformInfo,
    /// File read by the `read_context` capability.
    pub context_path: PathBuf,
    pub request_timeout_ms: u64,
    pub start_delay_ms: u64,
}

/// Lifecycle signal delivered to a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Continue,
    Stop,
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => write!(f, "pause"),
            Self::Continue => write!(f, "continue"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

// ── Sandbox → Client ───────────────────────────────────────────────────────

/// Structured event emitted by a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    Violation(Violation),
    SaveContext(serde_json::Value),
    ResearchDetails(ResearchDetails),
}

/// Serialize a message as one protocol line, including the trailing newline.
pub fn to_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
