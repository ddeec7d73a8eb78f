//! Core domain types shared between the client and the sandbox.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code of a sandbox whose job ran to completion.
pub const EXIT_FINISHED: i32 = 0;
/// Exit code of a sandbox that detected a capability violation.
pub const EXIT_VIOLATION: i32 = 1;
/// Exit code of a sandbox that failed to load or run the job module.
pub const EXIT_RUNTIME_ERROR: i32 = 2;
/// Exit code of a sandbox that stopped on request.
///
/// Matches the conventional `128 + SIGTERM` so a stopped sandbox reads the
/// same as one terminated by the operating system.
pub const EXIT_STOPPED: i32 = 143;

/// Kind of capability violation detected inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Outbound connection to a prohibited host.
    Host,
    /// Import from a namespace outside the capability allow-list.
    RequireModule,
    /// Saved context larger than the job's storage limit.
    ContextLength,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::RequireModule => write!(f, "require_module"),
            Self::ContextLength => write!(f, "context_length"),
        }
    }
}

/// A detected attempt by job code to exceed its granted capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub violation: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn host(host: &str) -> Self {
        Self {
            violation: ViolationKind::Host,
            message: format!("Tried to connect to prohibited host: {host}"),
        }
    }

    pub fn require_module(name: &str) -> Self {
        Self {
            violation: ViolationKind::RequireModule,
            message: format!("Tried to load non-allowed module: {name}"),
        }
    }

    pub fn context_length(length: usize) -> Self {
        Self {
            violation: ViolationKind::ContextLength,
            message: format!("Max context length exceeded: {length}"),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation: {}", self.violation, self.message)
    }
}

/// Research metadata a job publishes for display by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<serde_json::Value>,
}

/// Platform constants injected into every job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform: String,
    pub os_version: String,
    pub arch: String,
}
