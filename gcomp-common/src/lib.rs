//! Shared types and utilities for the GComp volunteer-computing client.
//!
//! This crate carries everything both processes agree on: the host line
//! protocol, the job channel between client and sandbox, violation types,
//! configuration, and logging setup.

pub mod compress;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod types;

pub use config::{ClientConfig, ConfigError, EnvError, EnvParser};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use protocol::{
    Bootstrap, ClientMessage, ControlSignal, Empty, HostCommand, JobEvent, KeyContent, KillMode,
    SandboxInput, to_line,
};
pub use types::{
    EXIT_FINISHED, EXIT_RUNTIME_ERROR, EXIT_STOPPED, EXIT_VIOLATION, PlatformInfo,
    ResearchDetails, Violation, ViolationKind,
};
