//! Configuration system for the GComp client.
//!
//! - Environment variable parsing with type safety
//! - TOML configuration file support
//! - Source tracking for debugging

pub mod client;
pub mod env;
pub mod source;

pub use client::{
    ClientConfig, ConfigError, DEFAULT_PROJECT_ATTRIBUTES_OID, JobServerConfig, SandboxConfig,
    StateConfig, TimeoutConfig,
};
pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
