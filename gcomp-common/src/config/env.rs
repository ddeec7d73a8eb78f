//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `GCOMP_` environment variables with
//! validation, error collection, and source tracking.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Path does not exist.
    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the GCOMP_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "GCOMP_",
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<u64>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a TCP port.
    pub fn get_port(&mut self, name: &str, default: u16) -> Sourced<u16> {
        let sourced = self.get_u64_range(name, u64::from(default), 1, u64::from(u16::MAX));
        Sourced {
            value: u16::try_from(sourced.value).unwrap_or(default),
            source: sourced.source,
            env_var: sourced.env_var,
        }
    }

    /// Get a duration in milliseconds.
    ///
    /// Accepts a bare integer (milliseconds) or a humantime string such as
    /// `"20s"` or `"1h 30m"`.
    pub fn get_duration_ms(&mut self, name: &str, default_ms: u64) -> Sourced<u64> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match parse_duration_ms(&value) {
                Some(ms) => Sourced::from_env(ms, var_name),
                None => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(default_ms)
                }
            },
            Err(_) => Sourced::default_value(default_ms),
        }
    }

    /// Get an optional path with ~ expansion (None if not set or empty).
    ///
    /// If `must_exist` is true, records an error when the path is set but
    /// doesn't exist.
    pub fn get_optional_path(&mut self, name: &str, must_exist: bool) -> Sourced<Option<PathBuf>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => {
                let expanded = expand_home(&value);
                if must_exist && !expanded.exists() {
                    self.errors.push(EnvError::PathNotFound {
                        var: var_name.clone(),
                        path: expanded.clone(),
                    });
                    return Sourced::default_value(None);
                }
                Sourced::from_env(Some(expanded), var_name)
            }
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::from_env(default.to_string(), var_name)
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(value)
}

fn parse_duration_ms(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Some(ms);
    }
    humantime::parse_duration(trimmed)
        .ok()
        .map(|d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use std::env;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: Tests run single-threaded, no concurrent access to env vars
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe { env::set_var(key, value) };
    }

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        env_test_lock()
    }

    #[test]
    fn test_get_bool_true_values() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_BOOL_TRUE"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE", "Yes"] {
            set_env("GCOMP_TEST_BOOL_TRUE", val);
            let mut parser = EnvParser::new();
            let result = parser.get_bool("TEST_BOOL_TRUE", false);
            assert!(result.value, "Expected true for '{}'", val);
            assert!(!parser.has_errors());
        }

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_guard();
        let vars = ["GCOMP_BAD_BOOL"];
        cleanup_env(&vars);

        set_env("GCOMP_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("BAD_BOOL", false);
        assert!(!result.value);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u64_range_out_of_range() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_U64_OOR"];
        cleanup_env(&vars);

        set_env("GCOMP_TEST_U64_OOR", "200");
        let mut parser = EnvParser::new();
        let result = parser.get_u64_range("TEST_U64_OOR", 10, 0, 100);
        assert_eq!(result.value, 10);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_port_rejects_zero() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_PORT"];
        cleanup_env(&vars);

        set_env("GCOMP_TEST_PORT", "0");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_port("TEST_PORT", 443).value, 443);
        assert!(parser.has_errors());

        set_env("GCOMP_TEST_PORT", "8443");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_port("TEST_PORT", 443).value, 8443);
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_ms_formats() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_DURATION"];
        cleanup_env(&vars);

        set_env("GCOMP_TEST_DURATION", "1500");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_duration_ms("TEST_DURATION", 0).value, 1500);

        set_env("GCOMP_TEST_DURATION", "20s");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_duration_ms("TEST_DURATION", 0).value, 20_000);

        set_env("GCOMP_TEST_DURATION", "1h");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_duration_ms("TEST_DURATION", 0).value, 3_600_000);
        assert!(!parser.has_errors());

        set_env("GCOMP_TEST_DURATION", "soon");
        let mut parser = EnvParser::new();
        let result = parser.get_duration_ms("TEST_DURATION", 42);
        assert_eq!(result.value, 42);
        assert!(matches!(
            parser.errors()[0],
            EnvError::InvalidDuration { .. }
        ));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_log_level_invalid() {
        let _guard = env_guard();
        let vars = ["GCOMP_LOG_LEVEL"];
        cleanup_env(&vars);

        set_env("GCOMP_LOG_LEVEL", "verbose");
        let mut parser = EnvParser::new();
        let result = parser.get_log_level("LOG_LEVEL", "info");
        assert!(parser.has_errors());
        assert_eq!(result.value, "info");

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_optional_string() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_OPT"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        assert!(parser.get_optional_string("TEST_OPT").value.is_none());

        set_env("GCOMP_TEST_OPT", "");
        let mut parser = EnvParser::new();
        let result = parser.get_optional_string("TEST_OPT");
        assert!(result.value.is_none());
        assert!(result.is_set());

        set_env("GCOMP_TEST_OPT", "value");
        let mut parser = EnvParser::new();
        let result = parser.get_optional_string("TEST_OPT");
        assert_eq!(result.value, Some("value".to_string()));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_optional_path() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_PATH"];
        cleanup_env(&vars);

        set_env("GCOMP_TEST_PATH", "~/gcomp/state");
        let mut parser = EnvParser::new();
        let result = parser.get_optional_path("TEST_PATH", false);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result.value, Some(home.join("gcomp/state")));
        }
        assert!(!parser.has_errors());

        set_env("GCOMP_TEST_PATH", "/nonexistent/gcomp");
        let mut parser = EnvParser::new();
        assert!(parser.get_optional_path("TEST_PATH", true).value.is_none());
        assert!(matches!(
            parser.errors()[0],
            EnvError::PathNotFound { .. }
        ));

        cleanup_env(&vars);
    }

    #[test]
    fn test_source_tracking() {
        let _guard = env_guard();
        let vars = ["GCOMP_TEST_SRC"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        let result = parser.get_string("TEST_SRC", "default");
        assert_eq!(result.source, ConfigSource::Default);
        assert!(result.env_var.is_none());

        set_env("GCOMP_TEST_SRC", "from_env");
        let mut parser = EnvParser::new();
        let result = parser.get_string("TEST_SRC", "default");
        assert_eq!(result.source, ConfigSource::Environment);
        assert_eq!(result.env_var.as_deref(), Some("GCOMP_TEST_SRC"));

        cleanup_env(&vars);
    }

    mod proptest_durations {
        use super::super::parse_duration_ms;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn test_integer_durations_are_milliseconds(ms in 0u64..10_000_000_000) {
                prop_assert_eq!(parse_duration_ms(&ms.to_string()), Some(ms));
            }

            #[test]
            fn test_parse_duration_never_panics(s in ".*") {
                let _ = parse_duration_ms(&s);
            }
        }
    }
}
