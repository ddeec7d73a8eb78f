//! Logging setup shared by the client and the sandbox.
//!
//! Both binaries own their standard output for protocol traffic, so console
//! logs are normally written to stderr.

use crate::config::EnvParser;
use anyhow::{Context, anyhow};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    /// Additional JSON log file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Read `GCOMP_LOG_LEVEL`, `GCOMP_LOG_FORMAT` and `GCOMP_LOG_FILE`.
    ///
    /// Invalid values fall back to the defaults.
    pub fn from_env(default_level: &str) -> Self {
        let mut env = EnvParser::new();
        let level = env.get_log_level("LOG_LEVEL", default_level).value;
        let format = match env.get_string("LOG_FORMAT", "pretty").value.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = env.get_optional_string("LOG_FILE").value.map(PathBuf::from);
        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Keeps background log writers alive; drop flushes them.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guards = LoggingGuards::default();

    let console = fmt::layer().with_target(false);
    let console = match (config.format, config.stderr) {
        (LogFormat::Json, true) => console.json().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, false) => console.json().with_writer(std::io::stdout).boxed(),
        (LogFormat::Pretty, true) => console.with_writer(std::io::stderr).boxed(),
        (LogFormat::Pretty, false) => console.with_writer(std::io::stdout).boxed(),
    };
    layers.push(console);

    if let Some(path) = &config.file {
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards._file = Some(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guards)
}
