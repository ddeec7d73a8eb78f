use gcomp_common::{Bootstrap, PlatformInfo, SandboxInput, to_line};
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gcomp_sandbox=debug".parse().unwrap()),
        )
        .try_init();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

/// Bootstrap line for a WAT job using a context file under `dir`.
pub fn bootstrap_line(wat: &str, dir: &Path) -> String {
    to_line(&SandboxInput::Bootstrap(Bootstrap {
        script: wat.as_bytes().to_vec(),
        platform: PlatformInfo {
            platform: "linux".to_string(),
            os_version: "6.1".to_string(),
            arch: "x64".to_string(),
        },
        context_path: dir.join("job_script_context.json"),
        request_timeout_ms: 1_000,
        start_delay_ms: 0,
    }))
    .unwrap()
}
