//! GComp job sandbox binary.
//!
//! Started by the client for each job run. Reads the bootstrap line from
//! stdin, runs the job, and exits with 0 (finished), 1 (violation),
//! 2 (runtime error) or 143 (stopped).

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use gcomp_common::{EXIT_RUNTIME_ERROR, LogConfig, SandboxInput, init_logging};
use gcomp_sandbox::{Capabilities, JobChannel, JobRuntime, spawn_control_reader};
use std::io::Write;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gcomp-sandbox")]
#[command(author, version, about = "GComp job sandbox - runs one job module")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn read_bootstrap() -> Result<gcomp_common::Bootstrap> {
    let mut line = String::new();
    let read = std::io::stdin()
        .read_line(&mut line)
        .context("failed to read bootstrap")?;
    if read == 0 {
        bail!("stdin closed before bootstrap");
    }
    match serde_json::from_str::<SandboxInput>(&line).context("malformed bootstrap")? {
        SandboxInput::Bootstrap(bootstrap) => Ok(bootstrap),
        SandboxInput::Control { signal } => bail!("expected bootstrap, got control signal {signal}"),
    }
}

fn run() -> Result<i32> {
    let bootstrap = read_bootstrap()?;
    info!(
        script_bytes = bootstrap.script.len(),
        context = %bootstrap.context_path.display(),
        "bootstrap received"
    );

    let control = spawn_control_reader(|| std::io::stdin().lock());
    let capabilities = Capabilities::new(
        Duration::from_millis(bootstrap.request_timeout_ms),
        &bootstrap.context_path,
    );
    let runtime = JobRuntime::new(Duration::from_millis(bootstrap.start_delay_ms))?;
    let outcome = runtime.run(
        &bootstrap.script,
        bootstrap.platform,
        capabilities,
        JobChannel::stdio(),
        control,
    )?;
    info!(?outcome, "job ended");
    Ok(outcome.exit_code())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "sandbox failed");
            let _ = writeln!(std::io::stderr(), "{e:#}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}
