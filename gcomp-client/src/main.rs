//! GComp client binary.
//!
//! Spawned by the host application. Reads host commands as JSON lines on
//! stdin and writes client messages as JSON lines on stdout. Exits with 0
//! when killed, 1 when the host goes away and 5 on a fatal error.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use gcomp_client::{ClientSession, HostSender, spawn_host_reader, spawn_host_writer};
use gcomp_common::{ClientConfig, LogConfig, init_logging};
use std::path::PathBuf;
use tracing::{error, info};

const EXIT_FATAL: i32 = 5;

#[derive(Parser)]
#[command(name = "gcomp-client")]
#[command(author, version, about = "GComp client - runs volunteer computing jobs for a host")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "GCOMP_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the paused job
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Sandbox executable
    #[arg(long)]
    sandbox: Option<PathBuf>,

    /// Retry failed job requests on a short fixed interval
    #[arg(long)]
    test_mode: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = ClientConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(dir) = cli.state_dir {
        config.state.dir = dir;
    }
    if let Some(program) = cli.sandbox {
        config.sandbox.program = Some(program);
    }
    config.test_mode |= cli.test_mode;
    info!(
        job_server = %config.job_server.base_url(),
        state_dir = %config.state.dir.display(),
        test_mode = config.test_mode,
        "starting client"
    );

    let (host, host_rx) = HostSender::channel();
    let writer = spawn_host_writer(tokio::io::stdout(), host_rx);
    let (session, handle) =
        ClientSession::new(config, host.clone()).context("failed to start session")?;
    spawn_host_reader(tokio::io::stdin(), handle);

    let outcome = session.run().await;
    host.flush().await;
    drop(host);
    writer.abort();
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout carries the host protocol.
    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "client failed");
            std::process::exit(EXIT_FATAL);
        }
    }
}
