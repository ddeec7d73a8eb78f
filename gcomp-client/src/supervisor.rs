//! Sandbox process supervision.
//!
//! Each job runs in its own sandbox process. The client writes the bootstrap
//! line and later control lines to the sandbox's stdin, reads job events from
//! its stdout and keeps its stderr for error reports. Every job gets an id so
//! events from a job that was already replaced are dropped.

use crate::fetch::{JobFetcher, ViolationReport};
use crate::host::HostSender;
use crate::persistence::{PauseStore, SaveContextOutcome};
use crate::session::{SessionEvent, SessionHandle};
use gcomp_common::config::{SandboxConfig, TimeoutConfig};
use gcomp_common::{
    Bootstrap, ClientMessage, ControlSignal, EXIT_STOPPED, JobEvent, PlatformInfo, SandboxInput,
    Violation, to_line,
};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long output readers may lag behind process exit.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on stderr kept for an error report.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Signal number of an uncatchable kill.
const SIGKILL: i32 = 9;

pub type JobId = u64;

// ── Job exit ─────────────────────────────────────────────────────────────

/// How a sandbox process ended.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr: String,
    pub elapsed: Duration,
}

impl JobExit {
    fn from_status(status: Option<ExitStatus>, stderr: String, elapsed: Duration) -> Self {
        let code = status.and_then(|s| s.code());
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.and_then(|s| s.signal())
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code,
            signal,
            stderr,
            elapsed,
        }
    }

    /// Killed outright or stopped on request. Any other exit, crashes
    /// included, counts as the job running to its end.
    pub fn terminated(&self) -> bool {
        self.signal == Some(SIGKILL) || self.code == Some(EXIT_STOPPED)
    }

    /// Exit code reported to the host.
    pub fn exit_code(&self) -> i32 {
        if self.terminated() {
            1
        } else {
            self.code.unwrap_or(1)
        }
    }
}

/// What the session does after a job exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOutcome {
    pub report: ClientMessage,
    /// The job was interrupted without being asked to; start over.
    pub restart: bool,
    pub succeeded: bool,
}

// ── Process handle ───────────────────────────────────────────────────────

struct JobProcess {
    id: JobId,
    control: mpsc::UnboundedSender<ControlSignal>,
    kill: Option<oneshot::Sender<()>>,
}

impl JobProcess {
    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────

/// Runs jobs and applies the policy for their events and exits.
pub struct Supervisor {
    program: PathBuf,
    args: Vec<String>,
    timeouts: TimeoutConfig,
    store: PauseStore,
    fetcher: JobFetcher,
    host: HostSender,
    session: SessionHandle,
    job: Option<JobProcess>,
    next_id: JobId,
    expected_kill: bool,
}

impl Supervisor {
    pub fn new(
        sandbox: &SandboxConfig,
        timeouts: TimeoutConfig,
        store: PauseStore,
        fetcher: JobFetcher,
        host: HostSender,
        session: SessionHandle,
    ) -> Self {
        Self {
            program: sandbox.resolve_program(),
            args: sandbox.args.clone(),
            timeouts,
            store,
            fetcher,
            host,
            session,
            job: None,
            next_id: 0,
            expected_kill: false,
        }
    }

    pub fn has_job(&self) -> bool {
        self.job.is_some()
    }

    fn is_current(&self, id: JobId) -> bool {
        self.job.as_ref().is_some_and(|job| job.id == id)
    }

    /// Start `script` in a fresh sandbox process.
    pub fn run_job(&mut self, script: Vec<u8>, platform: PlatformInfo) -> std::io::Result<JobId> {
        if let Some(mut previous) = self.job.take() {
            warn!(job = previous.id, "replacing a running job");
            previous.kill();
        }
        self.expected_kill = false;
        self.next_id += 1;
        let id = self.next_id;

        let bootstrap = SandboxInput::Bootstrap(Bootstrap {
            script,
            platform,
            context_path: self.store.context_path(),
            request_timeout_ms: self.timeouts.sandbox_request_ms,
            start_delay_ms: self.timeouts.sandbox_start_delay_ms,
        });
        let bootstrap = to_line(&bootstrap)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .current_dir(self.store.dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(job = id, pid = child.id(), program = %self.program.display(), "sandbox started");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_stdin(id, stdin, bootstrap, control_rx));
        }
        let stdout = child.stdout.take().map(|stdout| {
            let session = self.session.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    forward_stdout_line(id, &line, &session);
                }
            })
        });
        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut stderr = stderr;
                let mut buf = Vec::new();
                let _ = (&mut stderr).take(MAX_STDERR_BYTES as u64).read_to_end(&mut buf).await;
                // Keep the pipe open past the cap so the sandbox never sees EPIPE.
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let session = self.session.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            let status = wait_or_kill(&mut child, kill_rx).await;
            let elapsed = started.elapsed();
            if let Some(stdout) = stdout {
                let _ = tokio::time::timeout(READER_GRACE, stdout).await;
            }
            let stderr = match stderr {
                Some(task) => match tokio::time::timeout(READER_GRACE, task).await {
                    Ok(Ok(text)) => text,
                    _ => String::new(),
                },
                None => String::new(),
            };
            let exit = JobExit::from_status(status, stderr, elapsed);
            debug!(job = id, code = ?exit.code, signal = ?exit.signal, "sandbox exited");
            session.post(SessionEvent::JobExited { job: id, exit });
        });

        self.job = Some(JobProcess {
            id,
            control: control_tx,
            kill: Some(kill_tx),
        });
        Ok(id)
    }

    /// Forward a lifecycle signal to the running job.
    pub fn send_control(&self, signal: ControlSignal) {
        match &self.job {
            Some(job) => {
                debug!(job = job.id, %signal, "control signal");
                let _ = job.control.send(signal);
            }
            None => debug!(%signal, "no job to signal"),
        }
    }

    /// Kill the job on purpose. Its persisted state is discarded on exit.
    pub fn cancel_job(&mut self) {
        if let Some(job) = self.job.as_mut() {
            info!(job = job.id, "cancelling job");
            self.expected_kill = true;
            job.kill();
        }
    }

    /// Kill the job without discarding its persisted state.
    pub fn force_kill(&mut self) {
        if let Some(job) = self.job.as_mut() {
            info!(job = job.id, "killing job");
            job.kill();
        }
    }

    /// Apply the policy for an event the job emitted.
    pub fn handle_event(&mut self, id: JobId, event: JobEvent) {
        if !self.is_current(id) {
            debug!(job = id, "event from a replaced job dropped");
            return;
        }
        match event {
            JobEvent::Violation(violation) => {
                warn!(job = id, kind = %violation.violation, message = %violation.message, "job violation");
                self.report_violation(violation);
                self.cancel_job();
            }
            JobEvent::SaveContext(context) => match self.store.save_context(&context) {
                Ok(SaveContextOutcome::Saved) => debug!(job = id, "context saved"),
                Ok(SaveContextOutcome::Exceeded { length }) => {
                    warn!(job = id, length, "context over the storage limit");
                    self.report_violation(Violation::context_length(length));
                    self.host.send(ClientMessage::LimitStorage(Default::default()));
                    self.cancel_job();
                }
                Err(e) => {
                    warn!(job = id, error = %e, "failed to save context");
                    self.cancel_job();
                }
            },
            JobEvent::ResearchDetails(details) => {
                self.host.send(ClientMessage::ResearchDetails(details));
            }
        }
    }

    /// Charge `elapsed` against the paused job's run budget. A job whose
    /// attributes cannot be rewritten is discarded.
    pub fn decrement_remaining_run_time(&self, elapsed: Duration) {
        if let Err(e) = self.store.decrement_remaining_run_time(elapsed) {
            warn!(error = %e, "failed to charge run time");
            self.host.send(ClientMessage::LimitStorage(Default::default()));
            self.store.clear();
        }
    }

    /// Apply the exit policy. Returns `None` for a job that was replaced.
    pub fn handle_exit(&mut self, id: JobId, exit: &JobExit, should_kill: bool) -> Option<ExitOutcome> {
        if !self.is_current(id) {
            debug!(job = id, "exit of a replaced job ignored");
            return None;
        }
        self.job = None;
        let expected = std::mem::take(&mut self.expected_kill);

        let mut restart = false;
        if exit.terminated() && !expected {
            info!(job = id, elapsed_ms = exit.elapsed.as_millis() as u64, "job interrupted");
            self.decrement_remaining_run_time(exit.elapsed);
            restart = !should_kill;
        } else {
            self.store.clear();
        }

        let exit_code = exit.exit_code();
        let report = if exit_code == 0 {
            info!(job = id, "job finished");
            ClientMessage::JobFinished { exit_code }
        } else {
            info!(job = id, exit_code, "job failed");
            ClientMessage::JobExecutionError {
                exit_code,
                error: exit.stderr.clone(),
            }
        };
        Some(ExitOutcome {
            report,
            restart,
            succeeded: exit_code == 0,
        })
    }

    fn report_violation(&self, violation: Violation) {
        let report = ViolationReport {
            violation,
            project_public_certificate: self.store.project_certificate(),
        };
        let fetcher = self.fetcher.clone();
        tokio::spawn(async move {
            if let Err(e) = fetcher.report_violation(&report).await {
                warn!(error = %e, "failed to report violation");
            }
        });
    }
}

async fn wait_or_kill(child: &mut Child, kill: oneshot::Receiver<()>) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "sandbox already gone");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(error = %e, "failed to wait for sandbox");
            None
        }
    }
}

async fn write_stdin(
    id: JobId,
    mut stdin: ChildStdin,
    bootstrap: String,
    mut control: mpsc::UnboundedReceiver<ControlSignal>,
) {
    if let Err(e) = stdin.write_all(bootstrap.as_bytes()).await {
        warn!(job = id, error = %e, "failed to send bootstrap");
        return;
    }
    let _ = stdin.flush().await;
    while let Some(signal) = control.recv().await {
        let line = match to_line(&SandboxInput::Control { signal }) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode control line");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(job = id, error = %e, "sandbox stdin closed");
            return;
        }
        let _ = stdin.flush().await;
    }
}

fn forward_stdout_line(id: JobId, line: &str, session: &SessionHandle) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<JobEvent>(line) {
        Ok(event) => session.post(SessionEvent::Job { job: id, event }),
        Err(e) => warn!(job = id, error = %e, "malformed job event dropped"),
    }
}
