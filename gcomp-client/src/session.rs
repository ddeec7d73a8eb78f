//! The client session: one task consuming one event queue.
//!
//! Host commands, timer expiries, fetch results and job process events are
//! all posted to the session queue and handled in order. State entry actions
//! only queue follow-up events, they never fire transitions themselves.

use crate::backoff::RetryPolicy;
use crate::fetch::{FetchError, JobFetcher, JobRequest, acquire_job};
use crate::fsm::{ClientEvent, ClientState, Payload, StateHandler, StateMachine, client_state_machine};
use crate::host::HostSender;
use crate::persistence::{PauseStore, PersistError};
use crate::supervisor::{JobExit, JobId, Supervisor};
use chrono::Utc;
use gcomp_common::config::ClientConfig;
use gcomp_common::{ClientMessage, ControlSignal, HostCommand, JobEvent, KeyContent, KillMode};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a killed job may take to report its exit before shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to prepare job state: {0}")]
    Persist(#[from] PersistError),

    #[error("failed to build job server client: {0}")]
    Fetch(#[from] FetchError),
}

/// Everything the session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Host(HostCommand),
    HostClosed,
    HostProtocolError(String),
    Fire(ClientEvent, Payload),
    Job { job: JobId, event: JobEvent },
    JobExited { job: JobId, exit: JobExit },
    /// The resumed job ran out of time.
    CancelJob,
    /// The pause grace period of a graceful kill elapsed.
    EscalateStop,
    /// The stop grace period of a graceful kill elapsed.
    EscalateKill,
}

/// Posts events to the session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("session is gone, event dropped");
        }
    }

    fn post_after(&self, delay: Duration, event: SessionEvent) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.post(event);
        })
    }
}

/// How the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Killed,
    HostClosed,
    ProtocolError,
    Failed(String),
}

impl SessionOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Killed => 0,
            Self::HostClosed => 1,
            Self::ProtocolError | Self::Failed(_) => 5,
        }
    }
}

/// Graceful kill in progress.
#[derive(Debug)]
enum Escalation {
    /// Job asked to pause, waiting before asking it to stop.
    Pausing(JoinHandle<()>),
    /// Job asked to stop, waiting before killing the client.
    Stopping(JoinHandle<()>),
}

impl Escalation {
    fn abort(self) {
        match self {
            Self::Pausing(timer) | Self::Stopping(timer) => timer.abort(),
        }
    }
}

pub struct ClientSession {
    fsm: StateMachine<ClientState, ClientEvent>,
    core: SessionCore,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct SessionCore {
    config: ClientConfig,
    handle: SessionHandle,
    host: HostSender,
    store: PauseStore,
    fetcher: JobFetcher,
    supervisor: Supervisor,
    retry: RetryPolicy,
    identity: KeyContent,
    should_kill: bool,
    /// Delay before the next request if the running job fails.
    next_delay: Duration,
    escalation: Option<Escalation>,
    watchdog: Option<JoinHandle<()>>,
    pending: Option<JoinHandle<()>>,
    finished: Option<SessionOutcome>,
}

impl ClientSession {
    pub fn new(config: ClientConfig, host: HostSender) -> Result<(Self, SessionHandle), SessionError> {
        let (handle, events) = SessionHandle::channel();
        let store = PauseStore::new(config.state.clone());
        store.ensure_dir()?;
        let fetcher = JobFetcher::new(config.job_server.clone(), config.timeouts.request())?;
        let supervisor = Supervisor::new(
            &config.sandbox,
            config.timeouts.clone(),
            store.clone(),
            fetcher.clone(),
            host.clone(),
            handle.clone(),
        );
        let retry = RetryPolicy::from_config(&config.timeouts, config.test_mode);
        let core = SessionCore {
            next_delay: retry.first_delay,
            config,
            handle: handle.clone(),
            host,
            store,
            fetcher,
            supervisor,
            retry,
            identity: KeyContent::default(),
            should_kill: false,
            escalation: None,
            watchdog: None,
            pending: None,
            finished: None,
        };
        let session = Self {
            fsm: client_state_machine(),
            core,
            events,
        };
        Ok((session, handle))
    }

    /// Run until the client is killed or the host goes away.
    pub async fn run(mut self) -> SessionOutcome {
        info!("client session started");
        self.fsm.start(&mut self.core, Payload::Empty);

        while self.core.finished.is_none() {
            let Some(event) = self.events.recv().await else {
                break;
            };
            self.handle(event);
        }
        self.core.stop_timers();
        self.drain_job_exit().await;

        let outcome = self
            .core
            .finished
            .take()
            .unwrap_or_else(|| SessionOutcome::Failed("session queue closed".to_string()));
        self.core.host.flush().await;
        info!(?outcome, "client session ended");
        outcome
    }

    /// Give a job that is being killed the chance to settle its state.
    async fn drain_job_exit(&mut self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.core.supervisor.has_job() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(SessionEvent::JobExited { job, exit })) => {
                    self.core.supervisor.handle_exit(job, &exit, true);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!("job did not exit before shutdown");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Host(command) => self.handle_host(command),
            SessionEvent::HostClosed => {
                info!("host closed its channel");
                self.core.supervisor.cancel_job();
                self.core.finish(SessionOutcome::HostClosed);
            }
            SessionEvent::HostProtocolError(message) => {
                if self.core.should_kill {
                    error!(%message, "unparsable host message while killing");
                    self.core.host.send(ClientMessage::ClientKilled(Default::default()));
                    self.core.supervisor.force_kill();
                    self.core.finish(SessionOutcome::ProtocolError);
                } else {
                    warn!(%message, "unparsable host message ignored");
                }
            }
            SessionEvent::Fire(event, payload) => {
                self.fsm.fire(event, payload, &mut self.core);
            }
            SessionEvent::Job { job, event } => self.core.supervisor.handle_event(job, event),
            SessionEvent::JobExited { job, exit } => self.handle_job_exit(job, exit),
            SessionEvent::CancelJob => {
                info!("job out of run time");
                self.core.supervisor.cancel_job();
            }
            SessionEvent::EscalateStop => {
                if let Some(Escalation::Pausing(_)) = self.core.escalation {
                    info!("job did not pause in time, stopping it");
                    self.core.supervisor.send_control(ControlSignal::Stop);
                    let timer = self
                        .core
                        .handle
                        .post_after(self.core.config.timeouts.term_job(), SessionEvent::EscalateKill);
                    self.core.escalation = Some(Escalation::Stopping(timer));
                }
            }
            SessionEvent::EscalateKill => {
                if let Some(Escalation::Stopping(_)) = self.core.escalation {
                    self.core.escalation = None;
                    self.fsm
                        .fire(ClientEvent::RxKillClient, Payload::Empty, &mut self.core);
                }
            }
        }
    }

    fn handle_host(&mut self, command: HostCommand) {
        match command {
            HostCommand::Key(key) => {
                self.fsm.fire(ClientEvent::RxKey, Payload::Key(key), &mut self.core);
            }
            HostCommand::Kill(_) if self.core.should_kill => {
                debug!("kill already in progress");
            }
            HostCommand::Kill(KillMode::Immediate) => {
                info!("immediate kill requested");
                self.core.should_kill = true;
                self.fsm
                    .fire(ClientEvent::RxKillClient, Payload::Empty, &mut self.core);
            }
            HostCommand::Kill(KillMode::Graceful) => {
                self.core.should_kill = true;
                if !self.core.supervisor.has_job() {
                    info!("graceful kill requested with no job running");
                    self.fsm
                        .fire(ClientEvent::RxKillClient, Payload::Empty, &mut self.core);
                    return;
                }
                info!("graceful kill requested, pausing job");
                self.core.supervisor.send_control(ControlSignal::Pause);
                let timer = self
                    .core
                    .handle
                    .post_after(self.core.config.timeouts.pause_job(), SessionEvent::EscalateStop);
                self.core.escalation = Some(Escalation::Pausing(timer));
            }
            HostCommand::Continue(_) => match self.core.escalation.take() {
                Some(Escalation::Stopping(timer)) => {
                    warn!("continue arrived after the job was asked to stop");
                    self.core.escalation = Some(Escalation::Stopping(timer));
                }
                Some(pausing) => {
                    pausing.abort();
                    info!("continuing");
                    self.core.should_kill = false;
                    self.core.supervisor.send_control(ControlSignal::Continue);
                }
                None => debug!("continue with no pause in effect"),
            },
        }
    }

    fn handle_job_exit(&mut self, job: JobId, exit: JobExit) {
        let Some(outcome) = self
            .core
            .supervisor
            .handle_exit(job, &exit, self.core.should_kill)
        else {
            return;
        };
        if let Some(watchdog) = self.core.watchdog.take() {
            watchdog.abort();
        }
        self.core.host.send(outcome.report);

        if let Some(escalation) = self.core.escalation.take() {
            escalation.abort();
            self.fsm
                .fire(ClientEvent::RxKillClient, Payload::Empty, &mut self.core);
        } else if outcome.restart {
            info!("job interrupted, restarting");
            self.fsm.start(&mut self.core, Payload::Empty);
        } else {
            let delay = if outcome.succeeded {
                self.core.retry.first_delay
            } else {
                self.core.next_delay
            };
            self.fsm
                .fire(ClientEvent::TxJobFinished, Payload::Delay(delay), &mut self.core);
        }
    }
}

impl SessionCore {
    fn fire_later(&self, event: ClientEvent, payload: Payload) {
        self.handle.post(SessionEvent::Fire(event, payload));
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        if self.finished.is_none() {
            self.finished = Some(outcome);
        }
    }

    fn stop_timers(&mut self) {
        for timer in [self.watchdog.take(), self.pending.take()].into_iter().flatten() {
            timer.abort();
        }
        if let Some(escalation) = self.escalation.take() {
            escalation.abort();
        }
    }

    fn job_request(&self) -> JobRequest {
        JobRequest {
            category: self.config.job_server.category.clone(),
            uuid: self.identity.uuid.clone(),
            app_version: self.identity.app_version.clone(),
            app_platform: self.identity.platform.clone(),
            os_version: self.identity.os_version.clone(),
            arch: self.identity.arch.clone(),
        }
    }

    fn resume_or_fetch(&mut self) {
        if let Some(job) = self.store.paused_job(Utc::now()) {
            info!(budget_ms = job.run_budget.as_millis() as u64, "resuming paused job");
            self.watchdog = Some(self.handle.post_after(job.run_budget, SessionEvent::CancelJob));
            self.fire_later(
                ClientEvent::WasPaused,
                Payload::Job {
                    script: job.script,
                    next_delay: self.retry.first_delay,
                },
            );
            return;
        }
        self.store.clear();
        let delay = self.config.timeouts.startup_delay();
        debug!(delay_ms = delay.as_millis() as u64, "no paused job");
        self.pending = Some(self.handle.post_after(
            delay,
            SessionEvent::Fire(ClientEvent::WasNotPaused, Payload::Delay(self.retry.first_delay)),
        ));
    }

    fn fetch_job(&mut self, delay: Duration) {
        let next_delay = self.retry.next_delay(delay);
        let request_timeout = self.config.timeouts.request();
        let request = self.job_request();
        let fetcher = self.fetcher.clone();
        let store = self.store.clone();
        let host = self.host.clone();
        let handle = self.handle.clone();

        info!(delay_ms = delay.as_millis() as u64, "waiting before requesting a job");
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = tokio::time::timeout(
                request_timeout,
                acquire_job(&fetcher, &request, &store, &host),
            )
            .await
            .unwrap_or(Err(FetchError::Timeout(request_timeout)));
            match result {
                Ok(script) => handle.post(SessionEvent::Fire(
                    ClientEvent::TxJobReceived,
                    Payload::Job { script, next_delay },
                )),
                Err(e) => {
                    if e.is_format_error() {
                        error!(error = %e, "job server sent an unusable job");
                    } else {
                        warn!(error = %e, "failed to get a job");
                    }
                    info!(next_delay_ms = next_delay.as_millis() as u64, "will retry");
                    handle.post(SessionEvent::Fire(
                        ClientEvent::RxGetJobError,
                        Payload::Delay(next_delay),
                    ));
                }
            }
        }));
    }

    fn execute_job(&mut self, script: Vec<u8>, next_delay: Duration) {
        self.next_delay = next_delay;
        self.host.send(ClientMessage::ExecutingJob(Default::default()));
        if let Err(e) = self
            .supervisor
            .run_job(script, self.identity.platform_info())
        {
            error!(error = %e, "failed to start sandbox");
            self.host.send(ClientMessage::JobExecutionError {
                exit_code: gcomp_common::EXIT_RUNTIME_ERROR,
                error: e.to_string(),
            });
            self.fire_later(ClientEvent::TxJobFinished, Payload::Delay(next_delay));
        }
    }
}

impl StateHandler<ClientState> for SessionCore {
    type Payload = Payload;

    fn on_enter(&mut self, state: ClientState, payload: Payload) {
        debug!(?state, "entering state");
        match state {
            ClientState::Starting => self.fire_later(ClientEvent::TxGetKey, Payload::Empty),
            ClientState::WaitingKey => self.host.send(ClientMessage::GetKey(Default::default())),
            ClientState::ReadingKey => {
                if let Payload::Key(key) = payload {
                    info!(uuid = %key.uuid, platform = %key.platform, app_version = %key.app_version, "key received");
                    self.identity = key;
                }
                self.host.send(ClientMessage::KeyAccepted(Default::default()));
                self.fire_later(ClientEvent::TxKeyAccepted, Payload::Empty);
            }
            ClientState::ResumingJob => self.resume_or_fetch(),
            ClientState::GettingJob => {
                let delay = match payload {
                    Payload::Delay(delay) => delay,
                    _ => self.retry.first_delay,
                };
                self.fetch_job(delay);
            }
            ClientState::ExecutingJob => match payload {
                Payload::Job { script, next_delay } => self.execute_job(script, next_delay),
                other => {
                    error!(payload = ?other, "no script to execute");
                    self.fire_later(ClientEvent::TxJobFinished, Payload::Delay(self.next_delay));
                }
            },
            ClientState::Killing => {
                self.stop_timers();
                self.supervisor.force_kill();
                if self.should_kill {
                    self.host.send(ClientMessage::ClientKilled(Default::default()));
                }
                self.finish(SessionOutcome::Killed);
            }
        }
    }
}
