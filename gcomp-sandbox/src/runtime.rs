//! Job module loading and lifecycle.
//!
//! # Guest interface
//!
//! A job module must export:
//!
//! - `memory`
//! - `alloc(len: i32) -> i32`, used by the host to hand buffers to the guest
//! - `on_event(kind: i32)`, receiving START (0), PAUSE (1), CONTINUE (2), STOP (3)
//!
//! and may export `step() -> i32`, called repeatedly while the job is running
//! until it returns non-zero. Without `step` the job is done once START
//! returns.
//!
//! Host functions taking data receive `(ptr, len)` into guest memory. Host
//! functions returning data write it through `alloc` and return
//! `(ptr << 32) | len`, `0` for null, or `-1` on failure.

use crate::capabilities::{self, Capabilities, Capability, HttpsRequest, JOB_NAMESPACE, TransportError};
use crate::channel::JobChannel;
use anyhow::{anyhow, bail};
use gcomp_common::{
    ControlSignal, EXIT_FINISHED, EXIT_STOPPED, EXIT_VIOLATION, JobEvent, PlatformInfo,
    ResearchDetails, Violation,
};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use wasmtime::{Caller, Engine, Linker, Memory, Module, Store, TypedFunc};

/// Lifecycle event delivered to `on_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Pause,
    Continue,
    Stop,
}

impl LifecycleEvent {
    pub fn code(self) -> i32 {
        match self {
            Self::Start => 0,
            Self::Pause => 1,
            Self::Continue => 2,
            Self::Stop => 3,
        }
    }
}

impl From<ControlSignal> for LifecycleEvent {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Pause => Self::Pause,
            ControlSignal::Continue => Self::Continue,
            ControlSignal::Stop => Self::Stop,
        }
    }
}

/// How a job run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Stopped,
    Violation(Violation),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Finished => EXIT_FINISHED,
            Self::Stopped => EXIT_STOPPED,
            Self::Violation(_) => EXIT_VIOLATION,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create runtime: {0}")]
    Engine(String),

    #[error("failed to compile job module: {0}")]
    Compile(String),

    #[error("failed to link job module: {0}")]
    Link(String),

    #[error("job module does not export `{0}`")]
    MissingExport(&'static str),

    #[error("job trapped: {0}")]
    Trapped(String),

    #[error("failed to write job event: {0}")]
    Channel(#[from] std::io::Error),
}

/// Per-run state reachable from host functions.
pub struct HostState {
    capabilities: Capabilities,
    channel: JobChannel,
    platform: PlatformInfo,
    violation: Option<Violation>,
}

enum Flow<T> {
    Continue(T),
    Violated(Violation),
}

/// Compiles and drives job modules.
pub struct JobRuntime {
    engine: Engine,
    start_delay: Duration,
}

impl JobRuntime {
    pub fn new(start_delay: Duration) -> Result<Self, SandboxError> {
        let engine = Engine::new(&wasmtime::Config::new())
            .map_err(|e| SandboxError::Engine(format!("{e:#}")))?;
        Ok(Self {
            engine,
            start_delay,
        })
    }

    /// First import namespace outside the allow-list, if any.
    pub fn first_disallowed_import(module: &Module) -> Option<String> {
        module
            .imports()
            .map(|import| import.module())
            .find(|namespace| !capabilities::is_allowed_namespace(namespace))
            .map(str::to_string)
    }

    /// Run one job to completion, stop, or violation.
    pub fn run(
        &self,
        script: &[u8],
        platform: PlatformInfo,
        capabilities: Capabilities,
        channel: JobChannel,
        control: Receiver<ControlSignal>,
    ) -> Result<RunOutcome, SandboxError> {
        let module = Module::new(&self.engine, script)
            .map_err(|e| SandboxError::Compile(format!("{e:#}")))?;

        if let Some(namespace) = Self::first_disallowed_import(&module) {
            let violation = Violation::require_module(&namespace);
            warn!(%namespace, "job imports a non-allowed module");
            channel.emit(&JobEvent::Violation(violation.clone()))?;
            return Ok(RunOutcome::Violation(violation));
        }

        let mut linker = Linker::new(&self.engine);
        link_job_interface(&mut linker).map_err(|e| SandboxError::Link(format!("{e:#}")))?;
        link_capabilities(&mut linker, capabilities.physics.is_some())
            .map_err(|e| SandboxError::Link(format!("{e:#}")))?;

        let mut store = Store::new(
            &self.engine,
            HostState {
                capabilities,
                channel,
                platform,
                violation: None,
            },
        );
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| SandboxError::Link(format!("{e:#}")))?;

        let on_event = instance
            .get_typed_func::<i32, ()>(&mut store, "on_event")
            .map_err(|_| SandboxError::MissingExport("on_event"))?;
        if instance.get_memory(&mut store, "memory").is_none() {
            return Err(SandboxError::MissingExport("memory"));
        }
        let step = instance.get_typed_func::<(), i32>(&mut store, "step").ok();

        thread::sleep(self.start_delay);
        info!("starting job");
        if let Flow::Violated(v) = deliver(&mut store, &on_event, LifecycleEvent::Start)? {
            return Ok(RunOutcome::Violation(v));
        }

        let mut paused = false;
        loop {
            let signal = if paused {
                Some(control.recv().unwrap_or(ControlSignal::Stop))
            } else {
                match control.try_recv() {
                    Ok(signal) => Some(signal),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => Some(ControlSignal::Stop),
                }
            };

            if let Some(signal) = signal {
                paused = match signal {
                    ControlSignal::Pause => true,
                    ControlSignal::Continue => false,
                    ControlSignal::Stop => paused,
                };
                if let Flow::Violated(v) = deliver(&mut store, &on_event, signal.into())? {
                    return Ok(RunOutcome::Violation(v));
                }
                if signal == ControlSignal::Stop {
                    info!("job stopped");
                    return Ok(RunOutcome::Stopped);
                }
                continue;
            }

            let Some(step) = &step else {
                return Ok(RunOutcome::Finished);
            };
            let result = step.call(&mut store, ());
            match settle(&mut store, result)? {
                Flow::Continue(0) => {}
                Flow::Continue(_) => {
                    info!("job finished");
                    return Ok(RunOutcome::Finished);
                }
                Flow::Violated(v) => return Ok(RunOutcome::Violation(v)),
            }
        }
    }
}

fn deliver(
    store: &mut Store<HostState>,
    on_event: &TypedFunc<i32, ()>,
    event: LifecycleEvent,
) -> Result<Flow<()>, SandboxError> {
    debug!(?event, "delivering lifecycle event");
    let result = on_event.call(&mut *store, event.code());
    settle(store, result)
}

/// Turn a guest call result into a flow decision, surfacing violations.
fn settle<T>(store: &mut Store<HostState>, result: anyhow::Result<T>) -> Result<Flow<T>, SandboxError> {
    match result {
        Ok(value) => Ok(Flow::Continue(value)),
        Err(err) => match store.data_mut().violation.take() {
            Some(violation) => {
                store
                    .data()
                    .channel
                    .emit(&JobEvent::Violation(violation.clone()))?;
                Ok(Flow::Violated(violation))
            }
            None => Err(SandboxError::Trapped(format!("{err:#}"))),
        },
    }
}

// ── Guest memory ───────────────────────────────────────────────────────────

fn guest_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow!("job does not export memory"))
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    if ptr < 0 || len < 0 {
        bail!("negative guest pointer or length");
    }
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory.read(&*caller, ptr as usize, &mut buf)?;
    Ok(buf)
}

fn read_guest_str(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let bytes = read_guest(caller, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| anyhow!("guest string is not UTF-8"))
}

fn pack(ptr: i32, len: i32) -> i64 {
    (i64::from(ptr as u32) << 32) | i64::from(len as u32)
}

/// Copy bytes into a fresh guest allocation.
fn write_guest(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> anyhow::Result<i64> {
    let alloc = caller
        .get_export("alloc")
        .and_then(|export| export.into_func())
        .ok_or_else(|| anyhow!("job does not export alloc"))?
        .typed::<i32, i32>(&*caller)?;
    let len = i32::try_from(bytes.len())?;
    let ptr = alloc.call(&mut *caller, len)?;
    if ptr < 0 {
        bail!("guest alloc returned a negative pointer");
    }
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok(pack(ptr, len))
}

fn write_guest_json(caller: &mut Caller<'_, HostState>, value: &impl serde::Serialize) -> anyhow::Result<i64> {
    let bytes = serde_json::to_vec(value)?;
    write_guest(caller, &bytes)
}

fn write_guest_result(
    caller: &mut Caller<'_, HostState>,
    result: std::io::Result<Vec<u8>>,
) -> anyhow::Result<i64> {
    match result {
        Ok(bytes) => write_guest(caller, &bytes),
        Err(_) => Ok(-1),
    }
}

// ── Linking ────────────────────────────────────────────────────────────────

fn link_job_interface(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        JOB_NAMESPACE,
        "log",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let text = read_guest_str(&mut caller, ptr, len)?;
            caller.data().channel.log(&text);
            Ok(())
        },
    )?;

    linker.func_wrap(
        JOB_NAMESPACE,
        "save_context",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let Ok(context) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
                return Ok(-1);
            };
            caller.data().channel.emit(&JobEvent::SaveContext(context))?;
            Ok(0)
        },
    )?;

    linker.func_wrap(
        JOB_NAMESPACE,
        "research_details",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let Ok(details) = serde_json::from_slice::<ResearchDetails>(&bytes) else {
                return Ok(-1);
            };
            caller
                .data()
                .channel
                .emit(&JobEvent::ResearchDetails(details))?;
            Ok(0)
        },
    )?;

    linker.func_wrap(
        JOB_NAMESPACE,
        "platform",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i64> {
            let platform = caller.data().platform.clone();
            write_guest_json(&mut caller, &platform)
        },
    )?;

    Ok(())
}

fn link_capabilities(linker: &mut Linker<HostState>, with_physics: bool) -> anyhow::Result<()> {
    linker.func_wrap(
        Capability::SecureTransport.namespace(),
        "request",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let Ok(request) = serde_json::from_slice::<HttpsRequest>(&bytes) else {
                return Ok(-1);
            };
            match caller.data().capabilities.transport.request(&request) {
                Ok(response) => write_guest_json(&mut caller, &response),
                Err(TransportError::Prohibited(host)) => {
                    warn!(%host, "job attempted to reach a prohibited host");
                    caller.data_mut().violation = Some(Violation::host(&host));
                    Err(anyhow!("prohibited host: {host}"))
                }
                Err(e) => {
                    caller.data().channel.log(&format!("https request failed: {e}"));
                    Ok(-1)
                }
            }
        },
    )?;

    linker.func_wrap(
        Capability::ContextRead.namespace(),
        "get",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i64> {
            match caller.data().capabilities.context.read() {
                Some(context) => write_guest_json(&mut caller, &context),
                None => Ok(0),
            }
        },
    )?;

    linker.func_wrap(
        Capability::Compression.namespace(),
        "gzip",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            write_guest_result(&mut caller, capabilities::gzip(&bytes))
        },
    )?;

    linker.func_wrap(
        Capability::Compression.namespace(),
        "gunzip",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            write_guest_result(&mut caller, capabilities::gunzip(&bytes))
        },
    )?;

    linker.func_wrap(
        Capability::UrlParsing.namespace(),
        "parse",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let raw = read_guest_str(&mut caller, ptr, len)?;
            match capabilities::parse_url(&raw) {
                Ok(parsed) => write_guest_json(&mut caller, &parsed),
                Err(_) => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(
        Capability::Crypto.namespace(),
        "sha256",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let digest = capabilities::sha256_hex(&bytes);
            write_guest(&mut caller, digest.as_bytes())
        },
    )?;

    if with_physics {
        linker.func_wrap(
            Capability::Physics.namespace(),
            "call",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
                let bytes = read_guest(&mut caller, ptr, len)?;
                let Ok(request) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
                    return Ok(-1);
                };
                let result = match caller.data_mut().capabilities.physics.as_mut() {
                    Some(binding) => binding.call(request),
                    None => return Ok(-1),
                };
                match result {
                    Ok(value) => write_guest_json(&mut caller, &value),
                    Err(e) => {
                        caller.data().channel.log(&format!("physics call failed: {e}"));
                        Ok(-1)
                    }
                }
            },
        )?;
    }

    Ok(())
}
