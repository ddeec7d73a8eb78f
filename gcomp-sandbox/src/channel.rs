//! The sandbox side of the job channel.
//!
//! Events go to stdout as JSON lines; job log output goes to stderr, which
//! the supervisor collects for error reports. Control signals arrive on
//! stdin after the bootstrap line.

use gcomp_common::{ControlSignal, JobEvent, SandboxInput, to_line};
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writer for job events and job log output.
#[derive(Clone)]
pub struct JobChannel {
    events: SharedWriter,
    diagnostics: SharedWriter,
}

impl JobChannel {
    pub fn new(events: impl Write + Send + 'static, diagnostics: impl Write + Send + 'static) -> Self {
        Self {
            events: Arc::new(Mutex::new(Box::new(events))),
            diagnostics: Arc::new(Mutex::new(Box::new(diagnostics))),
        }
    }

    /// Channel over the process's stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    pub fn emit(&self, event: &JobEvent) -> io::Result<()> {
        let line = to_line(event).map_err(io::Error::other)?;
        let mut out = self
            .events
            .lock()
            .map_err(|_| io::Error::other("event writer poisoned"))?;
        out.write_all(line.as_bytes())?;
        out.flush()
    }

    /// Write one line of job output.
    pub fn log(&self, text: &str) {
        if let Ok(mut out) = self.diagnostics.lock() {
            let _ = writeln!(out, "{text}");
            let _ = out.flush();
        }
    }
}

/// Read control signals on a background thread.
///
/// The receiver disconnects when the input closes.
pub fn spawn_control_reader<R, F>(open: F) -> Receiver<ControlSignal>
where
    R: BufRead,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let reader = open();
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SandboxInput>(&line) {
                Ok(SandboxInput::Control { signal }) => {
                    debug!(%signal, "control signal received");
                    if tx.send(signal).is_err() {
                        break;
                    }
                }
                Ok(SandboxInput::Bootstrap(_)) => warn!("ignoring repeated bootstrap"),
                Err(e) => warn!(error = %e, "ignoring malformed control line"),
            }
        }
    });
    rx
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// In-memory writer shared with the test.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        pub fn lines(&self) -> Vec<String> {
            self.contents().lines().map(str::to_string).collect()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
