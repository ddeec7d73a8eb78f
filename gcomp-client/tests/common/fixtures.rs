use axum::Router;
use gcomp_client::{ClientSession, HostOutput, HostSender, SessionEvent, SessionHandle, SessionOutcome};
use gcomp_common::config::{JobServerConfig, SandboxConfig, StateConfig, TimeoutConfig};
use gcomp_common::{ClientConfig, ClientMessage, HostCommand, KeyContent, KillMode};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// State directory holding a paused job.
pub struct StateDir {
    pub dir: TempDir,
}

impl StateDir {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating state directory");
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn script_path(&self) -> PathBuf {
        self.path().join("job_script")
    }

    pub fn attributes_path(&self) -> PathBuf {
        self.path().join("job_attributes.json")
    }

    pub fn context_path(&self) -> PathBuf {
        self.path().join("job_script_context.json")
    }

    /// Persist a job with `remaining_ms` of run time and a day until expiry.
    pub fn write_paused_job(&self, remaining_ms: f64, storage_limit_mib: f64) {
        let expiry = chrono::Utc::now().timestamp_millis() + 86_400_000;
        std::fs::write(self.script_path(), b"(module)").expect("Failed to write script");
        std::fs::write(
            self.attributes_path(),
            json!({
                "remaining_run_time": remaining_ms,
                "expiry_date": expiry,
                "storage_limit": storage_limit_mib,
            })
            .to_string(),
        )
        .expect("Failed to write attributes");
    }

    pub fn remaining_run_time(&self) -> f64 {
        let text = std::fs::read_to_string(self.attributes_path()).expect("No attributes");
        let value: serde_json::Value = serde_json::from_str(&text).expect("Bad attributes");
        value["remaining_run_time"].as_f64().expect("No remaining_run_time")
    }
}

/// A local HTTP server standing in for the job server.
pub struct MockJobServer {
    pub addr: SocketAddr,
}

impl MockJobServer {
    pub async fn start(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("No local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });
        crate::test_log!("FIXTURE: Mock job server on {}", addr);
        Self { addr }
    }

    pub fn config(&self) -> JobServerConfig {
        JobServerConfig {
            scheme: "http".to_string(),
            address: self.addr.ip().to_string(),
            port: self.addr.port(),
            storage_endpoint: Some(format!("http://{}", self.addr)),
            ..JobServerConfig::default()
        }
    }
}

/// Job server config pointing at a closed port.
pub fn unreachable_server() -> JobServerConfig {
    JobServerConfig {
        scheme: "http".to_string(),
        address: "127.0.0.1".to_string(),
        port: 9,
        ..JobServerConfig::default()
    }
}

/// Client config running `script` through `/bin/sh` as the sandbox.
pub fn client_config(state: &StateDir, server: JobServerConfig, script: &str) -> ClientConfig {
    ClientConfig {
        job_server: server,
        timeouts: TimeoutConfig {
            request_ms: 1_000,
            pause_job_ms: 200,
            term_job_ms: 200,
            min_try_ms: 100,
            max_try_ms: 500,
            ..TimeoutConfig::default()
        },
        state: StateConfig {
            dir: state.path().to_path_buf(),
            ..StateConfig::default()
        },
        sandbox: SandboxConfig {
            program: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".to_string(), script.to_string()],
        },
        test_mode: false,
    }
}

pub fn host_key() -> KeyContent {
    KeyContent {
        key: Some("host-key".to_string()),
        uuid: "0b8f6a8e-5d7c-4a4e-9d1e-3f2a6b7c8d9e".to_string(),
        app_version: "2.1.0".to_string(),
        platform: "linux".to_string(),
        os_version: "6.1.0".to_string(),
        arch: "x64".to_string(),
    }
}

/// A running session with the host side of its channel.
pub struct ClientHarness {
    pub handle: SessionHandle,
    pub host_rx: mpsc::UnboundedReceiver<HostOutput>,
    pub run: JoinHandle<SessionOutcome>,
    pub seen: Vec<ClientMessage>,
}

impl ClientHarness {
    pub fn start(config: ClientConfig) -> Self {
        let (host, host_rx) = HostSender::channel();
        let (session, handle) = ClientSession::new(config, host).expect("Failed to create session");
        let run = tokio::spawn(session.run());
        Self {
            handle,
            host_rx,
            run,
            seen: Vec::new(),
        }
    }

    pub fn send(&self, command: HostCommand) {
        self.handle.post(SessionEvent::Host(command));
    }

    pub async fn next_message(&mut self) -> ClientMessage {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), self.host_rx.recv()).await {
                Ok(Some(HostOutput::Message(message))) => {
                    crate::test_log!("HOST <- {:?}", message);
                    self.seen.push(message.clone());
                    return message;
                }
                Ok(Some(HostOutput::Flush(ack))) => {
                    let _ = ack.send(());
                }
                other => panic!("No host message: {other:?}"),
            }
        }
    }

    /// Skip messages until one with `action` arrives.
    pub async fn wait_for(&mut self, action: &str) -> ClientMessage {
        loop {
            let message = self.next_message().await;
            if message.action() == action {
                return message;
            }
        }
    }

    /// Complete the key exchange.
    pub async fn handshake(&mut self) {
        self.wait_for("get_key").await;
        self.send(HostCommand::Key(host_key()));
        self.wait_for("key_accepted").await;
    }

    pub async fn kill(mut self) -> (SessionOutcome, Vec<ClientMessage>) {
        self.send(HostCommand::Kill(KillMode::Immediate));
        self.wait_for("client_killed").await;
        let outcome = self.run.await.expect("Session panicked");
        (outcome, self.seen)
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
