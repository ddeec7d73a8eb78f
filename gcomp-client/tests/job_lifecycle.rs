//! End-to-end job lifecycle against a mock job server and a shell sandbox.

mod common;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use common::fixtures::{client_config, eventually, unreachable_server};
use common::{ClientHarness, MockJobServer, StateDir, init_test_logging};
use gcomp_client::fetch::{JobFetcher, JobRequest, ViolationReport, acquire_job, gunzip};
use gcomp_client::{HostOutput, HostSender, PauseStore, SessionOutcome};
use gcomp_common::config::StateConfig;
use gcomp_common::{ClientMessage, ViolationKind};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
struct UsersFirst {
    host_rx: Arc<Mutex<mpsc::UnboundedReceiver<HostOutput>>>,
    /// Messages the host had received when the script was requested.
    at_script_request: Arc<Mutex<Option<Vec<String>>>>,
}

#[tokio::test]
async fn test_number_of_users_sent_before_script_request() {
    init_test_logging();
    crate::test_log!("TEST START: test_number_of_users_sent_before_script_request");

    let (host, host_rx) = HostSender::channel();
    let state = UsersFirst {
        host_rx: Arc::new(Mutex::new(host_rx)),
        at_script_request: Arc::new(Mutex::new(None)),
    };

    let description = json!({
        "s3_config": {
            "credentials": {"accessKeyId": "AKID", "secretAccessKey": "secret", "region": "eu-west-1"},
            "params": {"Bucket": "jobs", "Key": "fold.wat", "request_date": "Mon, 01 Jan 2024 00:00:00 GMT"}
        },
        "statistics": {"number_of_users": 5}
    });
    let router = Router::new()
        .route(
            "/getjob",
            post(move || {
                let body = description.to_string();
                async move { body }
            }),
        )
        .route(
            "/jobs/fold.wat",
            get(|State(state): State<UsersFirst>| async move {
                let mut seen = Vec::new();
                while let Ok(HostOutput::Message(message)) = state.host_rx.lock().unwrap().try_recv() {
                    seen.push(serde_json::to_string(&message).unwrap());
                }
                *state.at_script_request.lock().unwrap() = Some(seen);
                "(module)"
            }),
        )
        .with_state(state.clone());
    let server = MockJobServer::start(router).await;

    let dir = StateDir::new();
    let store = PauseStore::new(StateConfig {
        dir: dir.path().to_path_buf(),
        ..StateConfig::default()
    });
    let fetcher = JobFetcher::new(server.config(), Duration::from_secs(5)).unwrap();
    let request = JobRequest {
        category: "default".to_string(),
        uuid: "U1".to_string(),
        ..JobRequest::default()
    };

    let script = acquire_job(&fetcher, &request, &store, &host).await.unwrap();
    assert_eq!(script, b"(module)");

    let seen = state.at_script_request.lock().unwrap().clone().unwrap();
    assert_eq!(
        seen.first().map(String::as_str),
        Some(r#"{"action":"number_of_users","content":{"number_of_users":5}}"#)
    );
    assert!(seen.iter().skip(1).all(|m| m.contains("job_received")));
    assert!(dir.script_path().exists());
    assert!(dir.attributes_path().exists());

    crate::test_log!("TEST PASS: test_number_of_users_sent_before_script_request");
}

#[tokio::test]
async fn test_exhausted_paused_job_is_discarded() {
    init_test_logging();
    crate::test_log!("TEST START: test_exhausted_paused_job_is_discarded");

    let dir = StateDir::new();
    dir.write_paused_job(0.0, 1.0);
    std::fs::write(dir.context_path(), b"{\"step\":1}").unwrap();

    let mut client = ClientHarness::start(client_config(&dir, unreachable_server(), "exit 0"));
    client.handshake().await;

    assert!(
        eventually(|| !dir.script_path().exists() && !dir.attributes_path().exists()).await,
        "paused job state was not cleared"
    );
    assert!(!dir.context_path().exists());

    let (outcome, seen) = client.kill().await;
    assert_eq!(outcome, SessionOutcome::Killed);
    assert!(!seen.iter().any(|m| m.action() == "executing_job"));

    crate::test_log!("TEST PASS: test_exhausted_paused_job_is_discarded");
}

#[cfg(unix)]
#[tokio::test]
async fn test_unexpected_termination_restarts_and_charges_time() {
    init_test_logging();
    crate::test_log!("TEST START: test_unexpected_termination_restarts_and_charges_time");

    let dir = StateDir::new();
    dir.write_paused_job(60_000.0, 1.0);

    let script = "read -r line; sleep 0.2; kill -9 $$";
    let mut client = ClientHarness::start(client_config(&dir, unreachable_server(), script));
    client.handshake().await;

    assert_eq!(client.next_message().await.action(), "executing_job");
    assert!(matches!(
        client.next_message().await,
        ClientMessage::JobExecutionError { exit_code: 1, .. }
    ));
    // The state machine starts over with a fresh key request.
    assert_eq!(client.next_message().await.action(), "get_key");

    let remaining = dir.remaining_run_time();
    assert!(remaining < 60_000.0, "remaining {remaining}");
    assert!(remaining > 50_000.0, "remaining {remaining}");
    assert!(dir.script_path().exists());

    let (outcome, _) = client.kill().await;
    assert_eq!(outcome, SessionOutcome::Killed);

    crate::test_log!("TEST PASS: test_unexpected_termination_restarts_and_charges_time");
}

#[derive(Clone, Default)]
struct Reports {
    bodies: Arc<Mutex<Vec<ViolationReport>>>,
}

#[cfg(unix)]
#[tokio::test]
async fn test_oversized_context_is_reported_and_cancels_job() {
    init_test_logging();
    crate::test_log!("TEST START: test_oversized_context_is_reported_and_cancels_job");

    let reports = Reports::default();
    let router = Router::new()
        .route(
            "/report",
            post(|State(reports): State<Reports>, body: Bytes| async move {
                let report = serde_json::from_slice(&gunzip(&body).unwrap()).unwrap();
                reports.bodies.lock().unwrap().push(report);
                StatusCode::OK
            }),
        )
        .route("/getjob", post(|| async { StatusCode::NO_CONTENT }))
        .with_state(reports.clone());
    let server = MockJobServer::start(router).await;

    let dir = StateDir::new();
    // About ten bytes of context allowed.
    dir.write_paused_job(60_000.0, 0.00001);
    std::fs::write(dir.path().join("project_certificate.pem"), "PROJECT CERT").unwrap();

    let script = r#"read -r line
printf '%s\n' '{"event":"save_context","data":{"blob":"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}}'
exec sleep 30"#;
    let mut client = ClientHarness::start(client_config(&dir, server.config(), script));
    client.handshake().await;

    assert_eq!(client.next_message().await.action(), "executing_job");
    assert_eq!(client.next_message().await.action(), "limit_storage");
    assert!(matches!(
        client.next_message().await,
        ClientMessage::JobExecutionError { exit_code: 1, .. }
    ));

    assert!(!dir.context_path().exists());
    assert!(!dir.script_path().exists());
    assert!(!dir.attributes_path().exists());
    assert!(eventually(|| !reports.bodies.lock().unwrap().is_empty()).await);
    {
        let bodies = reports.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].violation.violation, ViolationKind::ContextLength);
        assert!(bodies[0].violation.message.starts_with("Max context length exceeded: "));
        assert_eq!(
            bodies[0].project_public_certificate.as_deref(),
            Some("PROJECT CERT")
        );
    }

    let (outcome, _) = client.kill().await;
    assert_eq!(outcome, SessionOutcome::Killed);

    crate::test_log!("TEST PASS: test_oversized_context_is_reported_and_cancels_job");
}
