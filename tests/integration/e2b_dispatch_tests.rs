//! Dispatch through the HTTP backend against a mock control and data plane

use crate::common::{mock_config, setup_test_logging, tasks_from};
use ags_sandbox::{
    DispatchError, DispatchOutcome, Dispatcher, E2bBackend, E2bEndpoints, NoopObserver,
    RunConfig, SandboxError, TokenCache,
};
use assert_matches::assert_matches;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ndjson(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn backend(server: &MockServer, dir: &tempfile::TempDir) -> Arc<E2bBackend> {
    Arc::new(
        E2bBackend::new(
            "test-key",
            E2bEndpoints::fixed(server.uri()),
            Duration::from_secs(60),
            Arc::new(TokenCache::at(dir.path().join("tokens.json"))),
        )
        .unwrap(),
    )
}

async fn mount_create(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(header("X-API-Key", "test-key"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sandboxID": "sbx-1",
            "envdAccessToken": "tok-1"
        })))
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_single_task_creates_runs_and_destroys() {
    setup_test_logging();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_create(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/execute"))
        .and(header("X-Access-Token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
            json!({"type": "stdout", "text": "hi\n"}),
            json!({"type": "end_of_execution"}),
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &dir);
    let dispatcher = Dispatcher::new(backend, mock_config()).unwrap();
    let outcome = dispatcher
        .dispatch(
            tasks_from(1, |_| "print('hi')".to_string()),
            &CancellationToken::new(),
            Arc::new(NoopObserver),
        )
        .await
        .unwrap();

    assert_matches!(&outcome, DispatchOutcome::Single { result, exit_code: 0, .. } => {
        assert_eq!(result.execution().unwrap().stdout_text(), "hi\n");
    });

    // the token was dropped with the sandbox
    let cache = TokenCache::at(dir.path().join("tokens.json"));
    assert!(cache.get("sbx-1").is_none());
}

#[tokio::test]
async fn test_single_task_execution_failure_still_destroys() {
    setup_test_logging();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_create(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = Dispatcher::new(backend(&server, &dir), mock_config()).unwrap();
    let err = dispatcher
        .dispatch(
            tasks_from(1, |_| "print(1)".to_string()),
            &CancellationToken::new(),
            Arc::new(NoopObserver),
        )
        .await
        .unwrap_err();

    assert_matches!(err, DispatchError::Sandbox(SandboxError::Execution(_)));
}

#[tokio::test]
async fn test_sequential_batch_shares_one_sandbox() {
    setup_test_logging();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_create(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
            json!({"type": "error", "name": "NameError", "value": "x", "traceback": ""}),
            json!({"type": "end_of_execution"}),
        ])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/sandboxes/sbx-1$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = RunConfig {
        repeat: 2,
        ..mock_config()
    };
    let dispatcher = Dispatcher::new(backend(&server, &dir), config).unwrap();
    let outcome = dispatcher
        .dispatch(
            tasks_from(2, |_| "x".to_string()),
            &CancellationToken::new(),
            Arc::new(NoopObserver),
        )
        .await
        .unwrap();

    assert_matches!(outcome, DispatchOutcome::Batch { summary, .. } => {
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.exit_code(), 2);
    });
}

#[tokio::test]
async fn test_env_reaches_the_interpreter_and_timeout_bounds_the_call() {
    setup_test_logging();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_create(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/execute"))
        .and(body_partial_json(json!({"env_vars": {"MODE": "fast"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(ndjson(&[json!({"type": "stdout", "text": "late\n"})]))
                .set_delay(Duration::from_secs(5)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let config = RunConfig {
        timeout: Some(Duration::from_millis(200)),
        env: vec![("MODE".to_string(), "fast".to_string())],
        ..mock_config()
    };
    let dispatcher = Dispatcher::new(backend(&server, &dir), config).unwrap();
    let outcome = dispatcher
        .dispatch(
            tasks_from(1, |_| "import os".to_string()),
            &CancellationToken::new(),
            Arc::new(NoopObserver),
        )
        .await;

    // the execute call is cut off by the timeout; the sandbox is still cleaned up
    assert_matches!(
        outcome,
        Err(DispatchError::Sandbox(SandboxError::Execution(_)))
    );
}
