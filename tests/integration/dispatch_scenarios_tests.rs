//! End-to-end dispatch scenarios against the mock backend

use crate::common::{mock_config, setup_test_logging, tasks_from, NoInput, RecordingObserver};
use ags_sandbox::{
    build_tasks, DispatchError, DispatchOutcome, Dispatcher, MockBackend, NoopObserver,
    RunConfig, SandboxError, SandboxSelector, TaskBuildError, TaskInput, TaskSource,
};
use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn batch(outcome: DispatchOutcome) -> (Vec<ags_sandbox::TaskResult>, ags_sandbox::Summary) {
    match outcome {
        DispatchOutcome::Batch { results, summary } => (results, summary),
        other => panic!("expected a batch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_single_literal_takes_single_path() {
    setup_test_logging();
    let input = TaskInput {
        code: Some("hello".to_string()),
        repeat: 1,
        ..TaskInput::default()
    };
    let tasks = build_tasks(&input, &mut NoInput).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].source, TaskSource::Code);
    assert_eq!((tasks[0].id, tasks[0].instance_number, tasks[0].total_instances), (1, 1, 1));
    assert_eq!(tasks[0].label().to_string(), "1:<code>");

    let backend = Arc::new(MockBackend::new());
    let dispatcher = Dispatcher::new(backend.clone(), mock_config()).unwrap();
    let outcome = dispatcher
        .dispatch(tasks, &CancellationToken::new(), Arc::new(NoopObserver))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_matches!(outcome, DispatchOutcome::Single { ref result, kept_instance: None, .. } => {
        assert_eq!(result.execution().unwrap().stdout_text(), "hello\n");
    });
    assert_eq!(backend.destroyed(), vec!["mock-1".to_string()]);
}

#[tokio::test]
async fn test_repeated_literal_runs_in_one_sandbox() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new().with_create_delay(Duration::from_millis(20)));
    let input = TaskInput {
        code: Some("x = 1".to_string()),
        repeat: 3,
        ..TaskInput::default()
    };
    let tasks = build_tasks(&input, &mut NoInput).unwrap();
    let config = RunConfig {
        repeat: 3,
        ..mock_config()
    };

    let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
    let (results, summary) = batch(
        dispatcher
            .dispatch(tasks, &CancellationToken::new(), Arc::new(NoopObserver))
            .await
            .unwrap(),
    );

    assert_eq!(summary.total, 3);
    assert_eq!(summary.exit_code(), 0);
    assert!(results[0].creation_duration >= Duration::from_millis(20));
    assert!(results[1..]
        .iter()
        .all(|r| r.creation_duration == Duration::ZERO));
    assert_eq!(backend.create_count(), 1);
    assert!(backend
        .executed()
        .iter()
        .all(|(sandbox, _)| sandbox == "mock-1"));
}

#[tokio::test]
async fn test_parallel_creation_failure_is_isolated() {
    setup_test_logging();

    // whichever creation call fails, only that task is lost
    for failing_call in 1..=4 {
        let backend = Arc::new(MockBackend::new().fail_create_call(failing_call));
        let config = RunConfig {
            parallel: true,
            max_parallel: 2,
            ..mock_config()
        };

        let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
        let (results, summary) = batch(
            dispatcher
                .dispatch(
                    tasks_from(4, |id| format!("task {}", id)),
                    &CancellationToken::new(),
                    Arc::new(NoopObserver),
                )
                .await
                .unwrap(),
        );

        assert_eq!(
            (summary.succeeded, summary.failed),
            (3, 1),
            "failing call {}",
            failing_call
        );
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(results.len(), 4);
        let failed = results.iter().find(|r| r.is_failure()).unwrap();
        assert_matches!(failed.error(), Some(SandboxError::Create(_)));
        for result in results.iter().filter(|r| !r.is_failure()) {
            let stdout = result.execution().unwrap().stdout_text();
            assert_eq!(stdout, format!("task {}\n", result.task.id));
        }
        assert!(backend.live_sandboxes().is_empty());
        assert_eq!(backend.destroyed().len(), 3);
    }
}

#[tokio::test]
async fn test_all_creations_failing_exits_two() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new().fail_all_creates());
    let observer = Arc::new(RecordingObserver::default());
    let config = RunConfig {
        parallel: true,
        keep_alive: true,
        ..mock_config()
    };

    let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
    let (_, summary) = batch(
        dispatcher
            .dispatch(
                tasks_from(3, |id| format!("task {}", id)),
                &CancellationToken::new(),
                observer.clone(),
            )
            .await
            .unwrap(),
    );

    assert_eq!(summary.failed, 3);
    assert_eq!(summary.exit_code(), 2);
    assert!(backend.destroyed().is_empty());
    assert!(observer.kept.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_code_and_files_conflict() {
    let input = TaskInput {
        code: Some("print(1)".to_string()),
        files: vec!["a.py".into()],
        repeat: 1,
        ..TaskInput::default()
    };
    let err = build_tasks(&input, &mut NoInput).unwrap_err();
    assert_matches!(err, TaskBuildError::ConflictingSources);
    assert_eq!(err.to_string(), "cannot use both -c and -f flags");
}

#[tokio::test]
async fn test_parallel_respects_limit_under_load() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new().with_run_delay(Duration::from_millis(15)));
    let observer = Arc::new(RecordingObserver::default());
    let config = RunConfig {
        parallel: true,
        max_parallel: 3,
        report_progress: true,
        ..mock_config()
    };

    let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
    let (results, summary) = batch(
        dispatcher
            .dispatch(
                tasks_from(10, |id| format!("task {}", id)),
                &CancellationToken::new(),
                observer.clone(),
            )
            .await
            .unwrap(),
    );

    assert_eq!(summary.succeeded, 10);
    assert_eq!(results.len(), 10);
    assert!(backend.peak_in_flight() <= 3);
    assert_eq!(backend.create_count(), 10);

    let mut finished = observer.finished.lock().unwrap().clone();
    finished.sort_unstable();
    assert_eq!(finished, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_keep_alive_reports_every_created_sandbox() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new());
    let observer = Arc::new(RecordingObserver::default());
    let config = RunConfig {
        parallel: true,
        keep_alive: true,
        ..mock_config()
    };

    let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
    dispatcher
        .dispatch(
            tasks_from(3, |id| format!("task {}", id)),
            &CancellationToken::new(),
            observer.clone(),
        )
        .await
        .unwrap();

    let mut kept = observer.kept.lock().unwrap().clone();
    kept.sort();
    assert_eq!(kept, vec!["mock-1", "mock-2", "mock-3"]);
    assert!(backend.destroyed().is_empty());
    assert_eq!(backend.live_sandboxes().len(), 3);
}

#[tokio::test]
async fn test_cancellation_stops_new_tasks() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new());
    let config = RunConfig {
        parallel: true,
        max_parallel: 1,
        ..mock_config()
    };
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        trigger.cancel();
    });

    let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
    let (results, summary) = batch(
        dispatcher
            .dispatch(
                tasks_from(5, |_| "sleep:100;done".to_string()),
                &cancel,
                Arc::new(NoopObserver),
            )
            .await
            .unwrap(),
    );

    assert_eq!(results.len(), 5);
    assert!(results[0].execution().is_some());
    assert!(results[1..]
        .iter()
        .all(|r| matches!(r.error(), Some(SandboxError::Cancelled))));
    assert_eq!(summary.failed, 4);
    assert!(backend.live_sandboxes().is_empty());
}

#[tokio::test]
async fn test_streamed_output_is_labelled() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new());
    let observer = Arc::new(RecordingObserver::default());
    let config = RunConfig {
        stream: true,
        parallel: true,
        ..mock_config()
    };

    let dispatcher = Dispatcher::new(backend, config).unwrap();
    dispatcher
        .dispatch(
            tasks_from(2, |id| format!("line {}", id)),
            &CancellationToken::new(),
            observer.clone(),
        )
        .await
        .unwrap();

    let mut output: Vec<(String, String)> = observer
        .output
        .lock()
        .unwrap()
        .iter()
        .map(|(label, chunk)| (label.to_string(), chunk.text.clone()))
        .collect();
    output.sort();
    assert_eq!(
        output,
        vec![
            ("1:<code>#1".to_string(), "line 1\n".to_string()),
            ("2:<code>#2".to_string(), "line 2\n".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_existing_instance_is_not_destroyed() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new().with_existing("sbx-live"));
    let config = RunConfig {
        selector: SandboxSelector::Existing {
            instance_id: "sbx-live".to_string(),
        },
        ..RunConfig::default()
    };

    let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
    let outcome = dispatcher
        .dispatch(
            tasks_from(1, |_| "exit:3".to_string()),
            &CancellationToken::new(),
            Arc::new(NoopObserver),
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(backend.create_count(), 0);
    assert!(backend.destroyed().is_empty());
}

#[tokio::test]
async fn test_parallel_with_existing_instance_is_usage_error() {
    let config = RunConfig {
        selector: SandboxSelector::Existing {
            instance_id: "sbx".to_string(),
        },
        parallel: true,
        ..RunConfig::default()
    };
    let err = Dispatcher::new(Arc::new(MockBackend::new()), config).unwrap_err();
    assert_matches!(err, DispatchError::Usage(_));
}
