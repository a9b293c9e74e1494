//! Properties that hold for every batch regardless of runner

use crate::common::{mock_config, setup_test_logging, tasks_from, NoInput};
use ags_sandbox::{
    build_tasks, run_parallel, run_sequential, MockBackend, NoopObserver, RunConfig, Summary,
    TaskInput, TaskResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Every third task raises, every fifth fails to run at all
fn mixed_code(id: usize) -> String {
    if id % 5 == 0 {
        "transport".to_string()
    } else if id % 3 == 0 {
        format!("error:task {}", id)
    } else {
        format!("task {}", id)
    }
}

fn assert_aligned(results: &[TaskResult], count: usize) {
    assert_eq!(results.len(), count);
    for (index, result) in results.iter().enumerate() {
        assert_eq!(result.task.id, index + 1, "result {} out of place", index);
    }
}

#[tokio::test]
async fn test_results_align_with_tasks_for_any_limit() {
    setup_test_logging();
    let count = 6;

    for limit in [0, 1, count, 2 * count] {
        let backend = Arc::new(MockBackend::new());
        let config = RunConfig {
            parallel: true,
            max_parallel: limit,
            ..mock_config()
        };
        // later tasks finish first
        let tasks = tasks_from(count, |id| format!("sleep:{};task {}", (count - id) * 10, id));

        let results = run_parallel(
            &CancellationToken::new(),
            tasks,
            &config,
            backend.clone(),
            Arc::new(NoopObserver),
        )
        .await;

        assert_aligned(&results, count);
        for result in &results {
            let stdout = result.execution().unwrap().stdout_text();
            assert_eq!(stdout, format!("task {}\n", result.task.id));
        }
        assert!(backend.live_sandboxes().is_empty());
    }
}

#[tokio::test]
async fn test_sequential_results_align_with_tasks() {
    setup_test_logging();
    let backend = Arc::new(MockBackend::new());

    let results = run_sequential(
        &CancellationToken::new(),
        tasks_from(7, mixed_code),
        &mock_config(),
        backend.clone(),
        Arc::new(NoopObserver),
    )
    .await;

    assert_aligned(&results, 7);
    assert_eq!(backend.create_count(), 1);
    assert_eq!(backend.destroyed(), vec!["mock-1".to_string()]);
}

#[tokio::test]
async fn test_summary_counts_partition_results() {
    let backend = Arc::new(MockBackend::new());
    let config = RunConfig {
        parallel: true,
        max_parallel: 3,
        ..mock_config()
    };

    let results = run_parallel(
        &CancellationToken::new(),
        tasks_from(15, mixed_code),
        &config,
        backend,
        Arc::new(NoopObserver),
    )
    .await;
    let summary = Summary::from_results(&results, Duration::from_millis(5));

    assert_eq!(summary.total, 15);
    assert_eq!(summary.succeeded + summary.failed, summary.total);
    // ids 3, 5, 6, 9, 10, 12, 15
    assert_eq!(summary.failed, 7);
    assert_eq!(summary.exit_code(), 1);

    // aggregating again gives the same answer
    assert_eq!(Summary::from_results(&results, Duration::from_millis(5)), summary);
}

#[tokio::test]
async fn test_exit_code_follows_failure_count() {
    let cases = [
        (vec!["a", "b"], 0),
        (vec!["a", "error:x"], 1),
        (vec!["error:x", "transport"], 2),
    ];

    for (codes, expected) in cases {
        let tasks = tasks_from(codes.len(), |id| codes[id - 1].to_string());
        let results = run_sequential(
            &CancellationToken::new(),
            tasks,
            &mock_config(),
            Arc::new(MockBackend::new()),
            Arc::new(NoopObserver),
        )
        .await;
        let summary = Summary::from_results(&results, Duration::ZERO);
        assert_eq!(summary.exit_code(), expected, "codes {:?}", codes);
    }
}

#[test]
fn test_task_ids_are_sequential_across_files_and_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let files: Vec<_> = ["a.py", "b.py", "c.py"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("print('{}')", name)).unwrap();
            path
        })
        .collect();

    let input = TaskInput {
        files,
        repeat: 2,
        ..TaskInput::default()
    };
    let tasks = build_tasks(&input, &mut NoInput).unwrap();

    assert_eq!(tasks.len(), 6);
    let ids: Vec<usize> = tasks.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    let instances: Vec<usize> = tasks.iter().map(|t| t.instance_number).collect();
    assert_eq!(instances, vec![1, 2, 1, 2, 1, 2]);
    assert!(tasks.iter().all(|t| t.total_instances == 2));
    assert_eq!(tasks[2].code, "print('b.py')");
}
