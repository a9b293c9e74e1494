use super::{acquire_sandbox, execute_task, release_sandboxes, RunConfig, RunObserver, TaskResult};
use crate::backend::SandboxBackend;
use crate::error::SandboxError;
use crate::task::ExecutionTask;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run all tasks in order in a single sandbox.
///
/// The sandbox is shared, so state written by one task is visible to the
/// next. Only the first task is charged the sandbox creation time. If the
/// sandbox cannot be obtained every task fails with that error.
pub async fn run_sequential(
    cancel: &CancellationToken,
    tasks: Vec<ExecutionTask>,
    config: &RunConfig,
    backend: Arc<dyn SandboxBackend>,
    observer: Arc<dyn RunObserver>,
) -> Vec<TaskResult> {
    let tasks: Vec<Arc<ExecutionTask>> = tasks.into_iter().map(Arc::new).collect();
    if tasks.is_empty() {
        return Vec::new();
    }
    if cancel.is_cancelled() {
        return tasks
            .into_iter()
            .map(|task| TaskResult::failed(task, SandboxError::Cancelled))
            .collect();
    }

    let acquired = match acquire_sandbox(backend.as_ref(), &config.selector).await {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!("Sandbox unavailable, failing {} tasks: {}", tasks.len(), e);
            return tasks
                .into_iter()
                .map(|task| TaskResult::failed(task, e.clone()))
                .collect();
        }
    };
    info!(
        sandbox_id = %acquired.sandbox.id,
        creation_ms = acquired.creation_duration.as_millis() as u64,
        "Running {} tasks sequentially",
        tasks.len()
    );

    let mut results = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        if cancel.is_cancelled() {
            results.push(TaskResult::failed(task, SandboxError::Cancelled));
            continue;
        }

        let (outcome, execution_duration) = execute_task(
            backend.as_ref(),
            &acquired.sandbox,
            &task,
            config,
            &observer,
        )
        .await;
        let creation_duration = if index == 0 {
            acquired.creation_duration
        } else {
            Duration::ZERO
        };

        let result = TaskResult::new(task, outcome, creation_duration, execution_duration);
        debug!(task_id = result.task.id, failed = result.is_failure(), "Task finished");
        results.push(result);
    }

    if acquired.owned {
        release_sandboxes(
            backend.as_ref(),
            vec![acquired.sandbox],
            config.keep_alive,
            observer.as_ref(),
        )
        .await;
    }
    results
}
