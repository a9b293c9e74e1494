use super::{acquire_sandbox, execute_task, release_sandboxes, RunConfig, RunObserver, TaskResult};
use crate::backend::SandboxBackend;
use crate::error::SandboxError;
use crate::task::ExecutionTask;
use crate::types::SandboxRef;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Counters {
    succeeded: usize,
    failed: usize,
}

/// State shared by every worker of one batch
struct Batch {
    config: RunConfig,
    backend: Arc<dyn SandboxBackend>,
    observer: Arc<dyn RunObserver>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    created: Mutex<Vec<SandboxRef>>,
    counters: Mutex<Counters>,
    total: usize,
}

impl Batch {
    fn record(&self, result: &TaskResult) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if result.is_failure() {
            counters.failed += 1;
        } else {
            counters.succeeded += 1;
        }
        debug!(
            task_id = result.task.id,
            succeeded = counters.succeeded,
            failed = counters.failed,
            total = self.total,
            "Task finished"
        );
    }
}

/// Run every task in its own sandbox, at most `max_parallel` at a time.
///
/// Result `i` always belongs to task `i`, whatever order tasks finish in.
/// A task whose sandbox cannot be created fails alone. Created sandboxes are
/// destroyed once every task is done, unless `keep_alive` is set.
pub async fn run_parallel(
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

    let limit = config.effective_parallelism(tasks.len());
    info!(tasks = tasks.len(), limit, "Running tasks in parallel");

    let batch = Arc::new(Batch {
        config: config.clone(),
        backend: backend.clone(),
        observer: observer.clone(),
        semaphore: Arc::new(Semaphore::new(limit)),
        cancel: cancel.clone(),
        created: Mutex::new(Vec::new()),
        counters: Mutex::new(Counters::default()),
        total: tasks.len(),
    });

    // Completion-order progress: many producers, one consumer
    let (progress_tx, progress_consumer) = if config.report_progress && !config.stream {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskResult>();
        let observer = observer.clone();
        let consumer = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                observer.on_task_finished(&result);
            }
        });
        (Some(tx), Some(consumer))
    } else {
        (None, None)
    };

    let handles: Vec<_> = tasks
        .iter()
        .map(|task| {
            tokio::spawn(run_one(batch.clone(), task.clone(), progress_tx.clone()))
        })
        .collect();
    drop(progress_tx);

    let mut results = Vec::with_capacity(tasks.len());
    for (task, handle) in tasks.iter().zip(handles) {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = task.id, "Worker did not complete: {}", e);
                TaskResult::failed(
                    task.clone(),
                    SandboxError::Internal(format!("task worker failed: {}", e)),
                )
            }
        };
        results.push(result);
    }

    if let Some(consumer) = progress_consumer {
        let _ = consumer.await;
    }

    let created = std::mem::take(&mut *batch.created.lock().unwrap_or_else(|e| e.into_inner()));
    release_sandboxes(
        backend.as_ref(),
        created,
        config.keep_alive,
        observer.as_ref(),
    )
    .await;

    results
}

async fn run_one(
    batch: Arc<Batch>,
    task: Arc<ExecutionTask>,
    progress: Option<mpsc::UnboundedSender<TaskResult>>,
) -> TaskResult {
    let result = execute_with_permit(&batch, task).await;
    batch.record(&result);
    if let Some(tx) = progress {
        let _ = tx.send(result.clone());
    }
    result
}

async fn execute_with_permit(batch: &Batch, task: Arc<ExecutionTask>) -> TaskResult {
    let permit = tokio::select! {
        biased;
        _ = batch.cancel.cancelled() => None,
        permit = batch.semaphore.clone().acquire_owned() => permit.ok(),
    };
    let _permit = match permit {
        Some(permit) if !batch.cancel.is_cancelled() => permit,
        _ => return TaskResult::failed(task, SandboxError::Cancelled),
    };

    let started = Instant::now();
    let acquired = match acquire_sandbox(batch.backend.as_ref(), &batch.config.selector).await {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!(task_id = task.id, "Sandbox creation failed: {}", e);
            let elapsed = started.elapsed();
            return TaskResult::new(task, Err(e), elapsed, Duration::ZERO);
        }
    };
    if acquired.owned {
        batch
            .created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(acquired.sandbox.clone());
    }

    let (outcome, execution_duration) = execute_task(
        batch.backend.as_ref(),
        &acquired.sandbox,
        &task,
        &batch.config,
        &batch.observer,
    )
    .await;

    TaskResult::new(task, outcome, acquired.creation_duration, execution_duration)
}
