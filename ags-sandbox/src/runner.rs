//! Execution strategies for a batch of tasks
//!
//! [`run_sequential`] runs every task in one sandbox, in order.
//! [`run_parallel`] gives each task its own sandbox under a concurrency cap.
//! Both return one [`TaskResult`] per input task, in input order, and never
//! fail as a whole: every error is attached to the task it affected.

mod parallel;
mod sequential;

use crate::backend::SandboxBackend;
use crate::dispatch::DispatchError;
use crate::error::{Result, SandboxError};
use crate::task::{ExecutionTask, TaskLabel};
use crate::types::{CodeRequest, Execution, Language, OutputChunk, SandboxRef};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use parallel::run_parallel;
pub use sequential::run_sequential;

/// How the runners obtain a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxSelector {
    /// Create fresh sandboxes from a tool
    Create { tool: String },
    /// Reuse an existing instance; it is never destroyed by the runners
    Existing { instance_id: String },
}

/// Options shared by the dispatcher and runners
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub selector: SandboxSelector,
    pub language: Language,
    /// Per-execution timeout passed to the backend
    pub timeout: Option<Duration>,
    /// Extra environment for every execution
    pub env: Vec<(String, String)>,
    /// Copies requested per source
    pub repeat: usize,
    /// Forward live output to the observer
    pub stream: bool,
    /// One sandbox per task instead of a shared one
    pub parallel: bool,
    /// Concurrency cap for parallel runs; 0 means unbounded
    pub max_parallel: usize,
    /// Leave created sandboxes running after the batch
    pub keep_alive: bool,
    /// Report each task to the observer as it finishes
    pub report_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            selector: SandboxSelector::Create {
                tool: "code-interpreter-v1".to_string(),
            },
            language: Language::Python,
            timeout: None,
            env: Vec::new(),
            repeat: 1,
            stream: false,
            parallel: false,
            max_parallel: 0,
            keep_alive: false,
            report_progress: false,
        }
    }
}

impl RunConfig {
    /// Reject combinations that cannot be honoured
    pub fn validate(&self) -> std::result::Result<(), DispatchError> {
        if let SandboxSelector::Existing { .. } = self.selector {
            if self.repeat > 1 {
                return Err(DispatchError::Usage(
                    "--repeat cannot be used with --instance".to_string(),
                ));
            }
            if self.parallel {
                return Err(DispatchError::Usage(
                    "--parallel cannot be used with --instance".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Worker limit for `task_count` tasks, at least 1
    pub fn effective_parallelism(&self, task_count: usize) -> usize {
        let count = task_count.max(1);
        if self.max_parallel > 0 {
            self.max_parallel.min(count)
        } else {
            count
        }
    }

    fn code_request(&self, task: &ExecutionTask) -> CodeRequest {
        let mut request = CodeRequest::new(task.code.clone(), self.language);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }
        for (key, value) in &self.env {
            request = request.with_env(key.clone(), value.clone());
        }
        request
    }
}

/// Outcome of one task
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Arc<ExecutionTask>,
    /// The execution, or the error that prevented one
    pub outcome: std::result::Result<Execution, SandboxError>,
    /// Time spent creating the sandbox this task ran in (zero if it was reused)
    pub creation_duration: Duration,
    pub execution_duration: Duration,
    pub total_duration: Duration,
}

impl TaskResult {
    pub fn new(
        task: Arc<ExecutionTask>,
        outcome: std::result::Result<Execution, SandboxError>,
        creation_duration: Duration,
        execution_duration: Duration,
    ) -> Self {
        Self {
            task,
            outcome,
            creation_duration,
            execution_duration,
            total_duration: creation_duration + execution_duration,
        }
    }

    /// A result for a task that never ran
    pub fn failed(task: Arc<ExecutionTask>, error: SandboxError) -> Self {
        Self::new(task, Err(error), Duration::ZERO, Duration::ZERO)
    }

    /// Failed when the call errored or the code raised an error
    pub fn is_failure(&self) -> bool {
        match &self.outcome {
            Ok(execution) => execution.error.is_some(),
            Err(_) => true,
        }
    }

    pub fn execution(&self) -> Option<&Execution> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&SandboxError> {
        self.outcome.as_ref().err()
    }
}

/// Receives events while a batch runs.
///
/// Calls may come from several tasks at once, but `on_task_finished` is
/// always called from a single consumer.
pub trait RunObserver: Send + Sync {
    /// A chunk of live output (only when streaming)
    fn on_output(&self, _task: &TaskLabel, _chunk: &OutputChunk) {}

    /// A task finished (only when progress reporting is on), in completion order
    fn on_task_finished(&self, _result: &TaskResult) {}

    /// Created sandboxes were left running
    fn on_sandboxes_kept(&self, _sandbox_ids: &[String]) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// A sandbox obtained for a run
pub(crate) struct Acquired {
    pub sandbox: SandboxRef,
    pub creation_duration: Duration,
    /// Created by us, so ours to destroy
    pub owned: bool,
}

pub(crate) async fn acquire_sandbox(
    backend: &dyn SandboxBackend,
    selector: &SandboxSelector,
) -> Result<Acquired> {
    match selector {
        SandboxSelector::Create { tool } => {
            let start = Instant::now();
            let sandbox = backend.create(tool).await?;
            Ok(Acquired {
                sandbox,
                creation_duration: start.elapsed(),
                owned: true,
            })
        }
        SandboxSelector::Existing { instance_id } => {
            let sandbox = backend.connect(instance_id).await?;
            Ok(Acquired {
                sandbox,
                creation_duration: Duration::ZERO,
                owned: false,
            })
        }
    }
}

/// Destroy owned sandboxes, or report them as kept when `keep_alive` is set
pub(crate) async fn release_sandboxes(
    backend: &dyn SandboxBackend,
    sandboxes: Vec<SandboxRef>,
    keep_alive: bool,
    observer: &dyn RunObserver,
) {
    if sandboxes.is_empty() {
        return;
    }
    if keep_alive {
        let ids: Vec<String> = sandboxes.into_iter().map(|s| s.id).collect();
        info!(count = ids.len(), "Keeping sandboxes alive");
        observer.on_sandboxes_kept(&ids);
        return;
    }

    let results =
        futures::future::join_all(sandboxes.iter().map(|sandbox| backend.destroy(sandbox))).await;
    for (sandbox, result) in sandboxes.iter().zip(results) {
        if let Err(e) = result {
            warn!(sandbox_id = %sandbox.id, "Cleanup failed: {}", e);
        }
    }
}

fn spawn_output_forwarder(
    label: TaskLabel,
    observer: Arc<dyn RunObserver>,
) -> (mpsc::UnboundedSender<OutputChunk>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
    let handle = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            observer.on_output(&label, &chunk);
        }
    });
    (tx, handle)
}

/// Run one task's code, forwarding output when streaming
pub(crate) async fn execute_task(
    backend: &dyn SandboxBackend,
    sandbox: &SandboxRef,
    task: &ExecutionTask,
    config: &RunConfig,
    observer: &Arc<dyn RunObserver>,
) -> (std::result::Result<Execution, SandboxError>, Duration) {
    let request = config.code_request(task);
    let start = Instant::now();

    if !config.stream {
        let outcome = backend.run_code(sandbox, &request, None).await;
        return (outcome, start.elapsed());
    }

    let (tx, forwarder) = spawn_output_forwarder(task.label(), observer.clone());
    let outcome = backend.run_code(sandbox, &request, Some(tx)).await;
    let elapsed = start.elapsed();
    // all chunks are delivered before the task counts as finished
    let _ = forwarder.await;
    (outcome, elapsed)
}
