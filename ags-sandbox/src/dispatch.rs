//! Choosing how a batch runs
//!
//! One unrepeated task takes a fast path whose errors are returned directly
//! and whose exit code follows the remote process. Everything else goes
//! through a runner and is summarised.

use crate::backend::SandboxBackend;
use crate::error::SandboxError;
use crate::runner::{
    acquire_sandbox, execute_task, release_sandboxes, run_parallel, run_sequential, RunConfig,
    RunObserver, TaskResult,
};
use crate::summary::Summary;
use crate::task::ExecutionTask;
use crate::types::Execution;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0}")]
    Usage(String),

    #[error("no code provided")]
    NoCode,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// What a dispatched batch produced
#[derive(Debug)]
pub enum DispatchOutcome {
    Single {
        result: TaskResult,
        exit_code: i32,
        /// Sandbox left running by keep-alive
        kept_instance: Option<String>,
    },
    Batch {
        results: Vec<TaskResult>,
        summary: Summary,
    },
}

impl DispatchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchOutcome::Single { exit_code, .. } => *exit_code,
            DispatchOutcome::Batch { summary, .. } => summary.exit_code(),
        }
    }
}

/// Exit code for a single execution: the remote code if non-zero, else 1 on error
pub fn single_exit_code(execution: &Execution) -> i32 {
    match execution.exit_code {
        Some(code) if code != 0 => code,
        _ if execution.error.is_some() => 1,
        _ => 0,
    }
}

pub struct Dispatcher {
    backend: Arc<dyn SandboxBackend>,
    config: RunConfig,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Dispatcher {
    /// Fails with a usage error when the configuration is inconsistent
    pub fn new(backend: Arc<dyn SandboxBackend>, config: RunConfig) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Whether `task_count` tasks would take the single-task path
    pub fn is_single(&self, task_count: usize) -> bool {
        task_count == 1 && self.config.repeat <= 1
    }

    pub async fn dispatch(
        &self,
        mut tasks: Vec<ExecutionTask>,
        cancel: &CancellationToken,
        observer: Arc<dyn RunObserver>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if self.is_single(tasks.len()) {
            if let Some(task) = tasks.pop() {
                return self.run_single(task, cancel, observer).await;
            }
        }
        if tasks.is_empty() {
            return Err(DispatchError::NoCode);
        }

        let started = Instant::now();
        let results = if self.config.parallel {
            run_parallel(
                cancel,
                tasks,
                &self.config,
                self.backend.clone(),
                observer,
            )
            .await
        } else {
            run_sequential(
                cancel,
                tasks,
                &self.config,
                self.backend.clone(),
                observer,
            )
            .await
        };

        let summary = Summary::from_results(&results, started.elapsed());
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch finished"
        );
        Ok(DispatchOutcome::Batch { results, summary })
    }

    async fn run_single(
        &self,
        task: ExecutionTask,
        cancel: &CancellationToken,
        observer: Arc<dyn RunObserver>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled.into());
        }

        let task = Arc::new(task);
        let acquired = acquire_sandbox(self.backend.as_ref(), &self.config.selector).await?;
        let (outcome, execution_duration) = execute_task(
            self.backend.as_ref(),
            &acquired.sandbox,
            &task,
            &self.config,
            &observer,
        )
        .await;

        let mut kept_instance = None;
        if acquired.owned {
            if self.config.keep_alive {
                kept_instance = Some(acquired.sandbox.id.clone());
            }
            release_sandboxes(
                self.backend.as_ref(),
                vec![acquired.sandbox],
                self.config.keep_alive,
                observer.as_ref(),
            )
            .await;
        }

        let execution = outcome?;
        let exit_code = single_exit_code(&execution);
        Ok(DispatchOutcome::Single {
            result: TaskResult::new(
                task,
                Ok(execution),
                acquired.creation_duration,
                execution_duration,
            ),
            exit_code,
            kept_instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::runner::{NoopObserver, SandboxSelector};
    use crate::task::TaskSource;
    use crate::types::ExecutionError;
    use assert_matches::assert_matches;

    fn task(code: &str) -> ExecutionTask {
        ExecutionTask {
            id: 1,
            code: code.to_string(),
            source: TaskSource::Code,
            instance_number: 1,
            total_instances: 1,
        }
    }

    #[test]
    fn test_single_exit_code() {
        assert_eq!(single_exit_code(&Execution::default()), 0);

        let exited = Execution {
            exit_code: Some(4),
            ..Default::default()
        };
        assert_eq!(single_exit_code(&exited), 4);

        let raised = Execution {
            exit_code: Some(0),
            error: Some(ExecutionError {
                name: "E".to_string(),
                value: "v".to_string(),
                traceback: String::new(),
            }),
            ..Default::default()
        };
        assert_eq!(single_exit_code(&raised), 1);
    }

    #[tokio::test]
    async fn test_empty_is_no_code() {
        let dispatcher = Dispatcher::new(Arc::new(MockBackend::new()), RunConfig::default()).unwrap();
        let err = dispatcher
            .dispatch(Vec::new(), &CancellationToken::new(), Arc::new(NoopObserver))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::NoCode);
        assert_eq!(err.to_string(), "no code provided");
    }

    #[tokio::test]
    async fn test_single_path_propagates_remote_exit_code() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new(backend.clone(), RunConfig::default()).unwrap();
        let outcome = dispatcher
            .dispatch(vec![task("exit:3")], &CancellationToken::new(), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_matches!(outcome, DispatchOutcome::Single { exit_code: 3, kept_instance: None, .. });
        assert_eq!(backend.destroyed(), vec!["mock-1".to_string()]);
    }

    #[tokio::test]
    async fn test_single_path_creation_error_is_hard() {
        let backend = Arc::new(MockBackend::new().fail_all_creates());
        let dispatcher = Dispatcher::new(backend, RunConfig::default()).unwrap();
        let err = dispatcher
            .dispatch(vec![task("x")], &CancellationToken::new(), Arc::new(NoopObserver))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::Sandbox(SandboxError::Create(_)));
    }

    #[tokio::test]
    async fn test_single_path_transport_error_still_cleans_up() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new(backend.clone(), RunConfig::default()).unwrap();
        let err = dispatcher
            .dispatch(vec![task("transport")], &CancellationToken::new(), Arc::new(NoopObserver))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::Sandbox(SandboxError::Execution(_)));
        assert_eq!(backend.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_single_path_keep_alive() {
        let backend = Arc::new(MockBackend::new());
        let config = RunConfig {
            keep_alive: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(backend.clone(), config).unwrap();
        let outcome = dispatcher
            .dispatch(vec![task("x")], &CancellationToken::new(), Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_matches!(
            outcome,
            DispatchOutcome::Single { kept_instance: Some(ref id), .. } if id == "mock-1"
        );
        assert!(backend.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_parallel_with_instance() {
        let config = RunConfig {
            selector: SandboxSelector::Existing {
                instance_id: "sbx".to_string(),
            },
            parallel: true,
            ..Default::default()
        };
        let result = Dispatcher::new(Arc::new(MockBackend::new()), config);
        assert_matches!(result, Err(DispatchError::Usage(_)));
    }

    #[tokio::test]
    async fn test_batch_summary() {
        let backend = Arc::new(MockBackend::new());
        let config = RunConfig {
            parallel: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(backend, config).unwrap();
        let mut second = task("error:boom");
        second.id = 2;
        let outcome = dispatcher
            .dispatch(
                vec![task("ok"), second],
                &CancellationToken::new(),
                Arc::new(NoopObserver),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code(), 1);
        assert_matches!(outcome, DispatchOutcome::Batch { summary, .. } if summary.failed == 1);
    }
}
