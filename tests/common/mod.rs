//! Common test utilities shared across integration tests

use ags_sandbox::{
    ExecutionTask, InputSource, Language, OutputChunk, RunConfig, RunObserver, SandboxSelector,
    TaskBuildError, TaskLabel, TaskResult, TaskSource,
};
use std::sync::Mutex;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// `n` literal tasks whose code is produced by `code(i)` for the 1-based id
pub fn tasks_from(n: usize, code: impl Fn(usize) -> String) -> Vec<ExecutionTask> {
    (1..=n)
        .map(|id| ExecutionTask {
            id,
            code: code(id),
            source: TaskSource::Code,
            instance_number: id,
            total_instances: n,
        })
        .collect()
}

/// Default config for the mock tool
pub fn mock_config() -> RunConfig {
    RunConfig {
        selector: SandboxSelector::Create {
            tool: "mock-tool".to_string(),
        },
        ..RunConfig::default()
    }
}

/// Input source that never finds piped input or an editor
pub struct NoInput;

impl InputSource for NoInput {
    fn read_piped(&mut self) -> Result<Option<String>, TaskBuildError> {
        Ok(None)
    }

    fn edit(&mut self, _language: Language) -> Result<Option<String>, TaskBuildError> {
        Err(TaskBuildError::NoEditor)
    }
}

/// Observer that records everything it is told
#[derive(Default)]
pub struct RecordingObserver {
    pub output: Mutex<Vec<(TaskLabel, OutputChunk)>>,
    pub finished: Mutex<Vec<usize>>,
    pub kept: Mutex<Vec<String>>,
}

impl RunObserver for RecordingObserver {
    fn on_output(&self, task: &TaskLabel, chunk: &OutputChunk) {
        self.output
            .lock()
            .unwrap()
            .push((task.clone(), chunk.clone()));
    }

    fn on_task_finished(&self, result: &TaskResult) {
        self.finished.lock().unwrap().push(result.task.id);
    }

    fn on_sandboxes_kept(&self, sandbox_ids: &[String]) {
        self.kept.lock().unwrap().extend_from_slice(sandbox_ids);
    }
}
