//! AGS sandbox engine - run code snippets in remote sandboxes
//!
//! Builds execution tasks from user input, runs them sequentially in one
//! sandbox or in parallel across many, and aggregates the results into a
//! summary and exit code. Sandbox lifecycle and code execution go through
//! the [`SandboxBackend`] trait (E2B-compatible API or local processes).

pub mod backend;
mod dispatch;
mod error;
mod runner;
mod session;
mod summary;
mod task;
mod token_cache;
mod types;

#[cfg(any(test, feature = "testing"))]
pub use backend::MockBackend;
pub use backend::{E2bBackend, E2bEndpoints, LocalBackend, SandboxBackend, TrackedBackend};
pub use dispatch::{single_exit_code, DispatchError, DispatchOutcome, Dispatcher};
pub use error::{Result, SandboxError};
pub use runner::{
    run_parallel, run_sequential, NoopObserver, RunConfig, RunObserver, SandboxSelector,
    TaskResult,
};
pub use session::SandboxSession;
pub use summary::Summary;
pub use task::{
    build_tasks, editor_template, find_editor, normalize_editor_buffer, open_editor,
    ExecutionTask, InputSource, StdInputSource, TaskBuildError, TaskInput, TaskLabel, TaskSource,
};
pub use token_cache::TokenCache;
pub use types::{
    CodeRequest, Execution, ExecutionError, FileEntry, FileType, Language, OutputChunk,
    OutputSender, ProcessInfo, ResultPayload, SandboxInfo, SandboxRef, StreamKind,
};
