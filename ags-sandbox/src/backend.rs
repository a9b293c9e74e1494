//! Sandbox backend trait and implementations

mod e2b;
mod local;
#[cfg(any(test, feature = "testing"))]
mod mock;
mod tracked;

use crate::error::{Result, SandboxError};
use crate::token_cache::TokenCache;
use crate::types::{
    CodeRequest, Execution, FileEntry, OutputSender, ProcessInfo, SandboxInfo, SandboxRef,
};
use ags_common::{AppConfig, BackendKind};
use async_trait::async_trait;
use std::sync::Arc;

pub use e2b::{E2bBackend, E2bEndpoints};
pub use local::LocalBackend;
#[cfg(any(test, feature = "testing"))]
pub use mock::MockBackend;
pub use tracked::TrackedBackend;

fn unsupported(backend: &str, operation: &str) -> SandboxError {
    SandboxError::Unsupported {
        backend: backend.to_string(),
        operation: operation.to_string(),
    }
}

/// Control plane and data plane operations.
///
/// The runners only need the lifecycle methods and `run_code`. File and
/// process operations back the `file` and `exec ps` commands; backends that
/// cannot offer them keep the default, which fails with
/// [`SandboxError::Unsupported`].
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Backend name, used in logs and error messages
    fn name(&self) -> &str;

    /// Create a new sandbox from a tool (template)
    async fn create(&self, tool: &str) -> Result<SandboxRef>;

    /// Attach to an existing sandbox
    async fn connect(&self, instance_id: &str) -> Result<SandboxRef>;

    /// Destroy a sandbox
    async fn destroy(&self, sandbox: &SandboxRef) -> Result<()>;

    /// Run code and collect the execution.
    ///
    /// When `output` is set, stdout/stderr chunks are also sent there as they
    /// arrive. The sender is dropped before this returns.
    async fn run_code(
        &self,
        sandbox: &SandboxRef,
        request: &CodeRequest,
        output: Option<OutputSender>,
    ) -> Result<Execution>;

    /// List sandboxes visible to this backend
    async fn list(&self) -> Result<Vec<SandboxInfo>>;

    /// Details of one sandbox
    async fn get(&self, instance_id: &str) -> Result<SandboxInfo> {
        self.list()
            .await?
            .into_iter()
            .find(|info| info.id == instance_id)
            .ok_or_else(|| SandboxError::Connect {
                instance_id: instance_id.to_string(),
                message: "instance not found".to_string(),
            })
    }

    /// Entries under `path`, descending `depth` levels (1 = direct children)
    async fn list_files(
        &self,
        _sandbox: &SandboxRef,
        _path: &str,
        _depth: u32,
    ) -> Result<Vec<FileEntry>> {
        Err(unsupported(self.name(), "listing files"))
    }

    async fn stat_file(&self, _sandbox: &SandboxRef, _path: &str) -> Result<FileEntry> {
        Err(unsupported(self.name(), "file stat"))
    }

    async fn read_file(&self, _sandbox: &SandboxRef, _path: &str) -> Result<Vec<u8>> {
        Err(unsupported(self.name(), "file download"))
    }

    /// Create or overwrite a file, creating missing parent directories
    async fn write_file(&self, _sandbox: &SandboxRef, _path: &str, _data: &[u8]) -> Result<()> {
        Err(unsupported(self.name(), "file upload"))
    }

    /// Remove a file or a directory tree
    async fn remove_file(&self, _sandbox: &SandboxRef, _path: &str) -> Result<()> {
        Err(unsupported(self.name(), "file removal"))
    }

    /// Create a directory and any missing parents
    async fn make_dir(&self, _sandbox: &SandboxRef, _path: &str) -> Result<()> {
        Err(unsupported(self.name(), "creating directories"))
    }

    async fn list_processes(&self, _sandbox: &SandboxRef) -> Result<Vec<ProcessInfo>> {
        Err(unsupported(self.name(), "listing processes"))
    }
}

/// Build the backend selected by the configuration
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendKind::E2b => {
            let api_key = config.e2b.api_key.clone().unwrap_or_default();
            let backend = E2bBackend::new(
                api_key,
                E2bEndpoints::from_config(&config.e2b),
                config.sandbox.timeout,
                Arc::new(TokenCache::new()?),
            )?;
            Ok(Arc::new(backend))
        }
        BackendKind::Local => Ok(Arc::new(LocalBackend::new())),
    }
}
