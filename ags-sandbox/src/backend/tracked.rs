//! Backend wrapper that remembers the sandboxes it created

use crate::error::Result;
use crate::types::{
    CodeRequest, Execution, FileEntry, OutputSender, ProcessInfo, SandboxInfo, SandboxRef,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::SandboxBackend;

/// Forwards every call to an inner backend and tracks which created
/// sandboxes have not been destroyed yet, so an aborted run can still clean
/// them up.
pub struct TrackedBackend {
    inner: Arc<dyn SandboxBackend>,
    live: Mutex<Vec<SandboxRef>>,
}

impl TrackedBackend {
    pub fn new(inner: Arc<dyn SandboxBackend>) -> Self {
        Self {
            inner,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Ids of created sandboxes that are still alive
    pub fn live(&self) -> Vec<String> {
        self.lock().iter().map(|s| s.id.clone()).collect()
    }

    /// Destroy every tracked sandbox, returning how many went away
    pub async fn destroy_all(&self) -> usize {
        let sandboxes: Vec<SandboxRef> = std::mem::take(&mut *self.lock());
        if sandboxes.is_empty() {
            return 0;
        }
        info!(count = sandboxes.len(), "Destroying tracked sandboxes");

        let results =
            futures::future::join_all(sandboxes.iter().map(|s| self.inner.destroy(s))).await;
        let mut destroyed = 0;
        for (sandbox, result) in sandboxes.into_iter().zip(results) {
            match result {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    warn!(sandbox_id = %sandbox.id, "Cleanup failed: {}", e);
                    self.lock().push(sandbox);
                }
            }
        }
        destroyed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SandboxRef>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SandboxBackend for TrackedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create(&self, tool: &str) -> Result<SandboxRef> {
        let sandbox = self.inner.create(tool).await?;
        self.lock().push(sandbox.clone());
        Ok(sandbox)
    }

    async fn connect(&self, instance_id: &str) -> Result<SandboxRef> {
        self.inner.connect(instance_id).await
    }

    async fn destroy(&self, sandbox: &SandboxRef) -> Result<()> {
        self.inner.destroy(sandbox).await?;
        self.lock().retain(|s| s.id != sandbox.id);
        Ok(())
    }

    async fn run_code(
        &self,
        sandbox: &SandboxRef,
        request: &CodeRequest,
        output: Option<OutputSender>,
    ) -> Result<Execution> {
        self.inner.run_code(sandbox, request, output).await
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        self.inner.list().await
    }

    async fn get(&self, instance_id: &str) -> Result<SandboxInfo> {
        self.inner.get(instance_id).await
    }

    async fn list_files(
        &self,
        sandbox: &SandboxRef,
        path: &str,
        depth: u32,
    ) -> Result<Vec<FileEntry>> {
        self.inner.list_files(sandbox, path, depth).await
    }

    async fn stat_file(&self, sandbox: &SandboxRef, path: &str) -> Result<FileEntry> {
        self.inner.stat_file(sandbox, path).await
    }

    async fn read_file(&self, sandbox: &SandboxRef, path: &str) -> Result<Vec<u8>> {
        self.inner.read_file(sandbox, path).await
    }

    async fn write_file(&self, sandbox: &SandboxRef, path: &str, data: &[u8]) -> Result<()> {
        self.inner.write_file(sandbox, path, data).await
    }

    async fn remove_file(&self, sandbox: &SandboxRef, path: &str) -> Result<()> {
        self.inner.remove_file(sandbox, path).await
    }

    async fn make_dir(&self, sandbox: &SandboxRef, path: &str) -> Result<()> {
        self.inner.make_dir(sandbox, path).await
    }

    async fn list_processes(&self, sandbox: &SandboxRef) -> Result<Vec<ProcessInfo>> {
        self.inner.list_processes(sandbox).await
    }
}
