//! A single sandbox held for the duration of one command
//!
//! Used by commands that talk to one sandbox outside the runners (file
//! transfer, process listing). Selection follows the runners: a fresh sandbox
//! is created from a tool, or an existing instance is attached and never
//! destroyed.

use crate::backend::SandboxBackend;
use crate::error::Result;
use crate::runner::{acquire_sandbox, SandboxSelector};
use crate::types::SandboxRef;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct SandboxSession {
    backend: Arc<dyn SandboxBackend>,
    sandbox: SandboxRef,
    owned: bool,
    keep_alive: bool,
    creation_duration: Duration,
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("backend", &self.backend.name())
            .field("sandbox", &self.sandbox)
            .field("owned", &self.owned)
            .field("keep_alive", &self.keep_alive)
            .field("creation_duration", &self.creation_duration)
            .finish()
    }
}

impl SandboxSession {
    pub async fn open(
        backend: Arc<dyn SandboxBackend>,
        selector: &SandboxSelector,
        keep_alive: bool,
    ) -> Result<Self> {
        let acquired = acquire_sandbox(backend.as_ref(), selector).await?;
        Ok(Self {
            backend,
            sandbox: acquired.sandbox,
            owned: acquired.owned,
            keep_alive,
            creation_duration: acquired.creation_duration,
        })
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.backend.as_ref()
    }

    pub fn sandbox(&self) -> &SandboxRef {
        &self.sandbox
    }

    /// Zero when an existing instance was attached
    pub fn creation_duration(&self) -> Duration {
        self.creation_duration
    }

    /// Release the sandbox. Returns its id when a created sandbox was kept.
    pub async fn close(self) -> Option<String> {
        if !self.owned {
            return None;
        }
        if self.keep_alive {
            info!(sandbox_id = %self.sandbox.id, "Keeping sandbox alive");
            return Some(self.sandbox.id);
        }
        if let Err(e) = self.backend.destroy(&self.sandbox).await {
            warn!(sandbox_id = %self.sandbox.id, "Cleanup failed: {}", e);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::error::SandboxError;
    use assert_matches::assert_matches;

    fn create() -> SandboxSelector {
        SandboxSelector::Create {
            tool: "tool".to_string(),
        }
    }

    #[tokio::test]
    async fn test_created_sandbox_is_destroyed_on_close() {
        let mock = Arc::new(MockBackend::new());
        let session = SandboxSession::open(mock.clone(), &create(), false)
            .await
            .unwrap();
        assert_eq!(session.sandbox().id, "mock-1");

        assert_eq!(session.close().await, None);
        assert_eq!(mock.destroyed(), vec!["mock-1".to_string()]);
    }

    #[tokio::test]
    async fn test_keep_alive_reports_the_sandbox() {
        let mock = Arc::new(MockBackend::new());
        let session = SandboxSession::open(mock.clone(), &create(), true)
            .await
            .unwrap();

        assert_eq!(session.close().await, Some("mock-1".to_string()));
        assert_eq!(mock.live_sandboxes(), vec!["mock-1".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_instance_is_left_alone() {
        let mock = Arc::new(MockBackend::new().with_existing("sbx-user"));
        let selector = SandboxSelector::Existing {
            instance_id: "sbx-user".to_string(),
        };
        let session = SandboxSession::open(mock.clone(), &selector, false)
            .await
            .unwrap();
        assert_eq!(session.creation_duration(), Duration::ZERO);

        assert_eq!(session.close().await, None);
        assert!(mock.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let mock = Arc::new(MockBackend::new().fail_all_creates());
        let result = SandboxSession::open(mock, &create(), false).await;
        assert_matches!(result, Err(SandboxError::Create(_)));
    }
}
