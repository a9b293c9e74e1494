//! In-memory backend for tests
//!
//! Code is interpreted by a tiny script convention:
//! - `error:<msg>` raises an execution error
//! - `exit:<n>` reports exit code `n`
//! - `transport` fails the call itself
//! - `sleep:<ms>` waits before echoing
//! - anything else is echoed to stdout

use crate::error::{Result, SandboxError};
use crate::types::{
    CodeRequest, Execution, ExecutionError, OutputChunk, OutputSender, SandboxInfo, SandboxRef,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    live: Vec<String>,
    destroyed: Vec<String>,
    existing: HashSet<String>,
    executed: Vec<(String, String)>,
}

/// Scriptable backend that records what the runners did
pub struct MockBackend {
    create_calls: AtomicUsize,
    failing_creates: HashSet<usize>,
    fail_all_creates: bool,
    fail_destroy: bool,
    create_delay: Duration,
    run_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    state: Mutex<MockState>,
}

struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            failing_creates: HashSet::new(),
            fail_all_creates: false,
            fail_destroy: false,
            create_delay: Duration::ZERO,
            run_delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Fail the nth (1-based) call to `create`
    pub fn fail_create_call(mut self, n: usize) -> Self {
        self.failing_creates.insert(n);
        self
    }

    pub fn fail_all_creates(mut self) -> Self {
        self.fail_all_creates = true;
        self
    }

    pub fn fail_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Register an instance that `connect` will accept
    pub fn with_existing(self, instance_id: &str) -> Self {
        self.lock().existing.insert(instance_id.to_string());
        self
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent create/run calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn live_sandboxes(&self) -> Vec<String> {
        self.lock().live.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.lock().destroyed.clone()
    }

    /// `(sandbox_id, code)` pairs in execution order
    pub fn executed(&self) -> Vec<(String, String)> {
        self.lock().executed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl super::SandboxBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, tool: &str) -> Result<SandboxRef> {
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_all_creates || self.failing_creates.contains(&call) {
            return Err(SandboxError::Create(format!("mock create #{} failed", call)));
        }

        let id = format!("mock-{}", call);
        self.lock().live.push(id.clone());
        Ok(SandboxRef {
            id,
            tool: Some(tool.to_string()),
            access_token: Some("mock-token".to_string()),
        })
    }

    async fn connect(&self, instance_id: &str) -> Result<SandboxRef> {
        if !self.lock().existing.contains(instance_id) {
            return Err(SandboxError::Connect {
                instance_id: instance_id.to_string(),
                message: "unknown instance".to_string(),
            });
        }
        Ok(SandboxRef::new(instance_id))
    }

    async fn destroy(&self, sandbox: &SandboxRef) -> Result<()> {
        if self.fail_destroy {
            return Err(SandboxError::Destroy {
                sandbox_id: sandbox.id.clone(),
                message: "mock destroy failed".to_string(),
            });
        }
        let mut state = self.lock();
        state.live.retain(|id| id != &sandbox.id);
        state.destroyed.push(sandbox.id.clone());
        Ok(())
    }

    async fn run_code(
        &self,
        sandbox: &SandboxRef,
        request: &CodeRequest,
        output: Option<OutputSender>,
    ) -> Result<Execution> {
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        self.lock()
            .executed
            .push((sandbox.id.clone(), request.code.clone()));

        let code = request.code.trim();
        let mut delay = self.run_delay;
        let mut body = code;
        if let Some(rest) = code.strip_prefix("sleep:") {
            let (ms, tail) = rest.split_once(';').unwrap_or((rest, ""));
            delay = Duration::from_millis(ms.trim().parse().unwrap_or(0));
            body = tail.trim();
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut execution = Execution::default();
        if body == "transport" {
            return Err(SandboxError::Execution("mock transport failure".to_string()));
        } else if let Some(message) = body.strip_prefix("error:") {
            execution.error = Some(ExecutionError {
                name: "MockError".to_string(),
                value: message.trim().to_string(),
                traceback: String::new(),
            });
        } else if let Some(code) = body.strip_prefix("exit:") {
            execution.exit_code = code.trim().parse().ok();
        } else {
            let text = format!("{}\n", body);
            if let Some(tx) = &output {
                let _ = tx.send(OutputChunk::stdout(text.clone()));
            }
            execution.stdout.push(text);
            execution.exit_code = Some(0);
        }
        Ok(execution)
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        Ok(self
            .lock()
            .live
            .iter()
            .map(|id| SandboxInfo {
                id: id.clone(),
                tool: None,
                state: Some("running".to_string()),
                started_at: None,
                expires_at: None,
            })
            .collect())
    }
}
