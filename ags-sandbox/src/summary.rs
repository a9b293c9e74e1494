use crate::runner::TaskResult;
use std::time::Duration;

/// Aggregate counts for a finished batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Wall-clock time of the whole batch
    pub duration: Duration,
}

impl Summary {
    pub fn from_results(results: &[TaskResult], duration: Duration) -> Self {
        let failed = results.iter().filter(|r| r.is_failure()).count();
        Self {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
            duration,
        }
    }

    /// 0 when nothing failed, 2 when everything failed, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else if self.failed < self.total {
            1
        } else {
            2
        }
    }
}
