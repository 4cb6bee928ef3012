use tokio::runtime::Handle;

use crate::error::Result;
use crate::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs units of work off the caller's thread. Used by asynchronous compaction.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job) -> Result<()>;
}

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::InvalidState(format!("no tokio runtime: {}", e)))
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        self.handle.spawn_blocking(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_current_needs_runtime() {
        assert!(matches!(TokioExecutor::current(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_runs_job_on_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = TokioExecutor::new(runtime.handle().clone());

        let (tx, rx) = mpsc::channel();
        executor
            .execute(Box::new(move || {
                tx.send(42).unwrap();
            }))
            .unwrap();

        assert_eq!(rx.recv().unwrap(), 42);
    }
}
