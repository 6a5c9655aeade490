use super::error::{PDFError, PDFResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation handle for one page operation.
///
/// Cloning shares the flag; terminating any clone terminates them all.
/// Long-running work calls [`ensure_not_terminated`](Self::ensure_not_terminated)
/// at its suspension points.
///
/// Based on PDF.js src/core/worker.js WorkerTask
#[derive(Debug, Clone)]
pub struct WorkerTask {
    name: Arc<str>,
    terminated: Arc<AtomicBool>,
}

impl WorkerTask {
    pub fn new(name: impl Into<String>) -> Self {
        WorkerTask {
            name: Arc::from(name.into()),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Fails with `PDFError::Terminated` once the task was cancelled.
    pub fn ensure_not_terminated(&self) -> PDFResult<()> {
        if self.is_terminated() {
            return Err(PDFError::Terminated);
        }
        Ok(())
    }
}
