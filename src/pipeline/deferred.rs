use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of callbacks that the scheduler runs once per cycle on its own task.
#[derive(Clone, Default)]
pub struct DeferredQueue {
    inner: Arc<Mutex<VecDeque<Deferred>>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.lock().push_back(Box::new(f));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Runs everything queued so far. Callbacks queued while draining wait
    /// for the next drain. A panicking callback is logged and skipped.
    pub fn drain(&self) -> usize {
        let pending: Vec<Deferred> = self.inner.lock().drain(..).collect();
        let n = pending.len();
        for f in pending {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                log::error!("[SCHEDULER] Deferred callback panicked");
            }
        }
        n
    }
}
