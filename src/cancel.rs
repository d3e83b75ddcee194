use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Signal-once cancellation shared by every task of a run.
///
/// `done()` hands out a channel that disconnects on cancellation, so it can
/// sit in a `select!` next to the other event sources.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }),
        }
    }

    /// Cancel. Returns `true` for the call that actually did it.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Dropping the only sender wakes every receiver
        self.inner.done_tx.lock().take();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) once cancelled
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
