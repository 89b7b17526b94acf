//! Cooperative offload for single-threaded logic tasks.
//!
//! The logic task is single-threaded by design; some work is slow. [`Go`]
//! runs such work on an auxiliary task and delivers the completion callback
//! back to the owner through a bounded callback channel that the owner
//! drains with [`Go::cb`].
//!
//! A [`LinearContext`] adds an opt-in guarantee on top of the same API:
//! functions submitted to one context execute in submission order and never
//! overlap, while their callbacks still flow through the parent engine's
//! channel. Work that needs causal order (per-entity state updates) opts in;
//! the rest of the workload stays unordered.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::error;

/// A completion callback posted back to the owning task.
pub type Cb = Box<dyn FnOnce() + Send>;

/// Offload engine. Owned by one task; that task drains [`Go::chan_cb`].
pub struct Go {
    /// Callback channel; drain with [`Go::cb`].
    pub chan_cb: mpsc::Receiver<Cb>,
    tx: mpsc::Sender<Cb>,
    pending: Arc<AtomicUsize>,
}

impl Go {
    /// Create an engine with the given callback-channel capacity
    /// (minimum 1).
    pub fn new(l: usize) -> Self {
        let (tx, chan_cb) = mpsc::channel(l.max(1));
        Self {
            chan_cb,
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `f` on an auxiliary task; once it finishes (or panics — the
    /// panic is logged), post `cb` to the callback channel.
    pub fn go(
        &self,
        f: impl FnOnce() + Send + 'static,
        cb: impl FnOnce() + Send + 'static,
    ) {
        self.pending.fetch_add(1, Ordering::Relaxed);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::task::spawn_blocking(f).await {
                if e.is_panic() {
                    error!("offloaded function panicked: {}", panic_text(e.into_panic()));
                }
            }
            let _ = tx.send(Box::new(cb) as Cb).await;
        });
    }

    /// Run one completion callback on the owning task; its panic is caught
    /// and logged. Decrements the pending counter.
    pub fn cb(&self, cb: Cb) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cb)) {
            error!("offload callback panicked: {}", panic_text(payload));
        }
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    /// Outstanding offloaded submissions.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Drain remaining callbacks until the pending counter reaches zero.
    pub async fn close(&mut self) {
        while self.pending.load(Ordering::Relaxed) > 0 {
            let next = self.chan_cb.recv().await;
            match next {
                Some(cb) => self.cb(cb),
                None => break,
            }
        }
    }

    /// Create a linear context sharing this engine's callback channel and
    /// pending counter.
    pub fn new_linear_context(&self) -> LinearContext {
        LinearContext {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
            inner: Arc::new(LinearInner {
                queue: Mutex::new(VecDeque::new()),
                execution: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

struct LinearGo {
    f: Box<dyn FnOnce() + Send>,
    cb: Cb,
}

struct LinearInner {
    queue: Mutex<VecDeque<LinearGo>>,
    execution: tokio::sync::Mutex<()>,
}

/// Serial offload pipeline: submissions to one context execute in
/// submission order, one at a time.
#[derive(Clone)]
pub struct LinearContext {
    tx: mpsc::Sender<Cb>,
    pending: Arc<AtomicUsize>,
    inner: Arc<LinearInner>,
}

impl LinearContext {
    /// Submit work to the context. Each submission appends to the context's
    /// FIFO; the spawned task takes the execution lock and runs whatever is
    /// at the head, so later submissions queue behind earlier ones.
    pub fn go(
        &self,
        f: impl FnOnce() + Send + 'static,
        cb: impl FnOnce() + Send + 'static,
    ) {
        self.pending.fetch_add(1, Ordering::Relaxed);

        {
            let mut queue = self.inner.queue.lock().expect("linear queue poisoned");
            queue.push_back(LinearGo {
                f: Box::new(f),
                cb: Box::new(cb),
            });
        }

        let tx = self.tx.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _exec = inner.execution.lock().await;

            let head = {
                let mut queue = inner.queue.lock().expect("linear queue poisoned");
                queue.pop_front()
            };
            let Some(lg) = head else { return };

            if let Err(e) = tokio::task::spawn_blocking(lg.f).await {
                if e.is_panic() {
                    error!("offloaded function panicked: {}", panic_text(e.into_panic()));
                }
            }
            let _ = tx.send(lg.cb).await;
        });
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
