//! Module lifecycle: ordered init and run, reverse-order destroy.
//!
//! A module is a unit of server logic with its own long-running task.
//! [`init`] calls every `on_init` in registration order and then starts
//! every `run` on a fresh task; [`Running::destroy`] walks the list in
//! reverse, signalling each module's close channel, waiting for its task to
//! exit and only then calling `on_destroy` — dependents shut down before
//! their dependencies.

use std::panic::{self, AssertUnwindSafe};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// Receiving end of a module's close signal.
pub type CloseSig = mpsc::Receiver<bool>;

/// A unit of server logic.
#[async_trait]
pub trait Module: Send + 'static {
    /// Called sequentially, in registration order, before any task starts.
    fn on_init(&mut self);

    /// Long-running body. Observes `close_sig` at a well-defined point and
    /// returns to let shutdown proceed.
    async fn run(&mut self, close_sig: &mut CloseSig);

    /// Called after this module's `run` task has exited.
    fn on_destroy(&mut self);
}

struct Runner {
    close_tx: mpsc::Sender<bool>,
    handle: JoinHandle<Box<dyn Module>>,
}

/// Handle over a set of started modules.
pub struct Running {
    runners: Vec<Runner>,
}

/// Initialize and start modules in registration order.
pub fn init(mut mods: Vec<Box<dyn Module>>) -> Running {
    for m in &mut mods {
        m.on_init();
    }

    let runners = mods
        .into_iter()
        .map(|mut m| {
            let (close_tx, mut close_rx) = mpsc::channel(1);
            let handle = tokio::spawn(async move {
                m.run(&mut close_rx).await;
                m
            });
            Runner { close_tx, handle }
        })
        .collect();

    Running { runners }
}

impl Running {
    /// Shut modules down in reverse registration order: signal, wait for
    /// the task, then `on_destroy` (panics captured and logged).
    pub async fn destroy(mut self) {
        while let Some(runner) = self.runners.pop() {
            let _ = runner.close_tx.send(true).await;
            match runner.handle.await {
                Ok(mut m) => {
                    if let Err(payload) =
                        panic::catch_unwind(AssertUnwindSafe(|| m.on_destroy()))
                    {
                        let text = if let Some(s) = payload.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = payload.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "panic".to_string()
                        };
                        error!("module destroy panicked: {}", text);
                    }
                }
                Err(e) => error!("module task failed: {}", e),
            }
        }
    }
}
