//! Timers and scheduled jobs, delivered to the owning task.
//!
//! A [`Dispatcher`] turns elapsed timers into items on a bounded channel so
//! their callbacks run on whichever task drains [`Dispatcher::chan_timer`]
//! (with [`Timer::cb`]), never on the timing task itself. [`after_func`]
//! registers a one-shot timer; [`cron_func`] schedules a recurring job from
//! a [`CronExpr`].
//!
//! [`after_func`]: Dispatcher::after_func
//! [`cron_func`]: Dispatcher::cron_func

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::cronexpr::CronExpr;
use crate::error::{Error, Result};

type TimerCb = Box<dyn FnOnce() + Send>;

/// Fans elapsed timers into a bounded channel owned by one task.
pub struct Dispatcher {
    /// Elapsed timers; drain and run with [`Timer::cb`].
    pub chan_timer: mpsc::Receiver<Timer>,
    tx: mpsc::Sender<Timer>,
}

/// An elapsed timer, carrying its callback to the owning task.
pub struct Timer {
    cb: Option<TimerCb>,
    stopped: Arc<AtomicBool>,
}

impl Timer {
    /// Run the callback, unless the timer was stopped after firing. Panics
    /// are captured and logged.
    pub fn cb(&mut self) {
        let Some(cb) = self.cb.take() else { return };
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cb)) {
            let text = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "panic".to_string()
            };
            error!("timer callback panicked: {}", text);
        }
    }
}

/// Handle for cancelling a timer registered with
/// [`Dispatcher::after_func`].
#[derive(Debug)]
pub struct TimerRef {
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerRef {
    /// Stop the timer. A timer that already fired has its callback
    /// suppressed when the owner drains it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.task.abort();
    }
}

/// Handle for cancelling a scheduled job registered with
/// [`Dispatcher::cron_func`].
#[derive(Debug)]
pub struct Cron {
    t: TimerRef,
}

impl Cron {
    /// Stop the schedule; no further fires are delivered.
    pub fn stop(&self) {
        self.t.stop();
    }
}

impl Dispatcher {
    /// Create a dispatcher with the given timer-channel capacity
    /// (minimum 1).
    pub fn new(l: usize) -> Self {
        let (tx, chan_timer) = mpsc::channel(l.max(1));
        Self { chan_timer, tx }
    }

    /// Register a one-shot timer: after `d`, a [`Timer`] carrying `cb` is
    /// posted to the dispatcher channel.
    pub fn after_func(
        &self,
        d: std::time::Duration,
        cb: impl FnOnce() + Send + 'static,
    ) -> TimerRef {
        let stopped = Arc::new(AtomicBool::new(false));
        let tx = self.tx.clone();
        let flag = stopped.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(d).await;
            let _ = tx
                .send(Timer {
                    cb: Some(Box::new(cb)),
                    stopped: flag,
                })
                .await;
        });
        TimerRef { stopped, task }
    }

    /// Schedule a recurring job. Each matching instant of `expr` posts a
    /// timer invoking `cb`. Fails when the expression never fires again.
    pub fn cron_func(
        &self,
        expr: &str,
        cb: impl Fn() + Send + Sync + 'static,
    ) -> Result<Cron> {
        let cron_expr = CronExpr::new(expr)?;

        let now = Local::now();
        let first = cron_expr
            .next_after(now)
            .ok_or_else(|| Error::Protocol("next time not found".to_string()))?;

        let stopped = Arc::new(AtomicBool::new(false));
        let tx = self.tx.clone();
        let flag = stopped.clone();
        let cb = Arc::new(cb);

        let task = tokio::spawn(async move {
            let mut next = first;
            loop {
                let wait = (next - Local::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;

                if flag.load(Ordering::Acquire) {
                    return;
                }
                let cb = cb.clone();
                let fire = Timer {
                    cb: Some(Box::new(move || cb())),
                    stopped: flag.clone(),
                };
                if tx.send(fire).await.is_err() {
                    return;
                }

                match cron_expr.next_after(next) {
                    Some(t) => next = t,
                    None => return,
                }
            }
        });

        Ok(Cron {
            t: TimerRef { stopped, task },
        })
    }
}
