//! Process-wide cooperative cancellation and idle tracking.
//!
//! One [`Lifecycle`] is shared by every archive worker and the
//! orchestrator. Workers bracket their work with [`Lifecycle::work`] (or
//! `started`/`done`), poll [`Lifecycle::should_stop`] at chunk boundaries,
//! and the process awaits [`Lifecycle::wait_for_idle`] before exiting so
//! in-flight writers can flush or clean up partials.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Lifecycle {
    stop: AtomicBool,
    outstanding: AtomicUsize,
    stop_notify: Notify,
    idle_notify: Notify,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one unit of outstanding work. Pair with exactly one
    /// [`Lifecycle::done`] on every exit path — prefer [`Lifecycle::work`].
    pub fn started(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Retire one unit of outstanding work, waking idle waiters when the
    /// counter reaches zero.
    pub fn done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_notify.notify_waiters();
        }
    }

    /// RAII pairing of `started`/`done`; dropping the guard retires the
    /// work even on early return or panic.
    pub fn work(&self) -> WorkGuard<'_> {
        self.started();
        WorkGuard { lifecycle: self }
    }

    /// Set the stop flag and wake anything waiting in [`Lifecycle::stopped`].
    /// Idempotent.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }

    /// Non-blocking read of the stop flag.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Resolves once a stop has been requested (immediately if it already
    /// was).
    pub async fn stopped(&self) {
        loop {
            // Register before checking the flag: `notify_waiters` only wakes
            // already-enabled waiters.
            let notified = self.stop_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.should_stop() {
                return;
            }
            notified.await;
        }
    }

    /// Blocks until the outstanding-work counter reaches zero.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// See [`Lifecycle::work`].
#[derive(Debug)]
pub struct WorkGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.done();
    }
}
