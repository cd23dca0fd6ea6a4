//! Tracks the units of work a generation must finish before it exits.
//!
//! Every accept loop and connection handler holds a [`DrainUnit`] from before
//! it is spawned until after its last I/O completes. [`DrainSet`] is a cheap
//! handle onto one shared set: clones observe the same units.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct DrainSet {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    active: AtomicUsize,
    empty: Notify,
}

impl DrainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit. It stays in the set until the returned guard is dropped.
    pub fn register(&self) -> DrainUnit {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        DrainUnit {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves once no units remain. Returns immediately if the set is empty.
    pub async fn wait(&self) {
        loop {
            // Arm the notification before checking so a release between the
            // load and the await is not missed.
            let notified = self.inner.empty.notified();
            let active = self.inner.active.load(Ordering::SeqCst);
            if active == 0 {
                return;
            }
            debug!("waiting for {active} units to drain");
            notified.await;
        }
    }
}

/// Membership of one unit of work in a [`DrainSet`].
pub struct DrainUnit {
    inner: Arc<Inner>,
}

impl Drop for DrainUnit {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.empty.notify_waiters();
        }
    }
}
