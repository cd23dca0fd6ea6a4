use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::fds::FdRegistry;
use super::{UpgradeGate, Upgrader};
use crate::error::UpgradeError;

/// Starts a successor generation. Called from within the runtime, so it may
/// `tokio::spawn` the successor's coordinator.
pub type Spawner = Arc<dyn Fn(LocalUpgrader) + Send + Sync>;

/// Runs generations side by side in one process.
///
/// The successor receives duplicates of the offered descriptors directly and
/// reports readiness over a oneshot channel instead of a socket.
pub struct LocalUpgrader {
    registry: FdRegistry,
    spawner: Spawner,
    parent: Mutex<Option<oneshot::Sender<()>>>,
    gate: UpgradeGate,
    ready_timeout: Duration,
    successors: AtomicUsize,
}

impl LocalUpgrader {
    pub fn new(spawner: Spawner) -> Self {
        Self::with_registry(FdRegistry::default(), spawner)
    }

    pub fn with_registry(registry: FdRegistry, spawner: Spawner) -> Self {
        Self {
            registry,
            spawner,
            parent: Mutex::new(None),
            gate: UpgradeGate::default(),
            ready_timeout: Duration::from_secs(5),
            successors: AtomicUsize::new(0),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Number of successors this generation has spawned.
    pub fn successors(&self) -> usize {
        self.successors.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upgrader for LocalUpgrader {
    fn registry(&self) -> &FdRegistry {
        &self.registry
    }

    async fn request_successor(&self) -> Result<(), UpgradeError> {
        let attempt = self.gate.begin()?;

        let fds = self.registry.export().map_err(UpgradeError::Transfer)?;
        debug!("handing over {} descriptors in-process", fds.len());
        let (ready_tx, ready_rx) = oneshot::channel();
        let child = LocalUpgrader {
            registry: FdRegistry::with_inherited(fds),
            spawner: Arc::clone(&self.spawner),
            parent: Mutex::new(Some(ready_tx)),
            gate: UpgradeGate::default(),
            ready_timeout: self.ready_timeout,
            successors: AtomicUsize::new(0),
        };
        self.successors.fetch_add(1, Ordering::SeqCst);
        (self.spawner)(child);

        match tokio::time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(())) => {
                self.registry.mark_handed_over();
                attempt.succeeded();
                Ok(())
            }
            Ok(Err(_)) => Err(UpgradeError::SuccessorGone),
            Err(_) => Err(UpgradeError::ReadyTimeout(self.ready_timeout)),
        }
    }

    async fn signal_ready(&self) -> Result<(), UpgradeError> {
        if let Some(parent) = self.parent.lock().take() {
            // The parent may have timed out already; it no longer cares.
            let _ = parent.send(());
        }
        Ok(())
    }

    async fn wait_for_exit(&self) {
        self.gate.exited().await
    }

    fn stop(&self) {
        self.gate.stop();
    }
}
