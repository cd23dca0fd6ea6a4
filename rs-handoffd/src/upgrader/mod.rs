//! The seam between a generation and the machinery that replaces it.
//!
//! A coordinator never talks to the OS about other processes directly: it is
//! handed an [`Upgrader`] at construction. [`ProcessUpgrader`] passes
//! descriptors to a re-executed copy of this binary; [`LocalUpgrader`] runs
//! generations side by side inside one process.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::UpgradeError;
use crate::listener::{Connection, Network};

pub mod fds;
mod local;
mod process;
pub mod transfer;

pub use local::{LocalUpgrader, Spawner};
pub use process::{ProcessUpgrader, SuccessorCommand, UpgraderOptions, UPGRADE_SOCK_ENV};

use fds::{FdKey, FdKind, FdRegistry};

#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Descriptors inherited from the parent and offered to the successor.
    fn registry(&self) -> &FdRegistry;

    /// Spawns the next generation and waits until it reports ready.
    async fn request_successor(&self) -> Result<(), UpgradeError>;

    /// Tells the parent generation (and the service manager) that this
    /// generation is accepting traffic.
    async fn signal_ready(&self) -> Result<(), UpgradeError>;

    /// Resolves once this generation should exit: a successor took over or
    /// [`Upgrader::stop`] was called.
    async fn wait_for_exit(&self);

    /// Refuses further upgrades and resolves [`Upgrader::wait_for_exit`].
    fn stop(&self);

    fn inherited_listener(&self, network: Network, address: &str) -> Option<OwnedFd> {
        self.registry()
            .take_inherited(&FdKey::new(FdKind::Listener, network, address))
    }

    fn register_listener(
        &self,
        network: Network,
        address: &str,
        fd: BorrowedFd<'_>,
    ) -> io::Result<HandoffGuard> {
        self.registry().register_listener(network, address, fd)
    }

    /// At most one connection survives from the parent per listener.
    fn take_inherited_connection(
        &self,
        network: Network,
        address: &str,
    ) -> io::Result<Option<Connection>> {
        self.registry()
            .take_inherited(&FdKey::new(FdKind::Connection, network, address))
            .map(|fd| Connection::from_fd(network, fd))
            .transpose()
    }

    fn register_connection_for_handoff(
        &self,
        network: Network,
        address: &str,
        conn: &Connection,
    ) -> io::Result<HandoffGuard> {
        self.registry()
            .register_connection(network, address, conn.as_fd())
    }
}

/// Withdraws a descriptor from the handoff set when dropped.
///
/// Once a successor has confirmed it is serving, [`HandoffGuard::handed_over`]
/// resolves for every descriptor it received. The holder must then let go of
/// its copy so the successor is the only one using it.
pub struct HandoffGuard {
    handed_over: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HandoffGuard {
    pub fn new(
        handed_over: CancellationToken,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            handed_over,
            release: Some(Box::new(release)),
        }
    }

    /// A guard for a descriptor that is never offered, so it is never
    /// handed over.
    pub fn noop() -> Self {
        Self {
            handed_over: CancellationToken::new(),
            release: None,
        }
    }

    pub fn is_handed_over(&self) -> bool {
        self.handed_over.is_cancelled()
    }

    pub async fn handed_over(&self) {
        self.handed_over.cancelled().await
    }
}

impl Drop for HandoffGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Serializes upgrade attempts and tracks whether this generation is done.
#[derive(Default)]
pub(crate) struct UpgradeGate {
    upgrading: AtomicBool,
    exit: CancellationToken,
}

impl UpgradeGate {
    pub(crate) fn begin(&self) -> Result<UpgradeAttempt<'_>, UpgradeError> {
        if self.exit.is_cancelled() {
            return Err(UpgradeError::Exiting);
        }
        if self.upgrading.swap(true, Ordering::AcqRel) {
            return Err(UpgradeError::InProgress);
        }
        Ok(UpgradeAttempt { gate: self })
    }

    pub(crate) fn stop(&self) {
        self.exit.cancel();
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.exit.is_cancelled()
    }

    pub(crate) async fn exited(&self) {
        self.exit.cancelled().await
    }
}

pub(crate) struct UpgradeAttempt<'a> {
    gate: &'a UpgradeGate,
}

impl UpgradeAttempt<'_> {
    pub(crate) fn succeeded(self) {
        self.gate.exit.cancel();
    }
}

impl Drop for UpgradeAttempt<'_> {
    fn drop(&mut self) {
        self.gate.upgrading.store(false, Ordering::Release);
    }
}
