//! Bookkeeping for descriptors crossing a generation boundary.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::HandoffGuard;
use crate::listener::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FdKind {
    Listener,
    Connection,
}

/// Identifies a descriptor in the handoff manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FdKey {
    pub kind: FdKind,
    pub network: Network,
    pub address: String,
}

impl FdKey {
    pub fn new(kind: FdKind, network: Network, address: &str) -> Self {
        Self {
            kind,
            network,
            address: address.to_string(),
        }
    }
}

struct Offered {
    id: u64,
    fd: OwnedFd,
    handed_over: CancellationToken,
}

/// Descriptors received from the parent generation, and the ones this
/// generation offers to its successor.
///
/// Offered descriptors are duplicates, so the registry keeps the underlying
/// socket alive only while the matching [`HandoffGuard`] is held.
#[derive(Default)]
pub struct FdRegistry {
    inherited: Mutex<HashMap<FdKey, OwnedFd>>,
    offered: Arc<Mutex<HashMap<FdKey, Offered>>>,
    // Offers included in the most recent export.
    exported: Mutex<Vec<CancellationToken>>,
    next_id: AtomicU64,
}

impl FdRegistry {
    pub fn with_inherited(fds: Vec<(FdKey, OwnedFd)>) -> Self {
        Self {
            inherited: Mutex::new(fds.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn take_inherited(&self, key: &FdKey) -> Option<OwnedFd> {
        self.inherited.lock().remove(key)
    }

    pub fn inherited_len(&self) -> usize {
        self.inherited.lock().len()
    }

    pub fn register_listener(
        &self,
        network: Network,
        address: &str,
        fd: BorrowedFd<'_>,
    ) -> io::Result<HandoffGuard> {
        self.offer(FdKey::new(FdKind::Listener, network, address), fd)
    }

    /// A later registration under the same key replaces the earlier one.
    pub fn register_connection(
        &self,
        network: Network,
        address: &str,
        fd: BorrowedFd<'_>,
    ) -> io::Result<HandoffGuard> {
        self.offer(FdKey::new(FdKind::Connection, network, address), fd)
    }

    fn offer(&self, key: FdKey, fd: BorrowedFd<'_>) -> io::Result<HandoffGuard> {
        let fd = fd.try_clone_to_owned()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handed_over = CancellationToken::new();
        self.offered.lock().insert(
            key.clone(),
            Offered {
                id,
                fd,
                handed_over: handed_over.clone(),
            },
        );

        let offered = Arc::clone(&self.offered);
        Ok(HandoffGuard::new(handed_over, move || {
            let mut offered = offered.lock();
            if offered.get(&key).is_some_and(|o| o.id == id) {
                offered.remove(&key);
            }
        }))
    }

    /// Duplicates every offered descriptor for a successor. The offers are
    /// remembered until the next export so [`FdRegistry::mark_handed_over`]
    /// can tell their holders.
    pub fn export(&self) -> io::Result<Vec<(FdKey, OwnedFd)>> {
        let offered = self.offered.lock();
        let mut fds = Vec::with_capacity(offered.len());
        let mut tokens = Vec::with_capacity(offered.len());
        for (key, o) in offered.iter() {
            fds.push((key.clone(), o.fd.try_clone()?));
            tokens.push(o.handed_over.clone());
        }
        *self.exported.lock() = tokens;
        // Listeners first, then connections, keeping the manifest stable.
        fds.sort_by(|(a, _), (b, _)| {
            let rank = |k: &FdKey| (k.kind == FdKind::Connection, k.address.clone());
            rank(a).cmp(&rank(b))
        });
        Ok(fds)
    }

    /// Called once the successor that received the last export is serving.
    /// Offers made after that export are untouched.
    pub fn mark_handed_over(&self) -> usize {
        let exported = std::mem::take(&mut *self.exported.lock());
        for token in &exported {
            token.cancel();
        }
        exported.len()
    }

    pub fn offered_len(&self) -> usize {
        self.offered.lock().len()
    }
}
