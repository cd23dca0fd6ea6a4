use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use sd_notify::NotifyState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::fds::FdRegistry;
use super::{transfer, UpgradeGate, Upgrader};
use crate::error::UpgradeError;
use crate::pidfile;

/// Set in a successor's environment to the socket its parent is waiting on.
pub const UPGRADE_SOCK_ENV: &str = "HANDOFFD_PARENT_SOCK";

const READY: &[u8] = b"R";

#[derive(Debug, Clone)]
pub struct UpgraderOptions {
    pub pid_file: Option<PathBuf>,
    pub upgrade_sock: PathBuf,
    pub ready_timeout: Duration,
    /// What to run as the successor. `None` re-executes this binary with
    /// its own arguments.
    pub successor: Option<SuccessorCommand>,
}

impl Default for UpgraderOptions {
    fn default() -> Self {
        Self {
            pid_file: None,
            upgrade_sock: PathBuf::from("/tmp/handoffd_upgrade.sock"),
            ready_timeout: Duration::from_secs(30),
            successor: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuccessorCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl SuccessorCommand {
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
        })
    }
}

/// Replaces this process with a fresh copy of the current executable.
///
/// The parent binds `upgrade_sock`, spawns the successor with the path in
/// [`UPGRADE_SOCK_ENV`], sends it every offered descriptor and waits for a
/// one byte acknowledgement that the successor is serving.
pub struct ProcessUpgrader {
    options: UpgraderOptions,
    registry: FdRegistry,
    parent: Mutex<Option<UnixStream>>,
    gate: UpgradeGate,
}

impl ProcessUpgrader {
    pub async fn new(options: UpgraderOptions) -> Result<Self, UpgradeError> {
        let (registry, parent) = match std::env::var_os(UPGRADE_SOCK_ENV) {
            Some(path) => {
                debug!("connecting to parent generation at {path:?}");
                let mut stream = UnixStream::connect(&path)
                    .await
                    .map_err(UpgradeError::Transfer)?;
                let fds = transfer::recv(&mut stream).await?;
                info!("inherited {} descriptors from parent generation", fds.len());
                (FdRegistry::with_inherited(fds), Some(stream))
            }
            None => (FdRegistry::default(), None),
        };

        Ok(Self {
            options,
            registry,
            parent: Mutex::new(parent),
            gate: UpgradeGate::default(),
        })
    }

    async fn spawn_successor(&self, sock: &UnixListener) -> Result<(), UpgradeError> {
        let command = match &self.options.successor {
            Some(command) => command.clone(),
            None => SuccessorCommand::current_exe().map_err(UpgradeError::Spawn)?,
        };
        let child = Command::new(&command.program)
            .args(&command.args)
            .env(UPGRADE_SOCK_ENV, &self.options.upgrade_sock)
            .stdin(Stdio::null())
            .spawn()
            .map_err(UpgradeError::Spawn)?;
        info!("spawned successor {}", child.id().unwrap_or_default());
        let mut successor = Successor(Some(child));

        let timeout = self.options.ready_timeout;
        tokio::select! {
            res = self.handshake(sock) => res?,
            status = successor.wait() => return Err(match status {
                Ok(status) => UpgradeError::SuccessorExited(status),
                Err(e) => UpgradeError::Spawn(e),
            }),
            _ = tokio::time::sleep(timeout) => return Err(UpgradeError::ReadyTimeout(timeout)),
        }
        successor.detach();
        Ok(())
    }

    async fn handshake(&self, sock: &UnixListener) -> Result<(), UpgradeError> {
        let (mut stream, _) = sock.accept().await.map_err(UpgradeError::Transfer)?;
        let fds = self.registry.export().map_err(UpgradeError::Transfer)?;
        debug!("handing over {} descriptors", fds.len());
        transfer::send(&stream, &fds).await?;
        drop(fds);

        let mut ack = [0u8; 1];
        match stream.read(&mut ack).await {
            Ok(1) if &ack[..] == READY => Ok(()),
            Ok(_) => Err(UpgradeError::SuccessorGone),
            Err(e) => Err(UpgradeError::Transfer(e)),
        }
    }
}

/// A successor that has not reported ready yet. Killed if dropped before
/// [`Successor::detach`], so a failed or abandoned upgrade never leaves it
/// competing for our sockets.
struct Successor(Option<Child>);

impl Successor {
    async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        match self.0.as_mut() {
            Some(child) => child.wait().await,
            None => std::future::pending().await,
        }
    }

    fn detach(mut self) {
        self.0.take();
    }
}

impl Drop for Successor {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("failed to kill successor: {e}");
            }
        }
    }
}

/// The socket a successor connects to. Removed from the filesystem on drop.
struct UpgradeSocket<'a> {
    path: &'a Path,
    listener: UnixListener,
}

impl<'a> UpgradeSocket<'a> {
    fn bind(path: &'a Path) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed leftover upgrade socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self { path, listener })
    }
}

impl Drop for UpgradeSocket<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.path) {
            debug!("failed to remove upgrade socket {}: {e}", self.path.display());
        }
    }
}

#[async_trait]
impl Upgrader for ProcessUpgrader {
    fn registry(&self) -> &FdRegistry {
        &self.registry
    }

    async fn request_successor(&self) -> Result<(), UpgradeError> {
        let attempt = self.gate.begin()?;
        let sock =
            UpgradeSocket::bind(&self.options.upgrade_sock).map_err(UpgradeError::Transfer)?;
        self.spawn_successor(&sock.listener).await?;
        drop(sock);

        let handed = self.registry.mark_handed_over();
        debug!("successor took over {handed} descriptors");
        attempt.succeeded();
        Ok(())
    }

    async fn signal_ready(&self) -> Result<(), UpgradeError> {
        let pid = std::process::id();
        if let Some(path) = &self.options.pid_file {
            pidfile::write(path, pid).map_err(UpgradeError::Notify)?;
        }
        sd_notify::notify(false, &[NotifyState::MainPid(pid), NotifyState::Ready])
            .map_err(UpgradeError::Notify)?;

        if let Some(mut parent) = self.parent.lock().await.take() {
            parent.write_all(READY).await.map_err(UpgradeError::Notify)?;
            debug!("told parent generation we are ready");
        }
        Ok(())
    }

    async fn wait_for_exit(&self) {
        self.gate.exited().await
    }

    fn stop(&self) {
        if !self.gate.is_exiting() {
            if let Err(e) = sd_notify::notify(false, &[NotifyState::Stopping]) {
                warn!("failed to notify service manager of shutdown: {e}");
            }
        }
        self.gate.stop();
    }
}
