//! Drives one process generation from startup to exit.
//!
//! ```text
//! Starting -> Serving -> Upgrading -> Draining -> Exited
//!                ^           |
//!                +-----------+  (upgrade failed)
//! ```
//!
//! A generation acquires its listener, starts accepting, and only then tells
//! the upgrader it is ready. It leaves `Serving` when a successor has taken
//! over or a stop is requested; either way it cancels outstanding work and
//! waits for the [`DrainSet`] to empty before returning.

use std::io;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accept::{self, Dispatcher};
use crate::config::ServerConf;
use crate::drain::DrainSet;
use crate::error::{Result, UpgradeError};
use crate::handler::ConnectionHandler;
use crate::listener::{self, Network};
use crate::signals::{Command, CommandReceiver};
use crate::upgrader::Upgrader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Starting,
    Serving,
    Upgrading,
    Draining,
    Exited,
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A successor is serving the listener now.
    Upgraded,
    Stopped,
}

pub struct Coordinator {
    id: Uuid,
    conf: ServerConf,
    upgrader: Arc<dyn Upgrader>,
    handler: Arc<dyn ConnectionHandler>,
    drain: DrainSet,
    cancel: CancellationToken,
    state: watch::Sender<GenerationState>,
}

impl Coordinator {
    pub fn new(
        conf: ServerConf,
        upgrader: Arc<dyn Upgrader>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (state, _) = watch::channel(GenerationState::Starting);
        Self {
            id: Uuid::new_v4(),
            conf,
            upgrader,
            handler,
            drain: DrainSet::new(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    /// The units this generation is still waiting on.
    pub fn drain(&self) -> DrainSet {
        self.drain.clone()
    }

    /// Runs the generation to completion. Only a failure to obtain the
    /// listener is returned as an error.
    pub async fn run(self, mut commands: CommandReceiver) -> Result<Exit> {
        let id = self.id;
        info!("generation {id} starting");

        let acquired =
            listener::acquire(self.upgrader.as_ref(), self.conf.network, &self.conf.listen).await;
        let listener = match acquired {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(GenerationState::Exited);
                return Err(e);
            }
        };
        let inherited = self
            .upgrader
            .take_inherited_connection(self.conf.network, &self.conf.listen)
            .unwrap_or_else(|e| {
                warn!("failed to adopt connection from parent: {e}");
                None
            });

        let dispatcher = Dispatcher {
            handler: Arc::clone(&self.handler),
            upgrader: Arc::clone(&self.upgrader),
            drain: self.drain.clone(),
            cancel: self.cancel.clone(),
            network: self.conf.network,
            address: self.conf.listen.clone(),
        };
        let unit = self.drain.register();
        tokio::spawn(accept::run(listener, inherited, dispatcher, unit));

        if let Err(e) = self.upgrader.signal_ready().await {
            warn!("generation {id} could not report readiness: {e}");
        }
        self.state.send_replace(GenerationState::Serving);
        info!(
            "generation {id} serving {} {}",
            self.conf.network, self.conf.listen
        );

        let exit = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Command::Upgrade => {
                        self.state.send_replace(GenerationState::Upgrading);
                        info!("generation {id} upgrading");
                        match self.upgrade(&mut commands).await {
                            Some(Ok(())) => {
                                info!("successor is ready");
                                break Exit::Upgraded;
                            }
                            Some(Err(e)) => {
                                error!("upgrade failed: {e}");
                                self.state.send_replace(GenerationState::Serving);
                            }
                            None => {
                                warn!("generation {id} stopping, upgrade abandoned");
                                break Exit::Stopped;
                            }
                        }
                    }
                    Command::Stop => break Exit::Stopped,
                },
                _ = self.upgrader.wait_for_exit() => break Exit::Stopped,
            }
        };

        self.shutdown(exit).await;
        Ok(exit)
    }

    /// Waits for the successor while still listening for commands. Returns
    /// `None` if a stop arrived first; the attempt is dropped, which kills a
    /// successor that has not reported ready.
    async fn upgrade(&self, commands: &mut CommandReceiver) -> Option<Result<(), UpgradeError>> {
        let attempt = self.upgrader.request_successor();
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                res = &mut attempt => return Some(res),
                command = commands.recv() => match command {
                    Command::Stop => return None,
                    Command::Upgrade => debug!("upgrade already in progress"),
                },
            }
        }
    }

    async fn shutdown(&self, exit: Exit) {
        let id = self.id;
        self.upgrader.stop();
        self.cancel.cancel();
        self.state.send_replace(GenerationState::Draining);
        info!("generation {id} draining ({exit:?})");

        match self.conf.graceful_shutdown_timeout() {
            Some(limit) => {
                if tokio::time::timeout(limit, self.drain.wait()).await.is_err() {
                    warn!(
                        "{} units still busy after {limit:?}, exiting anyway",
                        self.drain.active()
                    );
                }
            }
            None => self.drain.wait().await,
        }

        // A successor keeps using the socket path; after a plain stop nobody will.
        if exit == Exit::Stopped && self.conf.network == Network::Unix {
            match std::fs::remove_file(&self.conf.listen) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {e}", self.conf.listen),
            }
        }

        self.state.send_replace(GenerationState::Exited);
        info!("generation {id} exited");
    }
}
