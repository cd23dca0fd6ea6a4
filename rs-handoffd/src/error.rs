use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::listener::Network;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The generation could not obtain its listener. Fatal at startup.
    #[error("can't listen on {network} {address}: {source}")]
    Listen {
        network: Network,
        address: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("an upgrade is already in progress")]
    InProgress,

    #[error("this generation is already exiting")]
    Exiting,

    #[error("failed to spawn successor: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to hand over descriptors: {0}")]
    Transfer(#[source] io::Error),

    #[error("malformed handoff manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("successor exited before it was ready: {0}")]
    SuccessorExited(ExitStatus),

    #[error("successor gave up before it was ready")]
    SuccessorGone,

    #[error("successor not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("failed to notify readiness: {0}")]
    Notify(#[source] io::Error),
}
