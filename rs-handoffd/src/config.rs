use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::listener::Network;
use crate::upgrader::UpgraderOptions;

/// Settings for one server generation. A successor is started with the same
/// command line, so every generation sees the same configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "handoffd", version, about = "Line echo server with zero-downtime upgrades")]
pub struct ServerConf {
    /// Address to listen on: host:port for tcp, a filesystem path for unix
    #[arg(long = "listen", value_name = "ADDRESS", default_value = "localhost:8080", env = "HANDOFFD_LISTEN")]
    pub listen: String,

    #[arg(long = "net", value_enum, default_value_t = Network::Tcp, env = "HANDOFFD_NET")]
    pub network: Network,

    /// Path to pid file
    #[arg(long, value_name = "PATH", default_value = "main.pid", env = "HANDOFFD_PID_FILE")]
    pub pid_file: PathBuf,

    /// Socket a parent waits on for its successor during an upgrade
    #[arg(long, value_name = "PATH", default_value = "/tmp/handoffd_upgrade.sock", env = "HANDOFFD_UPGRADE_SOCK")]
    pub upgrade_sock: PathBuf,

    /// How long a successor may take to become ready
    #[arg(long = "ready-timeout", value_name = "SECONDS", default_value_t = 30, env = "HANDOFFD_READY_TIMEOUT")]
    pub ready_timeout_seconds: u64,

    /// Stop gracefully on SIGTERM and SIGINT
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "HANDOFFD_HANDLE_TERMINATE")]
    pub handle_terminate: bool,

    /// Give up waiting for connections to finish after this long
    #[arg(long = "graceful-shutdown-timeout", value_name = "SECONDS", env = "HANDOFFD_GRACEFUL_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout_seconds: Option<u64>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            listen: "localhost:8080".to_string(),
            network: Network::Tcp,
            pid_file: PathBuf::from("main.pid"),
            upgrade_sock: PathBuf::from("/tmp/handoffd_upgrade.sock"),
            ready_timeout_seconds: 30,
            handle_terminate: true,
            graceful_shutdown_timeout_seconds: None,
        }
    }
}

impl ServerConf {
    pub fn graceful_shutdown_timeout(&self) -> Option<Duration> {
        self.graceful_shutdown_timeout_seconds.map(Duration::from_secs)
    }

    pub fn upgrader_options(&self) -> UpgraderOptions {
        UpgraderOptions {
            pid_file: Some(self.pid_file.clone()),
            upgrade_sock: self.upgrade_sock.clone(),
            ready_timeout: Duration::from_secs(self.ready_timeout_seconds),
            successor: None,
        }
    }
}
