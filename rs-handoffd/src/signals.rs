//! Turns external requests into coordinator commands.
//!
//! The coordinator only sees a [`CommandReceiver`]; OS signals are one way of
//! feeding it, tests hold a [`CommandSender`] and call it directly.

use std::io;
use std::sync::Arc;
use std::thread;

use log::{debug, info};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Upgrade,
    Stop,
}

struct Shared {
    // Holds at most one permit, so upgrade requests that pile up while an
    // upgrade runs collapse into a single follow-up.
    upgrade: Notify,
    stop: CancellationToken,
}

#[derive(Clone)]
pub struct CommandSender {
    shared: Arc<Shared>,
}

pub struct CommandReceiver {
    shared: Arc<Shared>,
}

pub fn channel() -> (CommandSender, CommandReceiver) {
    let shared = Arc::new(Shared {
        upgrade: Notify::new(),
        stop: CancellationToken::new(),
    });
    (
        CommandSender {
            shared: Arc::clone(&shared),
        },
        CommandReceiver { shared },
    )
}

impl CommandSender {
    pub fn send(&self, command: Command) {
        match command {
            Command::Upgrade => self.shared.upgrade.notify_one(),
            Command::Stop => self.shared.stop.cancel(),
        }
    }

    pub fn upgrade(&self) {
        self.send(Command::Upgrade)
    }

    pub fn stop(&self) {
        self.send(Command::Stop)
    }
}

impl CommandReceiver {
    /// Waits for the next command. Once stop has been sent every call
    /// returns [`Command::Stop`].
    pub async fn recv(&mut self) -> Command {
        tokio::select! {
            biased;
            _ = self.shared.stop.cancelled() => Command::Stop,
            _ = self.shared.upgrade.notified() => Command::Upgrade,
        }
    }
}

/// Starts a thread that maps `SIGHUP` to an upgrade and, with
/// `handle_terminate`, `SIGTERM`/`SIGINT` to a stop. Without it those keep
/// their default disposition.
pub fn route(
    handle_terminate: bool,
    commands: CommandSender,
) -> io::Result<thread::JoinHandle<()>> {
    let mut wanted = vec![SIGHUP];
    if handle_terminate {
        wanted.extend([SIGTERM, SIGINT]);
    }
    let mut signals = Signals::new(&wanted)?;

    thread::Builder::new()
        .name("signal-router".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGHUP => {
                        info!("SIGHUP received, upgrading");
                        commands.upgrade();
                    }
                    SIGTERM | SIGINT => {
                        info!("signal {signal} received, stopping");
                        commands.stop();
                    }
                    other => debug!("ignoring signal {other}"),
                }
            }
        })
}
