use clap::{Parser, Subcommand};
use handoffd::pidfile;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Instant;
use std::{io, thread, time::Duration};

/// Asks a running handoffd to upgrade or stop, and waits for it to happen.
#[derive(Debug, Parser)]
#[command(name = "replacer", version)]
struct Args {
    /// Pid file written by the serving generation
    #[arg(long, value_name = "PATH", default_value = "main.pid")]
    pid_file: PathBuf,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Action {
    /// Start a new generation and wait until it is serving
    Upgrade,
    /// Stop gracefully and wait for the process to exit
    Stop,
}

const POLL: Duration = Duration::from_millis(100);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    let old = read_pid(&args.pid_file)?;
    match args.action {
        Action::Upgrade => {
            signal::kill(old, Signal::SIGHUP)?;
            println!("Sent SIGHUP to {old}");

            loop {
                // The pid file only changes once the successor is ready.
                if let Ok(new) = read_pid(&args.pid_file) {
                    if new != old && is_alive(new) {
                        println!("Upgraded: {old} -> {new}");
                        break;
                    }
                }
                if Instant::now() >= deadline {
                    return Err(format!("no new generation after {}s", args.timeout).into());
                }
                thread::sleep(POLL);
            }
        }
        Action::Stop => {
            signal::kill(old, Signal::SIGTERM)?;
            println!("Sent SIGTERM to {old}");

            while is_alive(old) {
                if Instant::now() >= deadline {
                    return Err(format!("{old} still running after {}s", args.timeout).into());
                }
                thread::sleep(POLL);
            }
            println!("Stopped {old}");
        }
    }

    Ok(())
}

fn read_pid(path: &Path) -> io::Result<Pid> {
    pidfile::read(path).map(|pid| Pid::from_raw(pid as i32))
}

fn is_alive(pid: Pid) -> bool {
    // EPERM still means the process exists.
    !matches!(signal::kill(pid, None), Err(Errno::ESRCH))
}
