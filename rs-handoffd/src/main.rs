use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use handoffd::upgrader::ProcessUpgrader;
use handoffd::{signals, Coordinator, EchoHandler, ServerConf};

// Started with HANDOFFD_PARENT_SOCK set, this process is the successor of a
// running generation and inherits its listener over that socket.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let conf = ServerConf::parse();
    init_logging();

    let upgrader = Arc::new(ProcessUpgrader::new(conf.upgrader_options()).await?);

    let (commands, receiver) = signals::channel();
    signals::route(conf.handle_terminate, commands)?;

    let coordinator = Coordinator::new(conf, upgrader, Arc::new(EchoHandler));
    let exit = coordinator.run(receiver).await.inspect_err(|e| error!("{e}"))?;
    info!("bye ({exit:?})");

    Ok(())
}

/// Every line carries the pid, since two generations share one log stream
/// during an upgrade.
fn init_logging() {
    let pid = std::process::id();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            writeln!(
                buf,
                "{pid} {} {} {}",
                buf.timestamp_millis(),
                record.level(),
                record.args()
            )
        })
        .init();
}
