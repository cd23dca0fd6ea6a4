use std::sync::Arc;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::drain::{DrainSet, DrainUnit};
use crate::handler::ConnectionHandler;
use crate::listener::{Connection, Listener, Network};
use crate::upgrader::{HandoffGuard, Upgrader};

/// Hands accepted connections to their own handler task under drain tracking.
#[derive(Clone)]
pub struct Dispatcher {
    pub handler: Arc<dyn ConnectionHandler>,
    pub upgrader: Arc<dyn Upgrader>,
    pub drain: DrainSet,
    pub cancel: CancellationToken,
    pub network: Network,
    pub address: String,
}

impl Dispatcher {
    pub fn dispatch(&self, conn: Connection) {
        // Registered before the task exists, released after the handler has
        // dropped the connection.
        let unit = self.drain.register();
        let peer = conn.peer_addr();
        debug!("serving {peer}");

        let handoff = self
            .upgrader
            .register_connection_for_handoff(self.network, &self.address, &conn)
            .unwrap_or_else(|e| {
                debug!("{peer} won't be handed over: {e}");
                HandoffGuard::noop()
            });

        let handler = Arc::clone(&self.handler);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _unit = unit;
            // Once the successor owns the connection, dropping the handler
            // closes only our copy of the socket.
            let served = tokio::select! {
                biased;
                _ = handoff.handed_over() => {
                    info!("connection {peer} handed over to successor");
                    Ok(())
                }
                res = handler.serve(conn, cancel) => res,
            };
            drop(handoff);
            if let Err(e) = served {
                info!("connection {peer} failed: {e}");
            }
        });
    }
}

/// Serves `inherited` (if the parent left us one), then accepts until the
/// listener breaks or the generation is cancelled.
///
/// The listener is closed when this returns, and `unit` is released after it.
pub async fn run(
    listener: Listener,
    inherited: Option<Connection>,
    dispatcher: Dispatcher,
    unit: DrainUnit,
) {
    let _unit = unit;

    if let Some(conn) = inherited {
        info!("continuing connection {} from parent", conn.peer_addr());
        dispatcher.dispatch(conn);
    }

    info!("listening on {}", listener.local_addr());
    loop {
        let accepted = tokio::select! {
            biased;
            _ = dispatcher.cancel.cancelled() => {
                debug!("accept loop cancelled");
                break;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(conn) => dispatcher.dispatch(conn),
            Err(e) => {
                info!("accept on {} failed, closing: {e}", listener.address());
                break;
            }
        }
    }
    drop(listener);
}
