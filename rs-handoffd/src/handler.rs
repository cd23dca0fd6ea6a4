use std::io;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::listener::Connection;

/// Serves one connection until the peer is done, an I/O error occurs, or the
/// generation is cancelled.
///
/// Implementations own the connection; dropping it closes this generation's
/// copy of the socket.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn serve(&self, conn: Connection, cancel: CancellationToken) -> io::Result<()>;
}

/// Answers every line with `echo <line>\n`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn serve(&self, conn: Connection, cancel: CancellationToken) -> io::Result<()> {
        let peer = conn.peer_addr();
        let mut conn = BufReader::new(conn);
        let mut line = Vec::new();

        // Cancellation is only observed between lines: a reply that has
        // started is always written out in full.
        while !cancel.is_cancelled() {
            line.clear();
            let n = conn.read_until(b'\n', &mut line).await?;
            if n == 0 {
                debug!("{peer} closed the connection");
                return Ok(());
            }
            let Some(body) = line.strip_suffix(b"\n") else {
                debug!("{peer} closed the connection mid-line");
                return Ok(());
            };
            let body = body.strip_suffix(b"\r").unwrap_or(body);

            let mut reply = BytesMut::with_capacity(body.len() + 6);
            reply.put_slice(b"echo ");
            reply.put_slice(body);
            reply.put_u8(b'\n');
            conn.get_mut().write_all(&reply).await?;
        }
        debug!("stopped serving {peer}");
        Ok(())
    }
}
