//! Listening sockets and the connections they produce.
//!
//! A [`Listener`] is either bound fresh or adopted from a descriptor handed
//! over by the previous generation. Either way it is registered with the
//! [`Upgrader`] so the next generation can inherit it in turn.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use clap::ValueEnum;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::upgrader::{HandoffGuard, Upgrader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Unix => f.write_str("unix"),
        }
    }
}

enum Socket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Socket {
    fn from_fd(network: Network, fd: OwnedFd) -> io::Result<Self> {
        match network {
            Network::Tcp => {
                let std = std::net::TcpListener::from(fd);
                std.set_nonblocking(true)?;
                Ok(Socket::Tcp(TcpListener::from_std(std)?))
            }
            Network::Unix => {
                let std = std::os::unix::net::UnixListener::from(fd);
                std.set_nonblocking(true)?;
                Ok(Socket::Unix(UnixListener::from_std(std)?))
            }
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Socket::Tcp(l) => l.as_fd(),
            Socket::Unix(l) => l.as_fd(),
        }
    }
}

pub struct Listener {
    socket: Socket,
    network: Network,
    address: String,
    // Keeps the descriptor offered to a successor for as long as we listen.
    _handoff: HandoffGuard,
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Connection> {
        match &self.socket {
            Socket::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Connection::Tcp(stream))
            }
            Socket::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Connection::Unix(stream))
            }
        }
    }

    /// The configured address, which is also the key used for handoff.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> String {
        match &self.socket {
            Socket::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| self.address.clone()),
            Socket::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| self.address.clone()),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("network", &self.network)
            .field("address", &self.address)
            .finish()
    }
}

/// Obtain the listener for `network`/`address`, preferring one inherited from
/// the previous generation over a fresh bind.
pub async fn acquire(
    upgrader: &dyn Upgrader,
    network: Network,
    address: &str,
) -> Result<Listener> {
    let listen_err = |source| Error::Listen {
        network,
        address: address.to_string(),
        source,
    };

    let socket = match upgrader.inherited_listener(network, address) {
        Some(fd) => {
            info!("inherited {network} listener for {address}");
            Socket::from_fd(network, fd).map_err(listen_err)?
        }
        None => bind(network, address).await.map_err(listen_err)?,
    };

    let handoff = upgrader
        .register_listener(network, address, socket.as_fd())
        .map_err(listen_err)?;

    Ok(Listener {
        socket,
        network,
        address: address.to_string(),
        _handoff: handoff,
    })
}

async fn bind(network: Network, address: &str) -> io::Result<Socket> {
    match network {
        Network::Tcp => Ok(Socket::Tcp(TcpListener::bind(address).await?)),
        Network::Unix => {
            let path = Path::new(address);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            remove_stale_socket(path)?;
            Ok(Socket::Unix(UnixListener::bind(path)?))
        }
    }
}

/// Removes a socket file left behind by a generation that died without
/// cleaning up. A socket somebody is still accepting on is left alone.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Ok(());
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by a live listener", path.display()),
        ));
    }
    debug!("removing stale socket {}", path.display());
    std::fs::remove_file(path)
}

/// An accepted stream, owned by exactly one handler.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    pub(crate) fn from_fd(network: Network, fd: OwnedFd) -> io::Result<Self> {
        match network {
            Network::Tcp => {
                let std = std::net::TcpStream::from(fd);
                std.set_nonblocking(true)?;
                Ok(Connection::Tcp(TcpStream::from_std(std)?))
            }
            Network::Unix => {
                let std = std::os::unix::net::UnixStream::from(fd);
                std.set_nonblocking(true)?;
                Ok(Connection::Unix(UnixStream::from_std(std)?))
            }
        }
    }

    pub fn peer_addr(&self) -> String {
        match self {
            Connection::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            Connection::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:unnamed".to_string()),
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Connection::Tcp(s) => s.as_fd(),
            Connection::Unix(s) => s.as_fd(),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrader::fds::FdRegistry;
    use crate::upgrader::LocalUpgrader;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn upgrader() -> LocalUpgrader {
        LocalUpgrader::new(Arc::new(|_child: LocalUpgrader| {}))
    }

    #[tokio::test]
    async fn test_fresh_tcp_bind() {
        let upg = upgrader();
        let listener = acquire(&upg, Network::Tcp, "127.0.0.1:0").await.unwrap();
        assert_eq!(listener.address(), "127.0.0.1:0");
        assert!(listener.local_addr().starts_with("127.0.0.1:"));
        assert_ne!(listener.local_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_unix_bind_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/server.sock");
        let upg = upgrader();
        let listener = acquire(&upg, Network::Unix, path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(listener.local_addr(), path.display().to_string());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        // Dropping a std listener leaves the file behind with nobody accepting.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let upg = upgrader();
        let listener = acquire(&upg, Network::Unix, path.to_str().unwrap())
            .await
            .unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        client.write_all(b"ping\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut conn).read_line(&mut line).await.unwrap();
        assert_eq!(line, "ping\n");
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        let _live = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let upg = upgrader();
        let err = acquire(&upg, Network::Unix, path.to_str().unwrap())
            .await
            .unwrap_err();
        match err {
            Error::Listen { source, .. } => assert_eq!(source.kind(), io::ErrorKind::AddrInUse),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_adopts_inherited_listener() {
        let original = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = original.local_addr().unwrap();

        let registry = FdRegistry::default();
        let _guard = registry
            .register_listener(Network::Tcp, "127.0.0.1:0", original.as_fd())
            .unwrap();
        let upg = LocalUpgrader::with_registry(
            FdRegistry::with_inherited(registry.export().unwrap()),
            Arc::new(|_child: LocalUpgrader| {}),
        );

        let listener = acquire(&upg, Network::Tcp, "127.0.0.1:0").await.unwrap();
        assert_eq!(listener.local_addr(), bound.to_string());

        let _client = TcpStream::connect(bound).await.unwrap();
        let conn = listener.accept().await.unwrap();
        assert!(conn.peer_addr().starts_with("127.0.0.1:"));
    }
}
