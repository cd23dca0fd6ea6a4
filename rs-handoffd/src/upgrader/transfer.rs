//! Passing descriptors to the successor over a unix socket.
//!
//! A handoff is one frame: a big-endian `u32` length followed by the JSON
//! manifest (a list of [`FdKey`]). The descriptors ride along with the first
//! bytes of the frame as a single `SCM_RIGHTS` message, in manifest order.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::UnixStream;

use super::fds::FdKey;
use crate::error::UpgradeError;

pub const MAX_FDS: usize = 32;
const MAX_MANIFEST: usize = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

pub async fn send(stream: &UnixStream, fds: &[(FdKey, OwnedFd)]) -> Result<(), UpgradeError> {
    if fds.len() > MAX_FDS {
        return Err(UpgradeError::Transfer(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} descriptors exceed the limit of {MAX_FDS}", fds.len()),
        )));
    }
    let keys: Vec<&FdKey> = fds.iter().map(|(key, _)| key).collect();
    let manifest = serde_json::to_vec(&keys)?;

    let mut frame = Vec::with_capacity(4 + manifest.len());
    frame.extend_from_slice(&(manifest.len() as u32).to_be_bytes());
    frame.extend_from_slice(&manifest);

    let raw: Vec<RawFd> = fds.iter().map(|(_, fd)| fd.as_raw_fd()).collect();
    let mut sent = 0;
    while sent < frame.len() {
        stream.writable().await.map_err(UpgradeError::Transfer)?;
        let rights = [ControlMessage::ScmRights(&raw)];
        let cmsgs: &[ControlMessage] = if sent == 0 && !raw.is_empty() {
            &rights
        } else {
            &[]
        };
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&frame[sent..])];
            sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match result {
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(UpgradeError::Transfer(e)),
        }
    }
    Ok(())
}

pub async fn recv(stream: &mut UnixStream) -> Result<Vec<(FdKey, OwnedFd)>, UpgradeError> {
    let mut buf = vec![0u8; 4096];
    let (n, fds) = loop {
        stream.readable().await.map_err(UpgradeError::Transfer)?;
        let fd = stream.as_raw_fd();
        match stream.try_io(Interest::READABLE, || recv_with_fds(fd, &mut buf)) {
            Ok(received) => break received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(UpgradeError::Transfer(e)),
        }
    };

    let mut frame = buf[..n].to_vec();
    read_at_least(stream, &mut frame, 4).await?;
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if len > MAX_MANIFEST {
        return Err(UpgradeError::Transfer(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("manifest of {len} bytes is too large"),
        )));
    }
    read_at_least(stream, &mut frame, 4 + len).await?;

    let keys: Vec<FdKey> = serde_json::from_slice(&frame[4..4 + len])?;
    if keys.len() != fds.len() {
        return Err(UpgradeError::Transfer(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("manifest lists {} descriptors, got {}", keys.len(), fds.len()),
        )));
    }
    Ok(keys.into_iter().zip(fds).collect())
}

async fn read_at_least(
    stream: &mut UnixStream,
    frame: &mut Vec<u8>,
    want: usize,
) -> Result<(), UpgradeError> {
    while frame.len() < want {
        let n = stream
            .read_buf(frame)
            .await
            .map_err(UpgradeError::Transfer)?;
        if n == 0 {
            return Err(UpgradeError::Transfer(io::ErrorKind::UnexpectedEof.into()));
        }
    }
    Ok(())
}

fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), RECV_FLAGS)?;

    let mut fds = Vec::new();
    for c in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = c {
            // SAFETY: descriptors received through SCM_RIGHTS are new to this
            // process and owned by nobody else.
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    if msg.bytes == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok((msg.bytes, fds))
}
