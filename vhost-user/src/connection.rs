// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! UNIX domain socket listener and message-framed endpoint.

use std::fs::File;
use std::io::ErrorKind;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::slice;

use libc::{c_void, iovec};
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

use crate::message::*;
use crate::{Error, Result};

/// Listening socket a frontend connects to.
///
/// The socket path is unlinked before binding and again on drop, so a
/// stale socket from a previous run never blocks a new one.
pub struct Listener {
    fd: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let _ = std::fs::remove_file(&path);
        let fd = UnixListener::bind(&path).map_err(Error::SocketError)?;
        Ok(Listener {
            fd,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> Result<Endpoint> {
        loop {
            match self.fd.accept() {
                Ok((sock, _addr)) => return Ok(Endpoint::from_stream(sock)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::SocketError(e)),
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connected vhost-user socket.
pub struct Endpoint {
    sock: UnixStream,
}

impl Endpoint {
    pub fn from_stream(sock: UnixStream) -> Self {
        Endpoint { sock }
    }

    /// Close the file descriptors attached to a message we are discarding.
    pub fn close_rfds(rfds: Option<Vec<RawFd>>) {
        if let Some(fds) = rfds {
            for fd in fds {
                // Take ownership so the fd is closed.
                drop(unsafe { File::from_raw_fd(fd) });
            }
        }
    }

    fn send_iovec(&mut self, iovs: &[&[u8]], fds: Option<&[RawFd]>) -> Result<usize> {
        let rfds = fds.unwrap_or(&[]);
        self.sock.send_with_fds(iovs, rfds).map_err(Into::into)
    }

    /// Send a reply consisting of the header and a fixed-size body.
    pub fn send_message<T: Sized>(&mut self, hdr: &VhostUserMsgHeader, body: &T) -> Result<()> {
        // Safe because the structs are plain data and outlive the call.
        let iovs = unsafe {
            [
                slice::from_raw_parts(
                    hdr as *const VhostUserMsgHeader as *const u8,
                    mem::size_of::<VhostUserMsgHeader>(),
                ),
                slice::from_raw_parts(body as *const T as *const u8, mem::size_of::<T>()),
            ]
        };
        let bytes = self.send_iovec(&iovs[..], None)?;
        if bytes != mem::size_of::<VhostUserMsgHeader>() + mem::size_of::<T>() {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    /// Send a reply with a trailing variable-length payload, used for
    /// config-space reads.
    pub fn send_message_with_payload<T: Sized>(
        &mut self,
        hdr: &VhostUserMsgHeader,
        body: &T,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > max_payload_size() - mem::size_of::<T>() {
            return Err(Error::OversizedMsg);
        }
        // Safe because the structs are plain data and outlive the call.
        let iovs = unsafe {
            [
                slice::from_raw_parts(
                    hdr as *const VhostUserMsgHeader as *const u8,
                    mem::size_of::<VhostUserMsgHeader>(),
                ),
                slice::from_raw_parts(body as *const T as *const u8, mem::size_of::<T>()),
                payload,
            ]
        };
        let total = mem::size_of::<VhostUserMsgHeader>() + mem::size_of::<T>() + payload.len();
        if self.send_iovec(&iovs[..], None)? != total {
            return Err(Error::PartialMessage);
        }
        Ok(())
    }

    fn recv_into_iovec(&mut self, iovs: &mut [iovec]) -> Result<(usize, Option<Vec<RawFd>>)> {
        let mut fd_array = vec![0; MAX_ATTACHED_FD_ENTRIES];
        let (bytes, fds) = unsafe { self.sock.recv_with_fds(iovs, &mut fd_array) }?;
        let rfds = match fds {
            0 => None,
            n => Some(fd_array[..n].to_vec()),
        };
        Ok((bytes, rfds))
    }

    /// Receive a message header together with any attached descriptors.
    ///
    /// The message boundary must be respected here: descriptors are
    /// attached to the header read, and a partial read would lose them.
    /// Zero bytes means the peer closed the socket, which is the graceful
    /// shutdown signal for a device.
    pub fn recv_header(&mut self) -> Result<(VhostUserMsgHeader, Option<Vec<RawFd>>)> {
        let mut hdr = VhostUserMsgHeader::default();
        let mut iovs = [iovec {
            iov_base: (&mut hdr as *mut VhostUserMsgHeader) as *mut c_void,
            iov_len: mem::size_of::<VhostUserMsgHeader>(),
        }];
        let (bytes, rfds) = self.recv_into_iovec(&mut iovs[..])?;

        if bytes == 0 {
            Endpoint::close_rfds(rfds);
            return Err(Error::Disconnected);
        }
        if bytes != mem::size_of::<VhostUserMsgHeader>() {
            Endpoint::close_rfds(rfds);
            return Err(Error::PartialMessage);
        }
        if !hdr.is_valid() {
            Endpoint::close_rfds(rfds);
            return Err(Error::InvalidMessage);
        }

        Ok((hdr, rfds))
    }

    /// Receive exactly `len` payload bytes following a header.
    pub fn recv_data(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut rbuf = vec![0u8; len];
        let mut iovs = [iovec {
            iov_base: rbuf.as_mut_ptr() as *mut c_void,
            iov_len: len,
        }];
        let (bytes, rfds) = self.recv_into_iovec(&mut iovs)?;
        Endpoint::close_rfds(rfds);
        if bytes != len {
            return Err(Error::PartialMessage);
        }
        Ok(rbuf)
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
