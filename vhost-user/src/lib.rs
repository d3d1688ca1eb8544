// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Backend side of the vhost-user protocol.
//!
//! The frontend (the guest's virtio transport) connects to a UNIX socket
//! we listen on and configures the device by sending framed messages:
//! feature negotiation, the guest memory table, vring addresses and the
//! kick/call eventfds. This crate owns the framing and dispatch; the
//! device state machine lives with the caller, behind the
//! [`VhostUserDeviceReqHandler`] trait.

mod connection;
mod handler;
pub mod message;

use std::io;

use thiserror::Error as ThisError;

pub use connection::{Endpoint, Listener};
pub use handler::{DeviceReqHandler, VhostUserDeviceReqHandler};

/// Errors for vhost-user operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid parameters.
    #[error("invalid parameters")]
    InvalidParam,
    /// Operation requires a protocol feature that was not negotiated.
    #[error("invalid operation")]
    InvalidOperation,
    /// Invalid message format, flag or content.
    #[error("invalid message")]
    InvalidMessage,
    /// Only part of a message could be sent or received.
    #[error("partial message")]
    PartialMessage,
    /// Message is too large.
    #[error("oversized message")]
    OversizedMsg,
    /// Wrong number of attached file descriptors.
    #[error("wrong number of attached fds")]
    IncorrectFds,
    /// The peer closed the socket. This is the graceful shutdown signal.
    #[error("peer disconnected")]
    Disconnected,
    /// Generic socket errors.
    #[error("socket error: {0}")]
    SocketError(io::Error),
    /// The socket is broken or has been closed.
    #[error("socket is broken: {0}")]
    SocketBroken(io::Error),
    /// The socket operation needs to be retried.
    #[error("temporary socket error: {0}")]
    SocketRetry(io::Error),
    /// Error reported by the device object.
    #[error("request handler error: {0}")]
    ReqHandlerError(io::Error),
}

impl From<vmm_sys_util::errno::Error> for Error {
    /// Fold raw socket errnos into the buckets the connection logic cares
    /// about: retry, broken peer, or plain failure.
    fn from(err: vmm_sys_util::errno::Error) -> Self {
        match err.errno() {
            libc::EAGAIN | libc::EINTR | libc::ENOBUFS | libc::ENOMEM => {
                Error::SocketRetry(io::Error::from_raw_os_error(err.errno()))
            }
            libc::ECONNRESET | libc::EPIPE => {
                Error::SocketBroken(io::Error::from_raw_os_error(err.errno()))
            }
            e => Error::SocketError(io::Error::from_raw_os_error(e)),
        }
    }
}

/// Result of vhost-user operations.
pub type Result<T> = std::result::Result<T, Error>;
