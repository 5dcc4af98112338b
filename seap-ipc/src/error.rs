// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The protocol layer's error taxonomy.
//!
//! Transport errors keep the transport's numeric code; everything the
//! original C surface reported through `errno` maps back to the same
//! constant via [`Error::raw_os_error`].

use std::io;

use crate::packet::{DecodeError, ErrPacket};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed; the numeric code is the transport's own.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent bytes that do not decode into a packet.
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    /// The descriptor handle is not open.
    #[error("bad descriptor")]
    BadDescriptor,

    /// The descriptor table is at capacity.
    #[error("descriptor table full")]
    TableFull,

    /// The URI names a scheme the registry does not know.
    #[error("connection scheme not supported")]
    SchemeNotSupported,

    /// The URI does not match `scheme "://" remainder`.
    #[error("malformed connection URI")]
    InvalidUri,

    /// The scheme does not implement the requested capability.
    #[error("operation not supported by scheme")]
    NotSupported,

    /// A previous frame was only partially written; retry the send on the
    /// same descriptor to flush it.
    #[error("output in progress on this descriptor")]
    InProgress,

    /// The pending-error queue has nothing (matching) to drain.
    #[error("no pending error")]
    NoError,

    /// No handler is registered for the command code.
    #[error("unknown command code {0:#x}")]
    UnknownCommand(u32),

    /// A reply arrived whose id matches no outstanding request, or the
    /// request was already resolved.
    #[error("no outstanding request for reply id {0}")]
    NoMatch(u64),

    /// The peer answered a command with an ERR packet.
    #[error("peer reported error {code} for request {orig_id}", code = .0.code, orig_id = .0.orig_id)]
    Remote(ErrPacket),

    /// The request's waiter was cancelled by `close`.
    #[error("request cancelled by close")]
    Cancelled,

    /// A worker thread could not be spawned for command dispatch.
    #[error("worker spawn failed: {0}")]
    WorkerSpawn(io::Error),

    /// The peer violated the wire protocol in a way that has no recovery.
    #[error("wire protocol violation")]
    WireViolation,

    /// The peer closed the link at a frame boundary.
    #[error("link closed by peer")]
    Closed,
}

impl Error {
    /// The `errno`-style numeric code for this error, preserving the
    /// transport's code verbatim where one exists.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Error::Transport(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Decode(_) | Error::InvalidUri => libc::EINVAL,
            Error::BadDescriptor => libc::EBADF,
            Error::TableFull => libc::EMFILE,
            Error::SchemeNotSupported => libc::EPROTONOSUPPORT,
            Error::NotSupported => libc::EOPNOTSUPP,
            Error::InProgress => libc::EINPROGRESS,
            Error::NoError | Error::NoMatch(_) => libc::ENOENT,
            Error::UnknownCommand(_) => libc::EOPNOTSUPP,
            Error::Remote(_) => libc::EPROTO,
            Error::Cancelled => libc::ECANCELED,
            Error::WorkerSpawn(e) => e.raw_os_error().unwrap_or(libc::EAGAIN),
            Error::WireViolation => libc::EPROTO,
            Error::Closed => libc::ECONNRESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_the_c_surface() {
        assert_eq!(Error::BadDescriptor.raw_os_error(), libc::EBADF);
        assert_eq!(Error::TableFull.raw_os_error(), libc::EMFILE);
        assert_eq!(Error::InvalidUri.raw_os_error(), libc::EINVAL);
        assert_eq!(
            Error::SchemeNotSupported.raw_os_error(),
            libc::EPROTONOSUPPORT
        );
        assert_eq!(Error::InProgress.raw_os_error(), libc::EINPROGRESS);
        assert_eq!(Error::NoError.raw_os_error(), libc::ENOENT);
    }

    #[test]
    fn transport_code_is_preserved() {
        let e = Error::Transport(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(e.raw_os_error(), libc::ECONNREFUSED);
    }
}
