// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection schemes.
//!
//! A scheme is a transport family named by a URI token. The registry is a
//! compile-time table; lookup is exact match and nothing mutates it at
//! runtime. Schemes hand out [`Link`]s — framed, full-duplex channels that
//! move one canonical S-expression per packet. The read and write halves
//! lock independently, so worker threads can push replies down a link
//! while the receive loop is blocked reading it.

use std::io;
use std::os::fd::OwnedFd;

use crate::error::{Error, Result};
use crate::MutexExt;

mod channel;
mod generic;
mod unix;

pub use channel::{FrameReader, FrameWriter};
pub use generic::GenericScheme;
pub use unix::UnixScheme;

use seap_sexp::SExp;
use std::sync::Mutex;

/// Name of the scheme adopting pre-opened fd pairs.
pub const GENERIC_SCHEME: &str = "generic";

/// A transport family. `connect` and `open_fd_pair` produce the
/// per-descriptor transport state; a scheme that does not implement a
/// capability reports `EOPNOTSUPP` through the default method.
pub trait TransportScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens a link from the URI remainder (everything after `://`).
    fn connect(&self, remainder: &str, flags: u32) -> Result<Link> {
        let _ = (remainder, flags);
        Err(Error::NotSupported)
    }

    /// Adopts an existing `(input, output)` fd pair as a link. Ownership
    /// of both fds transfers to the link.
    fn open_fd_pair(&self, input: OwnedFd, output: OwnedFd, flags: u32) -> Result<Link> {
        let _ = (input, output, flags);
        Err(Error::NotSupported)
    }
}

static REGISTRY: [&(dyn TransportScheme); 2] = [&GenericScheme, &UnixScheme];

/// Exact-match lookup against the compile-time scheme table.
pub fn find(name: &str) -> Option<&'static dyn TransportScheme> {
    REGISTRY.iter().copied().find(|s| s.name() == name)
}

/// Splits `scheme "://" remainder`; a URI without `://` is `EINVAL`.
pub fn split_uri(uri: &str) -> Result<(&str, &str)> {
    match uri.split_once("://") {
        Some((scheme, remainder)) if !scheme.is_empty() => Ok((scheme, remainder)),
        _ => Err(Error::InvalidUri),
    }
}

/// Best-effort teardown handle, callable without taking either I/O lock so
/// `close` can unblock an in-flight receive.
pub trait LinkControl: Send + Sync {
    fn shutdown(&self) -> io::Result<()>;
}

/// The per-descriptor transport state: a framed reader, a framed writer
/// and the teardown handle.
pub struct Link {
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
    ctl: Box<dyn LinkControl>,
}

impl Link {
    pub fn new(
        input: Box<dyn io::Read + Send>,
        output: Box<dyn io::Write + Send>,
        ctl: Box<dyn LinkControl>,
    ) -> Link {
        Link {
            reader: Mutex::new(FrameReader::new(input)),
            writer: Mutex::new(FrameWriter::new(output)),
            ctl,
        }
    }

    /// Sends one S-expression frame. Returns the frame length in bytes, or
    /// [`Error::InProgress`] when the transport accepted only part of it.
    pub fn send_sexp(&self, sexp: &SExp) -> Result<usize> {
        self.writer.lock_or_panic().send_sexp(sexp)
    }

    /// Receives the next S-expression frame, blocking as needed.
    pub fn recv_sexp(&self, eof_ok: bool) -> Result<SExp> {
        self.reader.lock_or_panic().recv_sexp(eof_ok)
    }

    /// The scheme's close capability.
    pub fn close(&self) -> Result<()> {
        self.ctl.shutdown().map_err(Error::from)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_is_exact_match() {
        assert!(find("generic").is_some());
        assert!(find("unix").is_some());
        assert!(find("generi").is_none());
        assert!(find("generics").is_none());
        assert!(find("").is_none());
    }

    #[test]
    fn uri_splitting() {
        assert_eq!(split_uri("unix:///tmp/s").unwrap(), ("unix", "/tmp/s"));
        assert!(matches!(split_uri("noscheme"), Err(Error::InvalidUri)));
        assert!(matches!(split_uri("unix:/tmp/s"), Err(Error::InvalidUri)));
        assert!(matches!(split_uri("://x"), Err(Error::InvalidUri)));
    }

    #[test]
    fn missing_capability_reports_not_supported() {
        assert!(matches!(
            GenericScheme.connect("whatever", 0),
            Err(Error::NotSupported)
        ));
    }
}
