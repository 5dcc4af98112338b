// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `unix` scheme: connects to a Unix stream socket. The URI remainder
//! is the socket path, e.g. `unix:///run/probe.sock`.

use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use super::{Link, LinkControl, TransportScheme};
use crate::error::{Error, Result};

pub struct UnixScheme;

struct StreamControl {
    stream: UnixStream,
}

impl LinkControl for StreamControl {
    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl TransportScheme for UnixScheme {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn connect(&self, remainder: &str, _flags: u32) -> Result<Link> {
        if remainder.is_empty() {
            return Err(Error::InvalidUri);
        }
        let stream = UnixStream::connect(remainder)?;
        let input = stream.try_clone()?;
        let output = stream.try_clone()?;
        Ok(Link::new(
            Box::new(input),
            Box::new(output),
            Box::new(StreamControl { stream }),
        ))
    }
}
