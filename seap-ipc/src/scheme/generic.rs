// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `generic` scheme: adopts a pre-opened `(input, output)` fd pair —
//! a socketpair, a pipe pair, or inherited stdio — as a SEAP link.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::{Link, LinkControl, TransportScheme};
use crate::error::Result;

pub struct GenericScheme;

// Holds raw copies of the adopted fds; the owning `File`s live in the same
// `Link`, so the fds stay valid for as long as this control handle does.
struct FdPairControl {
    input: RawFd,
    output: RawFd,
}

impl LinkControl for FdPairControl {
    fn shutdown(&self) -> io::Result<()> {
        // Unblocks a reader when the fds are sockets. Pipes have no
        // shutdown; ENOTSOCK is expected there and the close that follows
        // tears the link down anyway.
        // SAFETY: both fds are open for the lifetime of self (see above).
        unsafe {
            libc::shutdown(self.input, libc::SHUT_RDWR);
            libc::shutdown(self.output, libc::SHUT_RDWR);
        }
        Ok(())
    }
}

impl TransportScheme for GenericScheme {
    fn name(&self) -> &'static str {
        super::GENERIC_SCHEME
    }

    fn open_fd_pair(&self, input: OwnedFd, output: OwnedFd, _flags: u32) -> Result<Link> {
        let ctl = FdPairControl {
            input: input.as_raw_fd(),
            output: output.as_raw_fd(),
        };
        Ok(Link::new(
            Box::new(File::from(input)),
            Box::new(File::from(output)),
            Box::new(ctl),
        ))
    }
}
