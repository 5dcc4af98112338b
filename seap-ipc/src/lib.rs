// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SEAP: a bidirectional, message-oriented protocol layer carrying
//! S-expression payloads between a controller and its probe processes.
//!
//! Three packet kinds share one full-duplex byte transport: application
//! messages (MSG), remote command invocations (CMD) and protocol errors
//! (ERR). The [`SeapContext`] owns the descriptor table and the command
//! table, drives send and receive, dispatches CMD and ERR packets
//! internally, and hands MSG packets to the caller.
//!
//! ```no_run
//! use seap_ipc::SeapContext;
//! use seap_sexp::SExp;
//!
//! # fn main() -> seap_ipc::Result<()> {
//! let ctx = SeapContext::new();
//! let sd = ctx.connect("unix:///run/probe.sock", 0)?;
//! ctx.send_sexp(sd, SExp::list(vec![SExp::symbol("ping")]))?;
//! let pong = ctx.recv_sexp(sd)?;
//! ctx.close(sd)?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::sync::{Mutex, MutexGuard};

pub mod command;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod message;
pub mod packet;
pub mod scheme;
pub mod worker;

pub use command::{Handler, PendingReply};
pub use context::{SeapContext, SeapContextBuilder};
pub use descriptor::DescriptorId;
pub use error::{Error, Result};
pub use message::{Msg, MsgId, REPLY_ID_ATTR};
pub use packet::{
    CmdClass, CmdFlags, CmdPacket, CommandCode, DecodeError, ErrPacket, ErrType, Packet,
};

/// Extension trait acquiring a `Mutex` and panicking on poisoning, so the
/// many short critical sections in this crate don't each need an
/// `#[allow(clippy::unwrap_used)]`.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
