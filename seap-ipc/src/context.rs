// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The SEAP context: descriptor ownership, the send paths, and the
//! receive loop that multiplexes MSG, CMD and ERR packets.
//!
//! A context is cheap to clone; clones share the descriptor table, the
//! command tables and the worker set. The receive loop runs on the
//! caller's thread — the only optional parallelism is threaded command
//! dispatch, in which inbound CMDs run on workers while the loop keeps
//! reading.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use seap_sexp::SExp;
use tracing::{debug, warn};

use crate::command::{self, CommandTable, ExecMode, Handler, PendingReply, RequestTable};
use crate::descriptor::{
    Descriptor, DescriptorId, DescriptorTable, DEFAULT_MAX_DESCRIPTORS,
};
use crate::error::{Error, Result};
use crate::message::{Msg, MsgId, REPLY_ID_ATTR};
use crate::packet::{CmdClass, CmdPacket, CommandCode, ErrPacket, ErrType, Packet};
use crate::scheme;
use crate::worker::WorkerSet;

/// Configuration for a [`SeapContext`].
#[derive(Debug, Clone)]
pub struct SeapContextBuilder {
    eof_ok: bool,
    thread_dispatch: bool,
    max_descriptors: usize,
}

impl Default for SeapContextBuilder {
    fn default() -> SeapContextBuilder {
        SeapContextBuilder {
            eof_ok: true,
            thread_dispatch: false,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
        }
    }
}

impl SeapContextBuilder {
    pub fn new() -> SeapContextBuilder {
        SeapContextBuilder::default()
    }

    /// Whether a peer closing the link at a frame boundary is an orderly
    /// [`Error::Closed`] rather than a transport error. On by default.
    pub fn eof_ok(mut self, eof_ok: bool) -> SeapContextBuilder {
        self.eof_ok = eof_ok;
        self
    }

    /// Dispatch inbound commands on worker threads instead of inline.
    /// Reply ordering across commands is not preserved in this mode.
    pub fn thread_dispatch(mut self, thread_dispatch: bool) -> SeapContextBuilder {
        self.thread_dispatch = thread_dispatch;
        self
    }

    /// Capacity of the descriptor table.
    pub fn max_descriptors(mut self, max_descriptors: usize) -> SeapContextBuilder {
        self.max_descriptors = max_descriptors;
        self
    }

    pub fn build(self) -> SeapContext {
        SeapContext {
            inner: Arc::new(ContextInner {
                eof_ok: self.eof_ok,
                thread_dispatch: self.thread_dispatch,
                descriptors: DescriptorTable::new(self.max_descriptors),
                commands: CommandTable::new(),
                requests: RequestTable::new(),
                workers: WorkerSet::new(),
            }),
        }
    }
}

struct ContextInner {
    eof_ok: bool,
    thread_dispatch: bool,
    descriptors: DescriptorTable,
    commands: CommandTable,
    requests: RequestTable,
    workers: WorkerSet,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Close whatever is still open; waiters were either resolved or
        // belong to callers that are gone along with their clones.
        for desc in self.descriptors.drain() {
            let _ = desc.link().close();
        }
    }
}

/// The SEAP protocol context.
#[derive(Clone)]
pub struct SeapContext {
    inner: Arc<ContextInner>,
}

impl Default for SeapContext {
    fn default() -> SeapContext {
        SeapContext::new()
    }
}

impl SeapContext {
    /// A context with default configuration.
    pub fn new() -> SeapContext {
        SeapContextBuilder::default().build()
    }

    pub fn builder() -> SeapContextBuilder {
        SeapContextBuilder::default()
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.inner.descriptors
    }

    pub(crate) fn requests(&self) -> &RequestTable {
        &self.inner.requests
    }

    // ---- connection open / close -------------------------------------

    /// Opens a descriptor against `scheme "://" remainder`.
    pub fn connect(&self, uri: &str, flags: u32) -> Result<DescriptorId> {
        let (name, remainder) = scheme::split_uri(uri)?;
        let sch = scheme::find(name).ok_or(Error::SchemeNotSupported)?;

        let sd = self.inner.descriptors.reserve()?;
        match sch.connect(remainder, flags) {
            Ok(link) => {
                self.inner.descriptors.install(sd, Descriptor::new(sch, link));
                Ok(sd)
            }
            Err(e) => {
                debug!(uri, error = %e, "connect failed");
                self.inner.descriptors.release(sd);
                Err(e)
            }
        }
    }

    /// Adopts an existing `(input, output)` fd pair via the `generic`
    /// scheme.
    pub fn open_fd_pair(&self, input: OwnedFd, output: OwnedFd, flags: u32) -> Result<DescriptorId> {
        let sch = scheme::find(scheme::GENERIC_SCHEME).ok_or(Error::SchemeNotSupported)?;

        let sd = self.inner.descriptors.reserve()?;
        match sch.open_fd_pair(input, output, flags) {
            Ok(link) => {
                self.inner.descriptors.install(sd, Descriptor::new(sch, link));
                Ok(sd)
            }
            Err(e) => {
                debug!(error = %e, "fd pair adoption failed");
                self.inner.descriptors.release(sd);
                Err(e)
            }
        }
    }

    /// Closes a descriptor: scheme close first, then handle removal. An
    /// in-flight receive on the descriptor returns a transport error.
    pub fn close(&self, sd: DescriptorId) -> Result<()> {
        let desc = self.inner.descriptors.get(sd)?;
        let close_res = desc.link().close();

        let cancelled = self.inner.requests.cancel_for(sd);
        if cancelled > 0 {
            debug!(%sd, cancelled, "cancelled outstanding requests on close");
        }

        self.inner.descriptors.del(sd)?;
        close_res.map(|_| ())
    }

    // ---- send paths ---------------------------------------------------

    /// Stamps the message with a fresh id and sends it. Returns the id so
    /// the caller can correlate a future reply.
    pub fn send_msg(&self, sd: DescriptorId, msg: Msg) -> Result<MsgId> {
        let desc = self.inner.descriptors.get(sd)?;
        let mut msg = msg;
        msg.id = desc.gen_msg_id();
        let id = msg.id;
        self.send_packet(&desc, Packet::Msg(msg))?;
        Ok(id)
    }

    /// Wraps a bare payload in a message and sends it.
    pub fn send_sexp(&self, sd: DescriptorId, sexp: SExp) -> Result<MsgId> {
        self.send_msg(sd, Msg::new(sexp))
    }

    /// Sends `rep` as the reply to `req` by setting the reserved
    /// `reply-id` attribute.
    pub fn reply(&self, sd: DescriptorId, mut rep: Msg, req: &Msg) -> Result<MsgId> {
        rep.set_attr(REPLY_ID_ATTR, SExp::uint(req.id()));
        self.send_msg(sd, rep)
    }

    /// Sends a USER error referencing `orig_id`.
    pub fn send_err(
        &self,
        sd: DescriptorId,
        code: u32,
        orig_id: MsgId,
        data: Option<SExp>,
    ) -> Result<()> {
        self.send_err_packet(
            sd,
            ErrPacket {
                etype: ErrType::User,
                code,
                orig_id,
                data,
            },
        )
    }

    /// Sends a USER error answering `req`.
    pub fn reply_err(&self, sd: DescriptorId, req: &Msg, code: u32) -> Result<()> {
        self.send_err(sd, code, req.id(), None)
    }

    fn send_err_packet(&self, sd: DescriptorId, err: ErrPacket) -> Result<()> {
        let desc = self.inner.descriptors.get(sd)?;
        self.send_packet(&desc, Packet::Err(err))
    }

    fn send_packet(&self, desc: &Descriptor, packet: Packet) -> Result<()> {
        let sexp = packet.pack();
        match desc.link().send_sexp(&sexp) {
            Ok(_) => {
                desc.set_output_in_progress(false);
                Ok(())
            }
            Err(Error::InProgress) => {
                desc.set_output_in_progress(true);
                Err(Error::InProgress)
            }
            Err(e) => Err(e),
        }
    }

    // ---- receive loop -------------------------------------------------

    /// Blocks until the next MSG arrives on `sd`. CMD and ERR packets
    /// received meanwhile are dispatched internally and never surface
    /// here.
    pub fn recv_msg(&self, sd: DescriptorId) -> Result<Msg> {
        let desc = self.inner.descriptors.get(sd)?;
        if let Some(msg) = desc.pop_pending_msg() {
            return Ok(msg);
        }

        loop {
            match self.recv_packet(&desc)? {
                Packet::Msg(msg) => return Ok(msg),
                Packet::Cmd(cmd) => self.dispatch_cmd(sd, cmd)?,
                Packet::Err(err) => self.dispatch_err(sd, &desc, err),
            }
        }
    }

    /// Blocks until the next MSG arrives and extracts its payload.
    pub fn recv_sexp(&self, sd: DescriptorId) -> Result<SExp> {
        self.recv_msg(sd).map(Msg::into_payload)
    }

    /// Drains the oldest pending error on `sd`.
    pub fn recv_err(&self, sd: DescriptorId) -> Result<ErrPacket> {
        let desc = self.inner.descriptors.get(sd)?;
        desc.pop_pending_err(None).ok_or(Error::NoError)
    }

    /// Drains the oldest pending error referencing `id`.
    pub fn recv_err_by_id(&self, sd: DescriptorId, id: MsgId) -> Result<ErrPacket> {
        let desc = self.inner.descriptors.get(sd)?;
        desc.pop_pending_err(Some(id)).ok_or(Error::NoError)
    }

    fn recv_packet(&self, desc: &Descriptor) -> Result<Packet> {
        let sexp = desc.link().recv_sexp(self.inner.eof_ok)?;
        Packet::unpack(sexp).map_err(|e| {
            debug!(error = %e, "dropping connection on malformed packet");
            Error::Decode(e)
        })
    }

    fn dispatch_cmd(&self, sd: DescriptorId, cmd: CmdPacket) -> Result<()> {
        if cmd.is_reply() {
            // The decoder guarantees a reply id on REPLY packets.
            debug_assert!(cmd.reply_id().is_some());
            let rid = cmd.reply_id().ok_or(Error::WireViolation)?;
            let class = cmd.class();
            // A stray reply is dropped, not surfaced: the receive loop
            // recovers locally and keeps reading.
            if let Err(e) = command::exec(self, sd, ExecMode::Wqueue, rid, cmd.into_args(), class)
            {
                debug!(%sd, rid, error = %e, "dropping unmatched command reply");
            }
            Ok(())
        } else if self.inner.thread_dispatch {
            let ctx = self.clone();
            self.inner.workers.spawn(move || {
                if let Err(e) = ctx.exec_and_reply(sd, cmd) {
                    warn!(%sd, error = %e, "threaded command dispatch failed");
                }
            })
        } else {
            self.exec_and_reply(sd, cmd)
        }
    }

    // Runs the LOCAL handler and sends the reply CMD on the same
    // descriptor. Handler failure turns into an INT error packet for the
    // peer; only send failures propagate.
    fn exec_and_reply(&self, sd: DescriptorId, cmd: CmdPacket) -> Result<()> {
        let mut cmd = cmd;
        let args = cmd.take_args();
        let result = command::exec(
            self,
            sd,
            ExecMode::Local,
            u64::from(cmd.code()),
            args,
            cmd.class(),
        );

        let desc = self.inner.descriptors.get(sd)?;
        match result {
            Ok(res) => {
                let reply = CmdPacket::reply_to(&cmd, desc.gen_cmd_id(), res);
                self.send_packet(&desc, Packet::Cmd(reply))
            }
            Err(e) => {
                debug!(%sd, code = cmd.code(), error = %e, "command handler failed");
                let err = ErrPacket {
                    etype: ErrType::Int,
                    code: e.raw_os_error() as u32,
                    orig_id: cmd.id(),
                    data: None,
                };
                self.send_packet(&desc, Packet::Err(err))
            }
        }
    }

    fn dispatch_err(&self, sd: DescriptorId, desc: &Descriptor, err: ErrPacket) {
        if let Some(err) = self.inner.requests.fail(sd, err.orig_id, err) {
            desc.push_pending_err(err);
        }
    }

    // ---- remote commands ----------------------------------------------

    /// Sends a user-class CMD and returns a handle to its eventual reply.
    pub fn submit(&self, sd: DescriptorId, code: CommandCode, args: SExp) -> Result<PendingReply> {
        let desc = self.inner.descriptors.get(sd)?;
        let id = desc.gen_cmd_id();
        let pending = self.inner.requests.enqueue(sd, id);

        let cmd = CmdPacket::request(id, CmdClass::Usr, code, args);
        if let Err(e) = self.send_packet(&desc, Packet::Cmd(cmd)) {
            // Also covers a partial send: the request counts as unsent for
            // correlation, and a reply to it would be unsolicited.
            self.inner.requests.cancel(id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Drives the descriptor's packet loop until `pending` resolves.
    /// MSGs that arrive meanwhile are queued for the next [`recv_msg`]
    /// in arrival order.
    ///
    /// [`recv_msg`]: SeapContext::recv_msg
    pub fn wait_reply(&self, pending: PendingReply) -> Result<SExp> {
        let sd = pending.sd();
        let desc = self.inner.descriptors.get(sd)?;

        loop {
            if let Some(outcome) = pending.try_take() {
                return outcome;
            }
            match self.recv_packet(&desc)? {
                Packet::Msg(msg) => desc.push_pending_msg(msg),
                Packet::Cmd(cmd) => self.dispatch_cmd(sd, cmd)?,
                Packet::Err(err) => self.dispatch_err(sd, &desc, err),
            }
        }
    }

    /// Remote command invocation: send, then drive the loop until the
    /// reply arrives.
    pub fn call(&self, sd: DescriptorId, code: CommandCode, args: SExp) -> Result<SExp> {
        let pending = self.submit(sd, code, args)?;
        self.wait_reply(pending)
    }

    // ---- command registration -----------------------------------------

    /// Installs a context-wide command handler (idempotent overwrite).
    pub fn register_command(&self, class: CmdClass, code: CommandCode, handler: Arc<Handler>) {
        self.inner.commands.register(class, code, handler);
    }

    pub fn unregister_command(&self, class: CmdClass, code: CommandCode) {
        self.inner.commands.unregister(class, code);
    }

    /// Installs a handler served on one descriptor only. Link-scoped
    /// handlers shadow context-wide ones.
    pub fn register_link_command(
        &self,
        sd: DescriptorId,
        class: CmdClass,
        code: CommandCode,
        handler: Arc<Handler>,
    ) -> Result<()> {
        let desc = self.inner.descriptors.get(sd)?;
        desc.commands().register(class, code, handler);
        Ok(())
    }

    pub(crate) fn lookup_command(
        &self,
        sd: DescriptorId,
        class: CmdClass,
        code: CommandCode,
    ) -> Option<Arc<Handler>> {
        let link_handler = self
            .inner
            .descriptors
            .get(sd)
            .ok()
            .and_then(|desc| desc.commands().lookup(class, code));
        link_handler.or_else(|| self.inner.commands.lookup(class, code))
    }

    // ---- workers ------------------------------------------------------

    /// Blocks until every dispatched command worker has terminated.
    pub fn join_workers(&self) {
        self.inner.workers.join_all();
    }

    /// Number of command workers still running.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_uri_is_einval() {
        let ctx = SeapContext::new();
        let err = ctx.connect("noscheme", 0).unwrap_err();
        assert_eq!(err.raw_os_error(), libc::EINVAL);
    }

    #[test]
    fn unknown_scheme_is_eprotonosupport() {
        let ctx = SeapContext::new();
        let err = ctx.connect("zzz://x", 0).unwrap_err();
        assert_eq!(err.raw_os_error(), libc::EPROTONOSUPPORT);
    }

    #[test]
    fn failed_connect_releases_the_descriptor() {
        let ctx = SeapContext::builder().max_descriptors(1).build();
        // The generic scheme has no connect capability.
        assert!(matches!(
            ctx.connect("generic://x", 0),
            Err(Error::NotSupported)
        ));
        // The slot is free again.
        assert!(matches!(
            ctx.connect("generic://x", 0),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn operations_on_unknown_descriptors_are_ebadf() {
        let ctx = SeapContext::new();
        let sd = DescriptorId::from_index(3);

        assert_eq!(ctx.recv_msg(sd).unwrap_err().raw_os_error(), libc::EBADF);
        assert_eq!(
            ctx.send_sexp(sd, SExp::empty()).unwrap_err().raw_os_error(),
            libc::EBADF
        );
        assert_eq!(ctx.close(sd).unwrap_err().raw_os_error(), libc::EBADF);
        assert_eq!(ctx.recv_err(sd).unwrap_err().raw_os_error(), libc::EBADF);
    }
}
