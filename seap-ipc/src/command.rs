// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command tables and reply correlation.
//!
//! Two things live here: the class-scoped handler tables (user and system
//! commands) and the outstanding-request map that pairs locally issued
//! CMDs with the waiters expecting their replies. Handler lookup and
//! request resolution are short critical sections; neither is ever held
//! across link I/O.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Condvar, Mutex};

use seap_sexp::SExp;
use zwohash::ZwoHasher;

use crate::context::SeapContext;
use crate::descriptor::DescriptorId;
use crate::error::{Error, Result};
use crate::packet::{CmdClass, CommandCode, ErrPacket};
use crate::MutexExt;

/// A command handler. It owns its argument S-exp and returns a freshly
/// owned result (the empty list when there is nothing to say). Handlers
/// run inline from the receive loop unless the context dispatches on
/// workers, so they must not block indefinitely.
pub type Handler = dyn Fn(&SeapContext, DescriptorId, SExp) -> Result<SExp> + Send + Sync;

type HandlerMap = HashMap<CommandCode, Arc<Handler>, BuildHasherDefault<ZwoHasher>>;

/// Class-scoped command handler tables. Registration is an idempotent
/// overwrite.
#[derive(Default)]
pub struct CommandTable {
    usr: Mutex<HandlerMap>,
    sys: Mutex<HandlerMap>,
}

impl CommandTable {
    pub fn new() -> CommandTable {
        CommandTable::default()
    }

    fn class(&self, class: CmdClass) -> &Mutex<HandlerMap> {
        match class {
            CmdClass::Usr => &self.usr,
            CmdClass::Sys => &self.sys,
        }
    }

    pub fn register(&self, class: CmdClass, code: CommandCode, handler: Arc<Handler>) {
        self.class(class).lock_or_panic().insert(code, handler);
    }

    pub fn unregister(&self, class: CmdClass, code: CommandCode) {
        self.class(class).lock_or_panic().remove(&code);
    }

    pub fn lookup(&self, class: CmdClass, code: CommandCode) -> Option<Arc<Handler>> {
        self.class(class).lock_or_panic().get(&code).cloned()
    }
}

enum SlotState {
    Waiting,
    Done(std::result::Result<SExp, Failure>),
    Taken,
}

enum Failure {
    Remote(ErrPacket),
    Cancelled,
}

/// The completion side of an outstanding request: a result slot plus a
/// condition variable for threads that wait instead of driving the
/// receive loop themselves.
struct ReplySlot {
    state: Mutex<SlotState>,
    done: Condvar,
}

impl ReplySlot {
    fn new() -> ReplySlot {
        ReplySlot {
            state: Mutex::new(SlotState::Waiting),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: std::result::Result<SExp, Failure>) {
        let mut state = self.state.lock_or_panic();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Done(outcome);
            self.done.notify_all();
        }
    }

    fn try_take(&self) -> Option<Result<SExp>> {
        let mut state = self.state.lock_or_panic();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Waiting => {
                *state = SlotState::Waiting;
                None
            }
            SlotState::Done(outcome) => Some(outcome.map_err(Failure::into_error)),
            SlotState::Taken => Some(Err(Error::Cancelled)),
        }
    }

    fn wait_take(&self) -> Result<SExp> {
        let mut state = self.state.lock_or_panic();
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Waiting => {
                    *state = SlotState::Waiting;
                    #[allow(clippy::unwrap_used)]
                    {
                        state = self.done.wait(state).unwrap();
                    }
                }
                SlotState::Done(outcome) => return outcome.map_err(Failure::into_error),
                SlotState::Taken => return Err(Error::Cancelled),
            }
        }
    }
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Failure::Remote(err) => Error::Remote(err),
            Failure::Cancelled => Error::Cancelled,
        }
    }
}

/// A locally issued CMD awaiting its reply. Returned by
/// [`SeapContext::submit`]; consume it with [`SeapContext::wait_reply`]
/// (drives the receive loop) or [`PendingReply::wait`] (blocks on the
/// completion signal while some other thread drives the loop).
///
/// [`SeapContext::submit`]: crate::SeapContext::submit
/// [`SeapContext::wait_reply`]: crate::SeapContext::wait_reply
pub struct PendingReply {
    id: u64,
    sd: DescriptorId,
    slot: Arc<ReplySlot>,
}

impl PendingReply {
    /// The request id the reply will carry as `reply_id`.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn sd(&self) -> DescriptorId {
        self.sd
    }

    /// The resolution, if one has arrived.
    pub fn try_take(&self) -> Option<Result<SExp>> {
        self.slot.try_take()
    }

    /// Blocks until the request resolves. Somebody else must be driving
    /// the descriptor's receive loop, or this waits for ever.
    pub fn wait(self) -> Result<SExp> {
        self.slot.wait_take()
    }
}

struct Waiter {
    sd: DescriptorId,
    slot: Arc<ReplySlot>,
}

type WaiterMap = HashMap<u64, Waiter, BuildHasherDefault<ZwoHasher>>;

/// Outstanding requests keyed by request id. Each request resolves at
/// most once: resolution removes the entry, so a duplicate or unsolicited
/// reply is a [`Error::NoMatch`].
#[derive(Default)]
pub struct RequestTable {
    outstanding: Mutex<WaiterMap>,
}

impl RequestTable {
    pub fn new() -> RequestTable {
        RequestTable::default()
    }

    pub(crate) fn enqueue(&self, sd: DescriptorId, id: u64) -> PendingReply {
        let slot = Arc::new(ReplySlot::new());
        self.outstanding.lock_or_panic().insert(
            id,
            Waiter {
                sd,
                slot: Arc::clone(&slot),
            },
        );
        PendingReply { id, sd, slot }
    }

    /// Delivers `value` to the waiter for `reply_id` on `sd`.
    pub(crate) fn resolve(&self, sd: DescriptorId, reply_id: u64, value: SExp) -> Result<()> {
        let waiter = self.remove_for(sd, reply_id)?;
        waiter.slot.complete(Ok(value));
        Ok(())
    }

    /// Fails the waiter for `reply_id` on `sd` with a wire error. Returns
    /// the error packet back when nothing matched, so the caller can park
    /// it in the descriptor's pending-error queue.
    pub(crate) fn fail(
        &self,
        sd: DescriptorId,
        reply_id: u64,
        err: ErrPacket,
    ) -> Option<ErrPacket> {
        match self.remove_for(sd, reply_id) {
            Ok(waiter) => {
                waiter.slot.complete(Err(Failure::Remote(err)));
                None
            }
            Err(_) => Some(err),
        }
    }

    fn remove_for(&self, sd: DescriptorId, reply_id: u64) -> Result<Waiter> {
        let mut outstanding = self.outstanding.lock_or_panic();
        match outstanding.get(&reply_id) {
            Some(waiter) if waiter.sd == sd => {
                #[allow(clippy::unwrap_used)]
                Ok(outstanding.remove(&reply_id).unwrap())
            }
            _ => Err(Error::NoMatch(reply_id)),
        }
    }

    /// Drops a request that never made it onto the wire.
    pub(crate) fn cancel(&self, id: u64) {
        if let Some(waiter) = self.outstanding.lock_or_panic().remove(&id) {
            waiter.slot.complete(Err(Failure::Cancelled));
        }
    }

    /// Cancels every outstanding request issued on `sd`; called by
    /// `close`. Returns how many waiters were woken.
    pub(crate) fn cancel_for(&self, sd: DescriptorId) -> usize {
        let cancelled: Vec<Waiter> = {
            let mut outstanding = self.outstanding.lock_or_panic();
            let ids: Vec<u64> = outstanding
                .iter()
                .filter(|(_, w)| w.sd == sd)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| outstanding.remove(&id))
                .collect()
        };
        let count = cancelled.len();
        for waiter in cancelled {
            waiter.slot.complete(Err(Failure::Cancelled));
        }
        count
    }
}

/// Execution modes of the command dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecMode {
    /// Look the code up and run the handler synchronously.
    Local,
    /// Treat the id as a reply id and wake the matching waiter.
    Wqueue,
}

/// The command dispatcher. `Local` consults the descriptor's own table
/// first, then the context-wide one.
pub(crate) fn exec(
    ctx: &SeapContext,
    sd: DescriptorId,
    mode: ExecMode,
    code_or_rid: u64,
    args: SExp,
    class: CmdClass,
) -> Result<SExp> {
    match mode {
        ExecMode::Local => {
            let code = CommandCode::try_from(code_or_rid).map_err(|_| Error::WireViolation)?;
            let handler = ctx
                .lookup_command(sd, class, code)
                .ok_or(Error::UnknownCommand(code))?;
            handler(ctx, sd, args)
        }
        ExecMode::Wqueue => {
            ctx.requests().resolve(sd, code_or_rid, args)?;
            Ok(SExp::empty())
        }
    }
}
