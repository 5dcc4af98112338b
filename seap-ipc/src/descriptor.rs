// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The descriptor table: small reusable integer handles mapping to
//! per-link transport state.
//!
//! Allocation picks the lowest free slot out of a bitmap with a configured
//! capacity; a full bitmap is `EMFILE`. Message and command ids are
//! per-descriptor atomic counters, so concurrent senders on one link still
//! get strictly increasing, unique ids.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::command::CommandTable;
use crate::error::{Error, Result};
use crate::message::Msg;
use crate::packet::ErrPacket;
use crate::scheme::{Link, TransportScheme};
use crate::MutexExt;

/// Default capacity of a context's descriptor table.
pub const DEFAULT_MAX_DESCRIPTORS: usize = 1024;

/// A SEAP descriptor handle. Plain data; stale handles fail with `EBADF`
/// when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(u32);

impl DescriptorId {
    pub(crate) fn from_index(index: u32) -> DescriptorId {
        DescriptorId(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sd:{}", self.0)
    }
}

/// Per-link state: the transport link, the id counters, the output
/// marker, the link's own command table, and the queues the receive loop
/// parks packets in.
pub struct Descriptor {
    scheme: &'static dyn TransportScheme,
    link: Link,
    next_msg_id: AtomicU64,
    next_cmd_id: AtomicU64,
    output_in_progress: AtomicBool,
    commands: CommandTable,
    pending_errs: Mutex<VecDeque<ErrPacket>>,
    pending_msgs: Mutex<VecDeque<Msg>>,
}

impl Descriptor {
    pub(crate) fn new(scheme: &'static dyn TransportScheme, link: Link) -> Descriptor {
        Descriptor {
            scheme,
            link,
            next_msg_id: AtomicU64::new(1),
            next_cmd_id: AtomicU64::new(1),
            output_in_progress: AtomicBool::new(false),
            commands: CommandTable::new(),
            pending_errs: Mutex::new(VecDeque::new()),
            pending_msgs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn scheme_name(&self) -> &'static str {
        self.scheme.name()
    }

    pub(crate) fn link(&self) -> &Link {
        &self.link
    }

    /// Issues the next message id. Wraps at 2^64; ids within a
    /// descriptor's lifetime are strictly increasing and unique.
    pub fn gen_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Issues the next command id.
    pub fn gen_cmd_id(&self) -> u64 {
        self.next_cmd_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the last send left a partially written frame behind.
    pub fn output_in_progress(&self) -> bool {
        self.output_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_output_in_progress(&self, value: bool) {
        self.output_in_progress.store(value, Ordering::Release);
    }

    /// Server-side commands installed on this link only.
    pub(crate) fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub(crate) fn push_pending_msg(&self, msg: Msg) {
        self.pending_msgs.lock_or_panic().push_back(msg);
    }

    pub(crate) fn pop_pending_msg(&self) -> Option<Msg> {
        self.pending_msgs.lock_or_panic().pop_front()
    }

    pub(crate) fn push_pending_err(&self, err: ErrPacket) {
        self.pending_errs.lock_or_panic().push_back(err);
    }

    /// Pops the oldest pending error, or the oldest one matching `id`.
    pub(crate) fn pop_pending_err(&self, id: Option<u64>) -> Option<ErrPacket> {
        let mut errs = self.pending_errs.lock_or_panic();
        match id {
            None => errs.pop_front(),
            Some(id) => {
                let at = errs.iter().position(|e| e.orig_id == id)?;
                errs.remove(at)
            }
        }
    }
}

struct Bitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl Bitmap {
    fn new(capacity: usize) -> Bitmap {
        Bitmap {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    // Lowest clear bit, or None when the map is at capacity.
    fn allocate(&mut self) -> Option<usize> {
        for (wi, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = wi * 64 + bit;
            if index >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            return Some(index);
        }
        None
    }

    fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1 << (index % 64));
        }
    }
}

struct TableInner {
    slots: Vec<Option<Arc<Descriptor>>>,
    bitmap: Bitmap,
}

/// The dense handle-to-descriptor mapping owned by a context.
pub struct DescriptorTable {
    inner: Mutex<TableInner>,
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> DescriptorTable {
        DescriptorTable {
            inner: Mutex::new(TableInner {
                slots: Vec::new(),
                bitmap: Bitmap::new(capacity),
            }),
        }
    }

    /// Claims the lowest free handle without installing a descriptor yet,
    /// so a failing `connect` can release it again.
    pub(crate) fn reserve(&self) -> Result<DescriptorId> {
        let mut inner = self.inner.lock_or_panic();
        let index = inner.bitmap.allocate().ok_or(Error::TableFull)?;
        if inner.slots.len() <= index {
            inner.slots.resize_with(index + 1, || None);
        }
        Ok(DescriptorId(index as u32))
    }

    pub(crate) fn install(&self, sd: DescriptorId, descriptor: Descriptor) -> Arc<Descriptor> {
        let descriptor = Arc::new(descriptor);
        let mut inner = self.inner.lock_or_panic();
        inner.slots[sd.index()] = Some(Arc::clone(&descriptor));
        descriptor
    }

    pub(crate) fn release(&self, sd: DescriptorId) {
        let mut inner = self.inner.lock_or_panic();
        inner.slots[sd.index()] = None;
        inner.bitmap.clear(sd.index());
    }

    /// Convenience for the common reserve-then-install sequence.
    pub(crate) fn add(
        &self,
        scheme: &'static dyn TransportScheme,
        link: Link,
    ) -> Result<DescriptorId> {
        let sd = self.reserve()?;
        self.install(sd, Descriptor::new(scheme, link));
        Ok(sd)
    }

    pub fn get(&self, sd: DescriptorId) -> Result<Arc<Descriptor>> {
        self.inner
            .lock_or_panic()
            .slots
            .get(sd.index())
            .and_then(Option::clone)
            .ok_or(Error::BadDescriptor)
    }

    /// Removes the handle, returning the descriptor so `close` can finish
    /// tearing the link down.
    pub fn del(&self, sd: DescriptorId) -> Result<Arc<Descriptor>> {
        let mut inner = self.inner.lock_or_panic();
        let slot = inner
            .slots
            .get_mut(sd.index())
            .and_then(Option::take)
            .ok_or(Error::BadDescriptor)?;
        inner.bitmap.clear(sd.index());
        Ok(slot)
    }

    /// Empties the table; used when the owning context is dropped.
    pub(crate) fn drain(&self) -> Vec<Arc<Descriptor>> {
        let mut inner = self.inner.lock_or_panic();
        let drained: Vec<Arc<Descriptor>> = inner.slots.iter_mut().filter_map(Option::take).collect();
        for index in 0..inner.slots.len() {
            inner.bitmap.clear(index);
        }
        drained
    }

    pub fn gen_msg_id(&self, sd: DescriptorId) -> Result<u64> {
        Ok(self.get(sd)?.gen_msg_id())
    }

    pub fn gen_cmd_id(&self, sd: DescriptorId) -> Result<u64> {
        Ok(self.get(sd)?.gen_cmd_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{self, TransportScheme};
    use std::collections::HashSet;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn test_link() -> Link {
        let (a, b) = UnixStream::pair().unwrap();
        scheme::find("generic")
            .unwrap()
            .open_fd_pair(OwnedFd::from(a), OwnedFd::from(b), 0)
            .unwrap()
    }

    fn generic() -> &'static dyn TransportScheme {
        scheme::find("generic").unwrap()
    }

    #[test]
    fn allocation_picks_lowest_free_slot_and_reuses_handles() {
        let table = DescriptorTable::new(8);
        let a = table.add(generic(), test_link()).unwrap();
        let b = table.add(generic(), test_link()).unwrap();
        let c = table.add(generic(), test_link()).unwrap();
        assert_eq!(
            (a, b, c),
            (
                DescriptorId(0),
                DescriptorId(1),
                DescriptorId(2)
            )
        );

        table.del(b).unwrap();
        let reused = table.add(generic(), test_link()).unwrap();
        assert_eq!(reused, DescriptorId(1));
    }

    #[test]
    fn exhaustion_reports_table_full() {
        let table = DescriptorTable::new(4);
        for _ in 0..4 {
            table.add(generic(), test_link()).unwrap();
        }
        assert!(matches!(
            table.add(generic(), test_link()),
            Err(Error::TableFull)
        ));
    }

    #[test]
    fn deleted_handles_fail_with_bad_descriptor() {
        let table = DescriptorTable::new(4);
        let sd = table.add(generic(), test_link()).unwrap();
        table.del(sd).unwrap();

        assert!(matches!(table.get(sd), Err(Error::BadDescriptor)));
        assert!(matches!(table.del(sd), Err(Error::BadDescriptor)));
        assert!(matches!(table.gen_msg_id(sd), Err(Error::BadDescriptor)));
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let desc = Descriptor::new(generic(), test_link());
        assert_eq!(desc.gen_msg_id(), 1);
        assert_eq!(desc.gen_msg_id(), 2);
        assert_eq!(desc.gen_cmd_id(), 1);
        assert_eq!(desc.gen_cmd_id(), 2);
    }

    #[test]
    fn concurrent_id_generation_yields_unique_ids() {
        let desc = Arc::new(Descriptor::new(generic(), test_link()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let desc = Arc::clone(&desc);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| desc.gen_msg_id()).collect::<Vec<u64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            // Per-thread sequences are strictly increasing.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn output_marker_toggles() {
        let desc = Descriptor::new(generic(), test_link());
        assert!(!desc.output_in_progress());
        desc.set_output_in_progress(true);
        assert!(desc.output_in_progress());
        desc.set_output_in_progress(false);
        assert!(!desc.output_in_progress());
    }

    #[test]
    fn pending_error_queue_matches_by_id() {
        let desc = Descriptor::new(generic(), test_link());
        let err = |orig_id| ErrPacket {
            etype: crate::packet::ErrType::User,
            code: 1,
            orig_id,
            data: None,
        };
        desc.push_pending_err(err(10));
        desc.push_pending_err(err(20));
        desc.push_pending_err(err(30));

        assert_eq!(desc.pop_pending_err(Some(20)).unwrap().orig_id, 20);
        assert!(desc.pop_pending_err(Some(20)).is_none());
        assert_eq!(desc.pop_pending_err(None).unwrap().orig_id, 10);
        assert_eq!(desc.pop_pending_err(None).unwrap().orig_id, 30);
        assert!(desc.pop_pending_err(None).is_none());
    }
}
