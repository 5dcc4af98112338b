// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker threads for threaded command dispatch.
//!
//! Workers behave like the detached threads of the original runtime — the
//! receive loop never waits for them — but their join handles are kept, so
//! teardown and tests can observe termination instead of racing against
//! it.

use std::sync::Mutex;
use std::thread::{Builder, JoinHandle};

use crate::error::{Error, Result};
use crate::MutexExt;

#[derive(Default)]
pub struct WorkerSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSet {
    pub fn new() -> WorkerSet {
        WorkerSet::default()
    }

    /// Spawns a worker. Spawn failure is reported to the caller; the job
    /// is dropped.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Builder::new()
            .name("seap-cmd-worker".into())
            .spawn(job)
            .map_err(Error::WorkerSpawn)?;

        let mut handles = self.handles.lock_or_panic();
        // Reap finished workers while we're here so the vec stays small.
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Number of workers not yet finished.
    pub fn active(&self) -> usize {
        let mut handles = self.handles.lock_or_panic();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Blocks until every worker spawned so far has terminated.
    pub fn join_all(&self) {
        let drained: Vec<JoinHandle<()>> = self.handles.lock_or_panic().drain(..).collect();
        for handle in drained {
            if handle.join().is_err() {
                tracing::warn!("command worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn join_all_observes_termination() {
        let set = WorkerSet::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            set.spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        set.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(set.active(), 0);
    }
}
