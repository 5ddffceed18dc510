//! Blocking waits on the ingestion cursor.

use crate::context::Context;
use crate::error::{CacheError, Result};
use crate::types::Sequence;
use crossbeam_channel::{after, bounded, select, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

struct WatchState {
    /// Next sequence the cache expects; everything below it is resolved.
    next: Sequence,
    closed: bool,
    /// Waiter id -> (awaited sequence, sender dropped on release).
    waiters: HashMap<u64, (Sequence, Sender<()>)>,
    next_id: u64,
}

/// Lets callers block until the cursor passes a sequence.
pub(crate) struct SequenceWatch {
    state: Mutex<WatchState>,
}

impl SequenceWatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WatchState {
                next: Sequence(1),
                closed: true,
                waiters: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Reopen at `next` after a (re)start.
    pub fn reset(&self, next: Sequence) {
        let mut state = self.state.lock();
        state.next = next;
        state.closed = false;
    }

    /// Move the cursor to `next` and release every waiter it satisfies.
    pub fn advance(&self, next: Sequence) {
        let mut state = self.state.lock();
        if next <= state.next {
            return;
        }
        state.next = next;
        state.waiters.retain(|_, (seq, _)| *seq >= next);
    }

    /// Release every waiter with `Stopped`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
    }

    /// Block until the cursor has passed `seq`.
    pub fn wait(&self, ctx: &Context, seq: Sequence, timeout: Duration) -> Result<()> {
        let (id, released) = {
            let mut state = self.state.lock();
            if state.next > seq {
                return Ok(());
            }
            if state.closed {
                return Err(CacheError::Stopped);
            }
            let (tx, rx) = bounded::<()>(0);
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.insert(id, (seq, tx));
            (id, rx)
        };

        let outcome = select! {
            recv(released) -> _ => None,
            recv(ctx.done()) -> _ => Some(CacheError::Cancelled),
            recv(after(timeout)) -> _ => Some(CacheError::Timeout(timeout)),
        };

        let mut state = self.state.lock();
        state.waiters.remove(&id);
        match outcome {
            Some(err) => Err(err),
            None if state.next > seq => Ok(()),
            None => Err(CacheError::Stopped),
        }
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
