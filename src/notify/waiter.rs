//! Blocking waits for changes on a set of keys.

use super::listener::{ChangeListener, WaiterId};
use crate::context::Context;
use crate::error::{CacheError, Result};
use crate::types::ChannelSet;
use crossbeam_channel::{after, never, select, Receiver};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Why a wait returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One of the watched keys changed.
    Changed,
    /// `notify_check_for_termination` was called.
    CheckTerminated,
}

/// A consumer blocked on changes to its channels and principals.
///
/// Unregisters from its listener on drop.
pub struct ChangeWaiter {
    listener: Arc<ChangeListener>,
    id: WaiterId,
    keys: HashSet<String>,
    wakeups: Receiver<()>,
    last_counter: u64,
    last_terminate_check: u64,
}

impl ChangeWaiter {
    pub(crate) fn new(listener: Arc<ChangeListener>, keys: HashSet<String>) -> Self {
        let (id, wakeups) = listener.register(keys.clone());
        let (last_counter, last_terminate_check) = listener.counters_for(&keys);
        Self {
            listener,
            id,
            keys,
            wakeups,
            last_counter,
            last_terminate_check,
        }
    }

    /// Block until a watched key changes or a termination check is requested.
    pub fn wait(&mut self, ctx: &Context) -> Result<WaitOutcome> {
        self.wait_until(ctx, None)
    }

    /// Like [`wait`](Self::wait), failing with `Timeout` after `timeout`.
    pub fn wait_timeout(&mut self, ctx: &Context, timeout: Duration) -> Result<WaitOutcome> {
        self.wait_until(ctx, Some(timeout))
    }

    fn wait_until(&mut self, ctx: &Context, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let deadline = match timeout {
            Some(timeout) => after(timeout),
            None => never(),
        };
        loop {
            ctx.check()?;
            if let Some(outcome) = self.poll() {
                return Ok(outcome);
            }
            select! {
                recv(self.wakeups) -> _ => {}
                recv(ctx.done()) -> _ => return Err(CacheError::Cancelled),
                recv(deadline) -> _ => {
                    return Err(CacheError::Timeout(timeout.unwrap_or_default()));
                }
            }
        }
    }

    /// Outcome if something changed since the last wait.
    fn poll(&mut self) -> Option<WaitOutcome> {
        let (counter, terminate_check) = self.listener.counters_for(&self.keys);
        if terminate_check != self.last_terminate_check {
            self.last_terminate_check = terminate_check;
            return Some(WaitOutcome::CheckTerminated);
        }
        if counter != self.last_counter {
            self.last_counter = counter;
            return Some(WaitOutcome::Changed);
        }
        None
    }

    /// Replace the watched channels and principals. Changes already seen are
    /// not reported again.
    pub fn update_channels(&mut self, channels: &ChannelSet, principals: &BTreeSet<String>) {
        self.keys = ChangeListener::keys_for(channels, principals);
        self.listener.update_keys(self.id, self.keys.clone());
        self.last_counter = self.listener.current_count(&self.keys);
    }

    /// Latest change counter across the watched keys.
    pub fn current_count(&self) -> u64 {
        self.listener.current_count(&self.keys)
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }
}

impl Drop for ChangeWaiter {
    fn drop(&mut self) {
        self.listener.unregister(self.id);
    }
}
