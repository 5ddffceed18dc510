//! Change counters keyed by channel and principal.

use super::waiter::ChangeWaiter;
use crate::types::{ChannelId, ChannelSet};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Identifies a registered waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaiterId(pub u64);

/// Internal waiter registration.
struct Registration {
    keys: HashSet<String>,
    /// Capacity one: a pending wakeup is never lost and never piles up.
    wakeup: Sender<()>,
}

impl Registration {
    /// Returns false once the waiter's receiver is gone.
    fn wake(&self) -> bool {
        !matches!(self.wakeup.try_send(()), Err(TrySendError::Disconnected(_)))
    }
}

struct ListenerState {
    counter: u64,
    terminate_check_counter: u64,
    /// Key -> counter value at its last change.
    key_counts: HashMap<String, u64>,
    waiters: HashMap<WaiterId, Registration>,
    next_id: u64,
}

/// Notification key of a channel.
pub fn channel_key(channel: &ChannelId) -> String {
    channel.to_string()
}

/// Tracks when each channel or principal key last changed and wakes waiters
/// interested in it.
pub struct ChangeListener {
    state: Mutex<ListenerState>,
}

impl ChangeListener {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ListenerState {
                counter: 0,
                terminate_check_counter: 0,
                key_counts: HashMap::new(),
                waiters: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Record a change to `keys` and wake every waiter watching one of them.
    pub fn notify<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock();
        state.counter += 1;
        let counter = state.counter;

        let changed: HashSet<String> = keys.into_iter().collect();
        if changed.is_empty() {
            return;
        }
        for key in &changed {
            state.key_counts.insert(key.clone(), counter);
        }
        let mut woken = 0;
        state.waiters.retain(|_, registration| {
            if registration.keys.is_disjoint(&changed) {
                return true;
            }
            woken += 1;
            registration.wake()
        });
        trace!(counter, keys = changed.len(), woken, "notified change");
    }

    pub fn notify_channels(&self, channels: &ChannelSet) {
        self.notify(channels.iter().map(channel_key));
    }

    pub fn notify_principal_keys(&self, principals: &BTreeSet<String>) {
        self.notify(principals.iter().cloned());
    }

    /// Wake every waiter so it can check whether it should stop.
    pub fn notify_check_for_termination(&self) {
        let mut state = self.state.lock();
        state.terminate_check_counter += 1;
        state.waiters.retain(|_, registration| registration.wake());
    }

    /// Latest change counter across `keys`; zero if none has changed.
    pub fn current_count<'a, I>(&self, keys: I) -> u64
    where
        I: IntoIterator<Item = &'a String>,
    {
        let state = self.state.lock();
        Self::count_locked(&state, keys)
    }

    fn count_locked<'a, I>(state: &ListenerState, keys: I) -> u64
    where
        I: IntoIterator<Item = &'a String>,
    {
        keys.into_iter()
            .filter_map(|key| state.key_counts.get(key))
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// (change counter for `keys`, termination counter).
    pub(crate) fn counters_for(&self, keys: &HashSet<String>) -> (u64, u64) {
        let state = self.state.lock();
        (
            Self::count_locked(&state, keys),
            state.terminate_check_counter,
        )
    }

    /// Global change counter.
    pub fn counter(&self) -> u64 {
        self.state.lock().counter
    }

    /// Number of registered waiters.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// A waiter for changes to `channels` or `principals`.
    pub fn new_waiter(
        self: &Arc<Self>,
        channels: &ChannelSet,
        principals: &BTreeSet<String>,
    ) -> ChangeWaiter {
        let keys = Self::keys_for(channels, principals);
        ChangeWaiter::new(self.clone(), keys)
    }

    pub(crate) fn keys_for(channels: &ChannelSet, principals: &BTreeSet<String>) -> HashSet<String> {
        channels
            .iter()
            .map(channel_key)
            .chain(principals.iter().cloned())
            .collect()
    }

    pub(crate) fn register(&self, keys: HashSet<String>) -> (WaiterId, Receiver<()>) {
        let (wakeup, receiver) = bounded(1);
        let mut state = self.state.lock();
        let id = WaiterId(state.next_id);
        state.next_id += 1;
        state.waiters.insert(id, Registration { keys, wakeup });
        (id, receiver)
    }

    pub(crate) fn update_keys(&self, id: WaiterId, keys: HashSet<String>) {
        if let Some(registration) = self.state.lock().waiters.get_mut(&id) {
            registration.keys = keys;
        }
    }

    pub(crate) fn unregister(&self, id: WaiterId) {
        self.state.lock().waiters.remove(&id);
    }
}

impl Default for ChangeListener {
    fn default() -> Self {
        Self::new()
    }
}
