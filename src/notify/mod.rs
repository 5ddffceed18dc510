//! Change notification.
//!
//! The change cache reports every dispatched change through a
//! [`ChangeNotifier`]. [`ChangeListener`] is the standard implementation: it
//! counts changes per channel and principal and wakes [`ChangeWaiter`]s
//! blocked on them.

mod listener;
mod waiter;

pub use listener::{channel_key, ChangeListener, WaiterId};
pub use waiter::{ChangeWaiter, WaitOutcome};

use crate::context::Context;
use crate::types::ChannelSet;
use std::collections::BTreeSet;

/// Receives change notifications from the cache.
pub trait ChangeNotifier: Send + Sync {
    /// Entries in `channels` were dispatched. Called for every channel an
    /// entry belongs to, whether or not it has a resident cache.
    fn notify_change(&self, ctx: &Context, channels: &ChannelSet);

    /// User or role documents with these keys changed.
    fn notify_principals(&self, _ctx: &Context, _principals: &BTreeSet<String>) {}
}

impl ChangeNotifier for ChangeListener {
    fn notify_change(&self, _ctx: &Context, channels: &ChannelSet) {
        self.notify_channels(channels);
    }

    fn notify_principals(&self, _ctx: &Context, principals: &BTreeSet<String>) {
        self.notify_principal_keys(principals);
    }
}

impl<F> ChangeNotifier for F
where
    F: Fn(&Context, &ChannelSet) + Send + Sync,
{
    fn notify_change(&self, ctx: &Context, channels: &ChannelSet) {
        self(ctx, channels)
    }
}

/// Notifier that drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn notify_change(&self, _ctx: &Context, _channels: &ChannelSet) {}
}
