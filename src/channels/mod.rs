//! Per-channel caches.
//!
//! Each channel keeps a bounded, ordered window of its recent changes plus a
//! side log of late arrivals. A registry owns the caches and bounds how many
//! are resident at once.

mod late;
mod query;
mod registry;
mod single;

pub use late::LateSequenceLog;
pub use registry::ChannelCache;
pub use single::SingleChannelCache;
