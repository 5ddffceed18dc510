//! Sequence bookkeeping: skipped sequences and the pending buffer.

mod pending;
mod skipped;

pub(crate) use pending::PendingBuffer;
pub use skipped::{CleanOutcome, SkippedSequence, SkippedSequenceList};
