//! Coalescing of fallback storage queries issued on a channel cache miss.
//!
//! At most one query runs per channel. A caller whose range is covered by the
//! running query waits for it and shares its result; a caller whose range is
//! not covered waits for it to finish and then tries again.

use crate::context::Context;
use crate::error::{CacheError, Result};
use crate::types::{LogEntry, Sequence};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

type SharedResult = std::result::Result<Vec<Arc<LogEntry>>, String>;

struct InFlight {
    start: Sequence,
    end: Sequence,
    result: Mutex<Option<SharedResult>>,
    /// Disconnects when the leader finishes.
    done: Receiver<()>,
}

impl InFlight {
    fn covers(&self, start: Sequence, end: Sequence) -> bool {
        self.start <= start && end <= self.end
    }
}

enum Role<'a> {
    Leader(LeaderGuard<'a>),
    Follower(Arc<InFlight>),
}

/// Leadership of the in-flight slot. Dropping it, including while unwinding
/// from a panicking query, clears the slot and releases followers.
struct LeaderGuard<'a> {
    coalescer: &'a QueryCoalescer,
    flight: Arc<InFlight>,
    done_tx: Option<Sender<()>>,
}

impl LeaderGuard<'_> {
    fn publish(&self, result: &Result<Vec<Arc<LogEntry>>>) {
        *self.flight.result.lock() = Some(match result {
            Ok(entries) => Ok(entries.clone()),
            Err(e) => Err(e.to_string()),
        });
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.coalescer.in_flight.lock();
        if slot.as_ref().map_or(false, |f| Arc::ptr_eq(f, &self.flight)) {
            *slot = None;
        }
        drop(slot);
        self.done_tx.take();
    }
}

pub(crate) struct QueryCoalescer {
    in_flight: Mutex<Option<Arc<InFlight>>>,
}

impl QueryCoalescer {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(None),
        }
    }

    /// Run `query` for `start..=end`, or share the result of an in-flight
    /// query covering the range. `waiters` counts callers blocked on another
    /// caller's query.
    pub fn run<F>(
        &self,
        ctx: &Context,
        start: Sequence,
        end: Sequence,
        waiters: &AtomicU64,
        query: F,
    ) -> Result<Vec<Arc<LogEntry>>>
    where
        F: FnOnce() -> Result<Vec<LogEntry>>,
    {
        let mut query = Some(query);
        loop {
            ctx.check()?;
            match self.join(start, end) {
                Role::Leader(leader) => {
                    let run = query
                        .take()
                        .ok_or_else(|| CacheError::InvalidState("query already consumed".into()))?;
                    let result = run().map(|entries| entries.into_iter().map(Arc::new).collect());
                    leader.publish(&result);
                    return result;
                }
                Role::Follower(flight) => {
                    trace!(start = start.0, end = end.0, "waiting on in-flight query");
                    waiters.fetch_add(1, Ordering::SeqCst);
                    let cancelled = select! {
                        recv(flight.done) -> _ => false,
                        recv(ctx.done()) -> _ => true,
                    };
                    waiters.fetch_sub(1, Ordering::SeqCst);
                    if cancelled {
                        return Err(CacheError::Cancelled);
                    }
                    if !flight.covers(start, end) {
                        continue;
                    }
                    let shared = flight.result.lock().clone();
                    match shared {
                        Some(Ok(entries)) => {
                            return Ok(entries
                                .into_iter()
                                .filter(|e| e.sequence >= start && e.sequence <= end)
                                .collect())
                        }
                        Some(Err(msg)) => return Err(CacheError::Storage(msg)),
                        // Leader died without a result; take over
                        None => continue,
                    }
                }
            }
        }
    }

    /// Whether a query is currently running.
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    fn join(&self, start: Sequence, end: Sequence) -> Role<'_> {
        let mut slot = self.in_flight.lock();
        if let Some(flight) = slot.as_ref() {
            return Role::Follower(flight.clone());
        }
        let (done_tx, done) = bounded(0);
        let flight = Arc::new(InFlight {
            start,
            end,
            result: Mutex::new(None),
            done,
        });
        *slot = Some(flight.clone());
        Role::Leader(LeaderGuard {
            coalescer: self,
            flight,
            done_tx: Some(done_tx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
        range
            .map(|s| LogEntry::document(Sequence(s), format!("doc-{}", s), "1-a", &["ABC"], 0))
            .collect()
    }

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_single_caller_runs_query() {
        let coalescer = QueryCoalescer::new();
        let waiters = AtomicU64::new(0);
        let result = coalescer
            .run(&Context::new(), Sequence(1), Sequence(3), &waiters, || Ok(entries(1..=3)))
            .unwrap();
        assert_eq!(result.len(), 3);
        assert!(!coalescer.is_busy());
    }

    #[test]
    fn test_followers_share_result() {
        let coalescer = Arc::new(QueryCoalescer::new());
        let waiters = Arc::new(AtomicU64::new(0));
        let queries = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = bounded::<()>(0);

        let leader = {
            let (coalescer, waiters, queries) = (coalescer.clone(), waiters.clone(), queries.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(1), Sequence(10), &waiters, || {
                    queries.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.recv();
                    Ok(entries(1..=10))
                })
            })
        };
        wait_until(|| coalescer.is_busy());

        let follower = {
            let (coalescer, waiters, queries) = (coalescer.clone(), waiters.clone(), queries.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(2), Sequence(5), &waiters, || {
                    queries.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
            })
        };
        wait_until(|| waiters.load(Ordering::SeqCst) == 1);
        drop(release_tx);

        assert_eq!(leader.join().unwrap().unwrap().len(), 10);
        let shared = follower.join().unwrap().unwrap();
        let seqs: Vec<u64> = shared.iter().map(|e| e.sequence.0).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);
        assert_eq!(queries.load(Ordering::SeqCst), 1);
        assert_eq!(waiters.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_follower_returns_promptly() {
        let coalescer = Arc::new(QueryCoalescer::new());
        let waiters = Arc::new(AtomicU64::new(0));
        let (release_tx, release_rx) = bounded::<()>(0);

        let leader = {
            let (coalescer, waiters) = (coalescer.clone(), waiters.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(1), Sequence(10), &waiters, || {
                    let _ = release_rx.recv();
                    Ok(entries(1..=10))
                })
            })
        };
        wait_until(|| coalescer.is_busy());

        let ctx = Context::new();
        let follower = {
            let (coalescer, waiters, ctx) = (coalescer.clone(), waiters.clone(), ctx.clone());
            thread::spawn(move || {
                coalescer.run(&ctx, Sequence(1), Sequence(10), &waiters, || {
                    panic!("follower must not query")
                })
            })
        };
        wait_until(|| waiters.load(Ordering::SeqCst) == 1);
        ctx.cancel();
        assert!(matches!(follower.join().unwrap(), Err(CacheError::Cancelled)));

        drop(release_tx);
        assert!(leader.join().unwrap().is_ok());
    }

    #[test]
    fn test_error_shared_with_followers() {
        let coalescer = Arc::new(QueryCoalescer::new());
        let waiters = Arc::new(AtomicU64::new(0));
        let (release_tx, release_rx) = bounded::<()>(0);

        let leader = {
            let (coalescer, waiters) = (coalescer.clone(), waiters.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(1), Sequence(10), &waiters, || {
                    let _ = release_rx.recv();
                    Err(CacheError::Storage("view unavailable".into()))
                })
            })
        };
        wait_until(|| coalescer.is_busy());

        let follower = {
            let (coalescer, waiters) = (coalescer.clone(), waiters.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(1), Sequence(10), &waiters, || Ok(Vec::new()))
            })
        };
        wait_until(|| waiters.load(Ordering::SeqCst) == 1);
        drop(release_tx);

        assert!(matches!(leader.join().unwrap(), Err(CacheError::Storage(_))));
        assert!(matches!(follower.join().unwrap(), Err(CacheError::Storage(_))));
    }

    #[test]
    fn test_panicking_leader_releases_slot() {
        let coalescer = Arc::new(QueryCoalescer::new());
        let waiters = AtomicU64::new(0);

        let panicked = {
            let coalescer = coalescer.clone();
            thread::spawn(move || {
                let waiters = AtomicU64::new(0);
                coalescer.run(&Context::new(), Sequence(1), Sequence(10), &waiters, || {
                    panic!("storage driver crashed")
                })
            })
        };
        assert!(panicked.join().is_err());
        assert!(!coalescer.is_busy());

        // The next caller leads a fresh query instead of inheriting the failure
        let result = coalescer
            .run(&Context::new(), Sequence(1), Sequence(10), &waiters, || Ok(entries(1..=10)))
            .unwrap();
        assert_eq!(result.len(), 10);
    }

    #[test]
    fn test_follower_takes_over_from_panicking_leader() {
        let coalescer = Arc::new(QueryCoalescer::new());
        let waiters = Arc::new(AtomicU64::new(0));
        let (release_tx, release_rx) = bounded::<()>(0);

        let leader = {
            let (coalescer, waiters) = (coalescer.clone(), waiters.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(1), Sequence(10), &waiters, || {
                    let _ = release_rx.recv();
                    panic!("storage driver crashed")
                })
            })
        };
        wait_until(|| coalescer.is_busy());

        let follower = {
            let (coalescer, waiters) = (coalescer.clone(), waiters.clone());
            thread::spawn(move || {
                coalescer.run(&Context::new(), Sequence(2), Sequence(5), &waiters, || {
                    Ok(entries(2..=5))
                })
            })
        };
        wait_until(|| waiters.load(Ordering::SeqCst) == 1);
        drop(release_tx);

        assert!(leader.join().is_err());
        let result = follower.join().unwrap().unwrap();
        assert_eq!(result.len(), 4);
        assert!(!coalescer.is_busy());
    }
}
