//! Background housekeeping for a running change cache.

use super::Shared;
use crate::context::Context;
use crate::error::CacheError;
use crossbeam_channel::{select, tick};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MIN_PENDING_CHECK: Duration = Duration::from_millis(1);

/// Runs until `ctx` is cancelled. Flushes the pending buffer when the feed
/// goes quiet and periodically cleans the skipped sequence list.
pub(super) fn run(shared: Arc<Shared>, ctx: Context) {
    let pending_check = tick((shared.config.pending_seq_max_wait / 2).max(MIN_PENDING_CHECK));
    let skipped_check = tick(shared.config.skipped_seq_clean_interval);
    debug!("change cache housekeeping started");

    loop {
        select! {
            recv(ctx.done()) -> _ => break,
            recv(pending_check) -> _ => {
                if ctx.is_cancelled() {
                    break;
                }
                shared.clean_pending();
            }
            recv(skipped_check) -> _ => {
                if ctx.is_cancelled() {
                    break;
                }
                match shared.clean_skipped(&ctx) {
                    Ok(()) => {}
                    Err(CacheError::Cancelled) | Err(CacheError::Stopped) => break,
                    Err(e) => warn!(error = %e, "skipped sequence cleanup failed, retrying next interval"),
                }
            }
        }
    }
    debug!("change cache housekeeping exited");
}
