//! Cache janitor (C6): periodically sweeps expired entries out of every
//! artifact's private cache so TTL eviction doesn't wait for the next read.

use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::registry::Registry;

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 600;

/// One sweep pass over every artifact's cache. Returns the total number of
/// expired entries removed, for logging/metrics.
pub fn sweep_once(registry: &Registry) -> usize {
    let mut total = 0;
    for artifact in registry.artifacts_snapshot() {
        if let Some(cache) = artifact.cache() {
            total += cache.sweep();
        }
    }
    if total > 0 {
        debug!(removed = total, "cache janitor swept expired entries");
    }
    total
}

/// Runs the janitor loop on the calling thread (intended to be the VM actor
/// thread's idle-time work, driven from `mce-server`'s actor loop rather than
/// a dedicated OS thread, since [`Registry`] is `!Send`).
pub fn run_blocking(registry: Rc<Registry>, check_interval: Duration, mut should_continue: impl FnMut() -> bool) {
    while should_continue() {
        std::thread::sleep(check_interval);
        if !should_continue() {
            break;
        }
        sweep_once(&registry);
    }
}
