//! Process-wide registry of live outbounds
//!
//! Every outbound registers itself on construction and is removed when
//! its last reference drops. The registry holds weak back-references
//! only; it never keeps an outbound alive. The metrics scrape walks it
//! to recompute the `outbound_count` gauge and drain traffic deltas.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

use crate::outbound::OutboundCore;

struct Registry {
    entries: DashMap<u64, Weak<OutboundCore>>,
    next_id: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        entries: DashMap::new(),
        next_id: AtomicU64::new(1),
    })
}

/// Insert a live outbound; returns the slot id to pass to [`unregister`].
pub(crate) fn register(outbound: &Arc<OutboundCore>) -> u64 {
    let reg = registry();
    let id = reg.next_id.fetch_add(1, Ordering::Relaxed);
    reg.entries.insert(id, Arc::downgrade(outbound));
    id
}

/// Remove a previously registered outbound.
pub(crate) fn unregister(id: u64) {
    registry().entries.remove(&id);
}

/// Visit every live outbound.
///
/// Entries whose outbound has already been destroyed are skipped (the
/// destructor removes them; a scrape may merely race it).
pub(crate) fn for_each(mut f: impl FnMut(&Arc<OutboundCore>)) {
    for entry in &registry().entries {
        if let Some(outbound) = entry.value().upgrade() {
            f(&outbound);
        }
    }
}

/// Number of live outbounds currently registered.
#[must_use]
pub fn live_outbounds() -> usize {
    let mut count = 0;
    for_each(|_| count += 1);
    count
}
