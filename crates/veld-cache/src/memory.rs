//! In-memory cache tier. Hits are synchronous.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use veld_core::Fingerprint;

use crate::policy::CachePolicy;
use crate::range::{DenseData, Range, SparseData};
use crate::tier::{with_fired_flag, CacheTier, PendingTable, TierLink, TierStats, TransferCallback};
use crate::uri::ResourceUri;

pub struct MemoryTier {
    inner: Arc<MemInner>,
}

struct MemInner {
    link: TierLink,
    store: Mutex<MemStore>,
    pending: PendingTable,
}

struct MemStore {
    entries: HashMap<Fingerprint, SparseData>,
    policy: Box<dyn CachePolicy>,
    /// Entries with callbacks currently reading them; eviction defers.
    pins: HashMap<Fingerprint, usize>,
    deferred_evict: HashSet<Fingerprint>,
}

impl MemoryTier {
    pub fn new(policy: Box<dyn CachePolicy>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(MemoryTier {
            inner: Arc::new(MemInner {
                link: TierLink::new(),
                store: Mutex::new(MemStore {
                    entries: HashMap::new(),
                    policy,
                    pins: HashMap::new(),
                    deferred_evict: HashSet::new(),
                }),
                pending: PendingTable::new(request_timeout),
            }),
        })
    }
}

impl MemInner {
    fn store(&self) -> MutexGuard<'_, MemStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unpin(&self, fingerprint: &Fingerprint) {
        let mut store = self.store();
        let Some(count) = store.pins.get_mut(fingerprint) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            store.pins.remove(fingerprint);
            if store.deferred_evict.remove(fingerprint) {
                store.entries.remove(fingerprint);
                tracing::trace!(fingerprint = %fingerprint, "deferred eviction applied");
            }
        }
    }
}

impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn link(&self) -> &TierLink {
        &self.inner.link
    }

    fn get_data(&self, uri: &ResourceUri, range: Range, callback: TransferCallback) -> bool {
        let fingerprint = uri.fingerprint;
        let view = {
            let mut store = self.inner.store();
            match store.entries.get(&fingerprint) {
                Some(sparse) if sparse.covers(&range) => {
                    let clipped = sparse.clipped(&range);
                    store.policy.on_use(&fingerprint);
                    *store.pins.entry(fingerprint).or_insert(0) += 1;
                    Some(clipped)
                }
                _ => None,
            }
        };
        if let Some(view) = view {
            callback(Some(view));
            self.inner.unpin(&fingerprint);
            return false;
        }

        let (callback, fired) = with_fired_flag(callback);
        let shares_in_flight = self.inner.pending.park(fingerprint, range, callback);
        if !shares_in_flight {
            let inner = Arc::clone(&self.inner);
            let relay: TransferCallback = Box::new(move |result| {
                // success answers arrive through populate; only the
                // not-found path needs relaying upward
                if result.is_none() {
                    inner.pending.fail_within(&fingerprint, &range);
                }
            });
            self.inner.link.forward(uri, range, relay);
        }
        !fired.load(Ordering::Acquire)
    }

    fn populate(&self, fingerprint: &Fingerprint, data: DenseData, total_len: Option<u64>) {
        // View for the parked callbacks: current entry plus the full
        // incoming run, independent of what the budget lets us keep.
        let view = {
            let mut store = self.inner.store();
            let mut view = store
                .entries
                .get(fingerprint)
                .cloned()
                .unwrap_or_default();
            view.insert(data.clone());
            if let Some(t) = total_len {
                view.set_total_len(t);
            }

            // Store at most the leading budget's worth of the run.
            let budget = store.policy.budget();
            let stored = data.prefix(budget);
            let entry = store.entries.entry(*fingerprint).or_default();
            entry.insert(stored);
            if let Some(t) = total_len {
                entry.set_total_len(t);
            }
            let size = entry.size_bytes();
            store.deferred_evict.remove(fingerprint);
            let victims = store.policy.on_insert(fingerprint, size);
            for victim in victims {
                if store.pins.contains_key(&victim) {
                    store.deferred_evict.insert(victim);
                } else {
                    store.entries.remove(&victim);
                    tracing::trace!(fingerprint = %victim, "memory tier evicted");
                }
            }
            view
        };

        self.inner
            .pending
            .complete(fingerprint, |r| view.covers(r), |r| view.clipped(r));
        self.inner.link.populate_parent(fingerprint, data, total_len);
    }

    fn purge(&self, fingerprint: &Fingerprint) {
        {
            let mut store = self.inner.store();
            if store.entries.remove(fingerprint).is_some() {
                store.policy.on_remove(fingerprint);
            }
            store.deferred_evict.remove(fingerprint);
        }
        self.inner.link.purge_next(fingerprint);
    }

    fn stats(&self) -> TierStats {
        let store = self.inner.store();
        TierStats {
            entries: store.entries.len(),
            stored_bytes: store.entries.values().map(SparseData::size_bytes).sum(),
        }
    }
}
