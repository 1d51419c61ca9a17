//! Pluggable eviction over a tier's byte budget.

use std::collections::{BTreeMap, HashMap};

use veld_core::Fingerprint;

/// Eviction bookkeeping for one tier.
///
/// `on_insert` records (or resizes) an entry and returns the
/// fingerprints the tier must evict to get back under budget; their
/// bookkeeping is already dropped, so the tier must not call `on_remove`
/// for them. `on_remove` is for removals the policy did not initiate
/// (purge, external deletion). All calls are no-ops for unknown
/// fingerprints.
pub trait CachePolicy: Send {
    fn on_use(&mut self, fingerprint: &Fingerprint);
    fn on_insert(&mut self, fingerprint: &Fingerprint, size: u64) -> Vec<Fingerprint>;
    fn on_remove(&mut self, fingerprint: &Fingerprint);
    fn used_bytes(&self) -> u64;
    fn budget(&self) -> u64;
}

/// Build the policy a config names. Unknown names fall back to LRU.
pub fn make_policy(name: &str, budget: u64) -> Box<dyn CachePolicy> {
    match name {
        "lfu" => Box::new(LfuPolicy::new(budget)),
        _ => Box::new(LruPolicy::new(budget)),
    }
}

// ── LRU ──────────────────────────────────────────────────────────────────────

/// Least-recently-used eviction. The default.
pub struct LruPolicy {
    budget: u64,
    used: u64,
    tick: u64,
    entries: HashMap<Fingerprint, (u64, u64)>, // stamp, size
    order: BTreeMap<u64, Fingerprint>,
}

impl LruPolicy {
    pub fn new(budget: u64) -> Self {
        LruPolicy {
            budget,
            used: 0,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn touch(&mut self, fingerprint: &Fingerprint) {
        if let Some((stamp, _)) = self.entries.get_mut(fingerprint) {
            self.order.remove(stamp);
            self.tick += 1;
            *stamp = self.tick;
            self.order.insert(self.tick, *fingerprint);
        }
    }

    fn forget(&mut self, fingerprint: &Fingerprint) -> u64 {
        match self.entries.remove(fingerprint) {
            Some((stamp, size)) => {
                self.order.remove(&stamp);
                self.used -= size;
                size
            }
            None => 0,
        }
    }
}

impl CachePolicy for LruPolicy {
    fn on_use(&mut self, fingerprint: &Fingerprint) {
        self.touch(fingerprint);
    }

    fn on_insert(&mut self, fingerprint: &Fingerprint, size: u64) -> Vec<Fingerprint> {
        self.forget(fingerprint);
        self.tick += 1;
        self.entries.insert(*fingerprint, (self.tick, size));
        self.order.insert(self.tick, *fingerprint);
        self.used += size;

        let mut evict = Vec::new();
        while self.used > self.budget {
            // oldest stamp first; the just-inserted entry goes last
            let Some((_, victim)) = self.order.iter().next().map(|(s, f)| (*s, *f)) else {
                break;
            };
            self.forget(&victim);
            evict.push(victim);
        }
        evict
    }

    fn on_remove(&mut self, fingerprint: &Fingerprint) {
        self.forget(fingerprint);
    }

    fn used_bytes(&self) -> u64 {
        self.used
    }

    fn budget(&self) -> u64 {
        self.budget
    }
}

// ── LFU ──────────────────────────────────────────────────────────────────────

/// Least-frequently-used eviction; ties fall to the older entry.
pub struct LfuPolicy {
    budget: u64,
    used: u64,
    tick: u64,
    entries: HashMap<Fingerprint, LfuEntry>,
}

struct LfuEntry {
    hits: u64,
    stamp: u64,
    size: u64,
}

impl LfuPolicy {
    pub fn new(budget: u64) -> Self {
        LfuPolicy {
            budget,
            used: 0,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn coldest(&self) -> Option<Fingerprint> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.hits, e.stamp))
            .map(|(fp, _)| *fp)
    }
}

impl CachePolicy for LfuPolicy {
    fn on_use(&mut self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.hits += 1;
        }
    }

    fn on_insert(&mut self, fingerprint: &Fingerprint, size: u64) -> Vec<Fingerprint> {
        if let Some(old) = self.entries.remove(fingerprint) {
            self.used -= old.size;
        }
        self.tick += 1;
        self.entries.insert(
            *fingerprint,
            LfuEntry {
                hits: 0,
                stamp: self.tick,
                size,
            },
        );
        self.used += size;

        let mut evict = Vec::new();
        while self.used > self.budget {
            let Some(victim) = self.coldest() else { break };
            if let Some(entry) = self.entries.remove(&victim) {
                self.used -= entry.size;
            }
            evict.push(victim);
        }
        evict
    }

    fn on_remove(&mut self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.entries.remove(fingerprint) {
            self.used -= entry.size;
        }
    }

    fn used_bytes(&self) -> u64 {
        self.used
    }

    fn budget(&self) -> u64 {
        self.budget
    }
}
