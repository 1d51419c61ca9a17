//! The tier contract and the chain that links tiers together.
//!
//! A cache is an ordered list of tiers, fastest first. A read walks down
//! the chain until some tier can serve it; the serving tier pushes the
//! bytes back up through `populate`, filling every faster tier on the
//! way, and the callbacks parked at each tier fire from that population
//! step. A tier with nothing below it answers a miss with `None`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use veld_core::Fingerprint;

use crate::range::{DenseData, Range, SparseData};
use crate::uri::ResourceUri;

/// Invoked with the data covering the requested range, or `None` when
/// the request missed every tier, timed out, or failed downstream.
pub type TransferCallback = Box<dyn FnOnce(Option<SparseData>) + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub entries: usize,
    pub stored_bytes: u64,
}

/// One tier of the cache chain.
///
/// `get_data` returns `false` when the callback has already been invoked
/// (a synchronous hit) and `true` when it will arrive later; callers
/// must be correct under either.
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    fn get_data(&self, uri: &ResourceUri, range: Range, callback: TransferCallback) -> bool;

    /// Insert known bytes into this tier and recurse into the tier
    /// above. `total_len` carries the blob's full length when the source
    /// learned it.
    fn populate(&self, fingerprint: &Fingerprint, data: DenseData, total_len: Option<u64>);

    /// Drop the entry from this tier and every tier below.
    fn purge(&self, fingerprint: &Fingerprint);

    fn link(&self) -> &TierLink;

    fn stats(&self) -> TierStats {
        TierStats::default()
    }
}

/// Forward/backward wiring of one tier: a strong handle to the slower
/// tier below and a weak handle to the faster tier above.
pub struct TierLink {
    next: OnceLock<Arc<dyn CacheTier>>,
    parent: OnceLock<Weak<dyn CacheTier>>,
}

impl TierLink {
    pub fn new() -> Self {
        TierLink {
            next: OnceLock::new(),
            parent: OnceLock::new(),
        }
    }

    fn set_next(&self, next: Arc<dyn CacheTier>) {
        let _ = self.next.set(next);
    }

    fn set_parent(&self, parent: Weak<dyn CacheTier>) {
        let _ = self.parent.set(parent);
    }

    pub fn has_next(&self) -> bool {
        self.next.get().is_some()
    }

    /// Pass a request to the tier below, or answer not-found at the end
    /// of the chain. Returns the callee's will-callback-later flag.
    pub fn forward(&self, uri: &ResourceUri, range: Range, callback: TransferCallback) -> bool {
        match self.next.get() {
            Some(next) => next.get_data(uri, range, callback),
            None => {
                callback(None);
                false
            }
        }
    }

    /// Continue the population recursion upward. Terminates at the top
    /// tier, which has no parent.
    pub fn populate_parent(&self, fingerprint: &Fingerprint, data: DenseData, total_len: Option<u64>) {
        if let Some(parent) = self.parent.get().and_then(Weak::upgrade) {
            parent.populate(fingerprint, data, total_len);
        }
    }

    pub fn purge_next(&self, fingerprint: &Fingerprint) {
        if let Some(next) = self.next.get() {
            next.purge(fingerprint);
        }
    }
}

impl Default for TierLink {
    fn default() -> Self {
        TierLink::new()
    }
}

/// The assembled chain, fastest tier first.
pub struct CacheChain {
    tiers: Vec<Arc<dyn CacheTier>>,
}

impl CacheChain {
    /// Wire `tiers` in latency order. Panics on an empty list — a cache
    /// with no tiers is a construction bug.
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        assert!(!tiers.is_empty(), "cache chain needs at least one tier");
        for i in 0..tiers.len() - 1 {
            tiers[i].link().set_next(Arc::clone(&tiers[i + 1]));
            tiers[i + 1].link().set_parent(Arc::downgrade(&tiers[i]));
        }
        CacheChain { tiers }
    }

    /// Request bytes through the top of the chain.
    pub fn get_data(&self, uri: &ResourceUri, range: Range, callback: TransferCallback) -> bool {
        self.tiers[0].get_data(uri, range, callback)
    }

    /// Insert from the bottom so the data climbs through every tier.
    pub fn populate(&self, fingerprint: &Fingerprint, data: DenseData, total_len: Option<u64>) {
        self.tiers
            .last()
            .expect("chain is never empty")
            .populate(fingerprint, data, total_len);
    }

    /// Remove a blob from every tier.
    pub fn purge(&self, fingerprint: &Fingerprint) {
        self.tiers[0].purge(fingerprint);
    }

    pub fn stats(&self) -> Vec<(&'static str, TierStats)> {
        self.tiers.iter().map(|t| (t.name(), t.stats())).collect()
    }

    pub fn tiers(&self) -> &[Arc<dyn CacheTier>] {
        &self.tiers
    }
}

// ── Parked requests ──────────────────────────────────────────────────────────

/// Requests a tier is holding while the tier below works.
///
/// Coalescing lives here: a request whose range is contained in one
/// already parked shares the in-flight downstream request instead of
/// forwarding again. Every parked callback gets a timeout that answers
/// not-found on expiry.
pub(crate) struct PendingTable {
    inner: Arc<Mutex<PendingInner>>,
    timeout: Duration,
}

struct PendingInner {
    waiters: HashMap<Fingerprint, Vec<Waiter>>,
    next_id: u64,
}

struct Waiter {
    id: u64,
    range: Range,
    callback: Option<TransferCallback>,
}

impl PendingTable {
    pub(crate) fn new(timeout: Duration) -> Self {
        PendingTable {
            inner: Arc::new(Mutex::new(PendingInner {
                waiters: HashMap::new(),
                next_id: 0,
            })),
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a callback. Returns `true` when an already in-flight request
    /// is guaranteed to satisfy it, i.e. the caller must not forward.
    pub(crate) fn park(&self, fingerprint: Fingerprint, range: Range, callback: TransferCallback) -> bool {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            let waiters = inner.waiters.entry(fingerprint).or_default();
            let covered = waiters.iter().any(|w| w.range.contains(&range));
            waiters.push(Waiter {
                id,
                range,
                callback: Some(callback),
            });
            if covered {
                self.spawn_timeout(fingerprint, id);
                return true;
            }
            id
        };
        self.spawn_timeout(fingerprint, id);
        false
    }

    fn spawn_timeout(&self, fingerprint: Fingerprint, id: u64) {
        if self.timeout.is_zero() {
            return;
        }
        // Outside a runtime (plain unit tests) requests simply have no
        // timeout.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let timeout = self.timeout;
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                take_waiter(&mut inner, &fingerprint, id)
            };
            if let Some(callback) = expired {
                tracing::debug!(fingerprint = %fingerprint, "cache request timed out");
                callback(None);
            }
        });
    }

    /// Fire every waiter whose range `covered` now satisfies, with the
    /// data `view` builds for it.
    pub(crate) fn complete(
        &self,
        fingerprint: &Fingerprint,
        covered: impl Fn(&Range) -> bool,
        view: impl Fn(&Range) -> SparseData,
    ) {
        let ready: Vec<(Range, TransferCallback)> = {
            let mut inner = self.lock();
            let Some(waiters) = inner.waiters.get_mut(fingerprint) else {
                return;
            };
            let mut ready = Vec::new();
            waiters.retain_mut(|w| {
                if covered(&w.range) {
                    if let Some(cb) = w.callback.take() {
                        ready.push((w.range, cb));
                    }
                    false
                } else {
                    true
                }
            });
            if waiters.is_empty() {
                inner.waiters.remove(fingerprint);
            }
            ready
        };
        for (range, callback) in ready {
            callback(Some(view(&range)));
        }
    }

    /// Answer not-found to every waiter whose range the failed request
    /// contained. Waiters that forwarded their own downstream request
    /// keep waiting for it (or for their timeout).
    pub(crate) fn fail_within(&self, fingerprint: &Fingerprint, range: &Range) {
        let failed: Vec<TransferCallback> = {
            let mut inner = self.lock();
            let Some(waiters) = inner.waiters.get_mut(fingerprint) else {
                return;
            };
            let mut failed = Vec::new();
            waiters.retain_mut(|w| {
                if range.contains(&w.range) {
                    if let Some(cb) = w.callback.take() {
                        failed.push(cb);
                    }
                    false
                } else {
                    true
                }
            });
            if waiters.is_empty() {
                inner.waiters.remove(fingerprint);
            }
            failed
        };
        for callback in failed {
            callback(None);
        }
    }
}

fn take_waiter(
    inner: &mut PendingInner,
    fingerprint: &Fingerprint,
    id: u64,
) -> Option<TransferCallback> {
    let waiters = inner.waiters.get_mut(fingerprint)?;
    let pos = waiters.iter().position(|w| w.id == id)?;
    let callback = waiters.remove(pos).callback;
    if waiters.is_empty() {
        inner.waiters.remove(fingerprint);
    }
    callback
}

/// Wrap a callback so the caller can tell afterwards whether it already
/// ran — the will-callback-later return value of `get_data`.
pub(crate) fn with_fired_flag(callback: TransferCallback) -> (TransferCallback, Arc<AtomicBool>) {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let wrapped: TransferCallback = Box::new(move |result| {
        flag.store(true, Ordering::Release);
        callback(result);
    });
    (wrapped, fired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::of(&[n])
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TransferCallback {
        let counter = Arc::clone(counter);
        Box::new(move |result| {
            if result.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn contained_request_coalesces() {
        let pending = PendingTable::new(Duration::ZERO);
        let hits = Arc::new(AtomicUsize::new(0));

        let first = pending.park(fp(1), Range::to(0, 100), counting_callback(&hits));
        assert!(!first, "first request must forward downstream");

        let second = pending.park(fp(1), Range::to(10, 50), counting_callback(&hits));
        assert!(second, "contained request shares the in-flight fetch");

        let wider = pending.park(fp(1), Range::to(50, 200), counting_callback(&hits));
        assert!(!wider, "a wider request still forwards");

        // population covering [0, 200) satisfies all three at once
        let view = SparseData::from_dense(DenseData::new(0, veld_core::Chunk::from_vec(vec![0; 200])));
        pending.complete(&fp(1), |r| view.covers(r), |r| view.clipped(r));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // later completions find nothing left
        pending.complete(&fp(1), |_| true, |r| view.clipped(r));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failure_reaches_only_contained_waiters() {
        let pending = PendingTable::new(Duration::ZERO);
        let fired = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let failure_callback = |failures: &Arc<AtomicUsize>| -> TransferCallback {
            let failures = Arc::clone(failures);
            Box::new(move |result: Option<SparseData>| {
                if result.is_none() {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        pending.park(fp(2), Range::to(0, 100), failure_callback(&failures));
        pending.park(fp(2), Range::to(500, 600), counting_callback(&fired));

        pending.fail_within(&fp(2), &Range::to(0, 100));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // the distant waiter is untouched and still completable
        let view = SparseData::from_dense(DenseData::new(
            500,
            veld_core::Chunk::from_vec(vec![1; 100]),
        ));
        pending.complete(&fp(2), |r| view.covers(r), |r| view.clipped(r));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parked_request_times_out_with_not_found() {
        let pending = PendingTable::new(Duration::from_millis(20));
        let (tx, rx) = std::sync::mpsc::channel();
        pending.park(
            fp(3),
            Range::to(0, 10),
            Box::new(move |result| {
                tx.send(result.is_none()).unwrap();
            }),
        );
        let timed_out = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(timed_out);
    }
}
