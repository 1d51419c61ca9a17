//! Typed event fan-out with ordering and re-entrancy safety.
//!
//! `fire` appends to a FIFO queue; `process(deadline)` drains it. For an
//! event keyed (P, S), each band Early → Middle → Late delivers first to
//! the specific listeners at (P, S), then to the generic listeners at P,
//! insertion order within each list.
//!
//! Dispatch iterates a snapshot taken when the event starts, so listener
//! mutations made from inside a listener are deferred: a subscription
//! made during dispatch is not visible until the current event completes
//! and no nested dispatch remains on the stack; an unsubscription leaves
//! the listener visible to the in-flight event for the same reason. No
//! lock is held while a listener runs, which is what makes nested
//! dispatch legal.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use veld_core::{AbsTime, TimeSource};

use crate::types::{
    EventOrder, EventPtr, EventResponse, IdPair, ListenerKey, Primary, Secondary, SubscriptionId,
    NUM_ORDERS,
};

/// A listener. Receives the shared event, returns what to do next.
pub type ListenerFn = Box<dyn FnMut(&EventPtr) -> EventResponse + Send>;

/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<DispatchState>,
    clock: TimeSource,
}

struct Entry {
    id: u64,
    sub: Option<SubscriptionId>,
    f: Arc<Mutex<ListenerFn>>,
}

#[derive(Default)]
struct Bands([Vec<Entry>; NUM_ORDERS]);

impl Bands {
    fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }
}

#[derive(Default)]
struct PrimaryBuckets {
    generic: Bands,
    specific: HashMap<Secondary, Bands>,
}

enum Deferred {
    Subscribe {
        key: ListenerKey,
        order: EventOrder,
        entry: Entry,
    },
    Unsubscribe(SubscriptionId),
    Kill {
        key: ListenerKey,
        entry_id: u64,
    },
}

#[derive(Default)]
struct DispatchState {
    listeners: HashMap<Primary, PrimaryBuckets>,
    by_subscription: HashMap<SubscriptionId, (ListenerKey, u64)>,
    queue: VecDeque<EventPtr>,
    deferred: Vec<Deferred>,
    depth: u32,
    next_entry: u64,
}

impl EventDispatcher {
    pub fn new(clock: TimeSource) -> Self {
        EventDispatcher {
            inner: Arc::new(Inner {
                state: Mutex::new(DispatchState::default()),
                clock,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        // A listener may panic while dispatch holds no state lock, but its
        // own mutex gets poisoned; recover rather than propagate.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe anonymously. The listener can only remove itself by
    /// returning DELETE_LISTENER.
    pub fn subscribe(&self, key: impl Into<ListenerKey>, order: EventOrder, f: ListenerFn) {
        self.subscribe_inner(key.into(), None, order, f);
    }

    /// Subscribe under a stable id usable with [`unsubscribe`].
    ///
    /// If `id` is already present, the prior holder is unsubscribed
    /// before the new listener is installed; the swap is complete before
    /// any further event fires.
    ///
    /// [`unsubscribe`]: EventDispatcher::unsubscribe
    pub fn subscribe_named(
        &self,
        key: impl Into<ListenerKey>,
        id: SubscriptionId,
        order: EventOrder,
        f: ListenerFn,
    ) {
        self.subscribe_inner(key.into(), Some(id), order, f);
    }

    fn subscribe_inner(
        &self,
        key: ListenerKey,
        sub: Option<SubscriptionId>,
        order: EventOrder,
        f: ListenerFn,
    ) {
        let mut st = self.lock();
        st.next_entry += 1;
        let entry = Entry {
            id: st.next_entry,
            sub,
            f: Arc::new(Mutex::new(f)),
        };
        if st.depth > 0 {
            st.deferred.push(Deferred::Subscribe { key, order, entry });
        } else {
            st.insert_entry(key, order, entry);
        }
    }

    /// Remove the listener registered under `id`. During dispatch the
    /// removal is deferred; the in-flight event still reaches it.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut st = self.lock();
        if st.depth > 0 {
            st.deferred.push(Deferred::Unsubscribe(id));
        } else {
            st.remove_subscription(&id);
        }
    }

    /// Remove every listener waiting specifically for `pair`. Returns how
    /// many were removed. Events already being dispatched still reach
    /// them (the dispatch snapshot is unaffected).
    pub fn remove_all_by_interest(&self, pair: IdPair) -> usize {
        let mut st = self.lock();
        st.remove_bucket(&ListenerKey::from(pair))
    }

    /// Remove listeners at `primary`: the generic ones, the specific
    /// ones, or both.
    pub fn remove_all_by_primary(&self, primary: Primary, generic: bool, specific: bool) -> usize {
        let mut st = self.lock();
        let mut removed = 0;
        if generic {
            removed += st.remove_bucket(&ListenerKey::from(primary));
        }
        if specific {
            let secondaries: Vec<Secondary> = st
                .listeners
                .get(&primary)
                .map(|pb| pb.specific.keys().copied().collect())
                .unwrap_or_default();
            for s in secondaries {
                removed += st.remove_bucket(&ListenerKey {
                    primary,
                    secondary: Some(s),
                });
            }
        }
        removed
    }

    /// Queue an event for the next `process` call. FIFO between events.
    pub fn fire(&self, event: EventPtr) {
        self.lock().queue.push_back(event);
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Drain queued events until the queue empties or the clock reaches
    /// `deadline`. At least one event is dispatched per call when the
    /// queue is non-empty. Returns the number dispatched.
    pub fn process(&self, deadline: AbsTime) -> usize {
        let mut processed = 0;
        loop {
            let next = self.lock().queue.pop_front();
            let Some(event) = next else { break };
            self.dispatch_event(&event);
            processed += 1;
            if self.inner.clock.now() >= deadline {
                break;
            }
        }
        processed
    }

    /// Drain the queue without a time budget.
    pub fn process_all(&self) -> usize {
        self.process(AbsTime::FAR_FUTURE)
    }

    fn dispatch_event(&self, event: &EventPtr) {
        let pair = event.id();
        let snapshot: Vec<(ListenerKey, u64, Arc<Mutex<ListenerFn>>)> = {
            let mut st = self.lock();
            st.depth += 1;
            let mut list = Vec::new();
            if let Some(pb) = st.listeners.get(&pair.primary) {
                let specific_key = ListenerKey::from(pair);
                let generic_key = ListenerKey::from(pair.primary);
                for band in 0..NUM_ORDERS {
                    if let Some(bands) = pb.specific.get(&pair.secondary) {
                        for e in &bands.0[band] {
                            list.push((specific_key, e.id, Arc::clone(&e.f)));
                        }
                    }
                    for e in &pb.generic.0[band] {
                        list.push((generic_key, e.id, Arc::clone(&e.f)));
                    }
                }
            }
            list
        };

        for (key, entry_id, f) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut listener = f.lock().unwrap_or_else(PoisonError::into_inner);
                (listener)(event)
            }));
            match outcome {
                Ok(resp) => {
                    if resp.deletes_listener() {
                        self.lock().deferred.push(Deferred::Kill { key, entry_id });
                    }
                    if resp.cancels_event() {
                        break;
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        primary = pair.primary.0,
                        secondary = pair.secondary.0,
                        "listener panicked during dispatch, treated as no-op"
                    );
                }
            }
        }

        let mut st = self.lock();
        st.depth -= 1;
        if st.depth == 0 {
            st.apply_deferred();
        }
    }
}

impl DispatchState {
    fn insert_entry(&mut self, key: ListenerKey, order: EventOrder, entry: Entry) {
        if let Some(sub) = entry.sub {
            self.remove_subscription(&sub);
            self.by_subscription.insert(sub, (key, entry.id));
        }
        let pb = self.listeners.entry(key.primary).or_default();
        let bands = match key.secondary {
            Some(s) => pb.specific.entry(s).or_default(),
            None => &mut pb.generic,
        };
        bands.0[order.index()].push(entry);
    }

    fn remove_subscription(&mut self, id: &SubscriptionId) -> bool {
        let Some((key, entry_id)) = self.by_subscription.remove(id) else {
            return false;
        };
        self.remove_entry(&key, entry_id);
        true
    }

    fn remove_entry(&mut self, key: &ListenerKey, entry_id: u64) {
        let mut removed_sub = None;
        let mut primary_empty = false;
        if let Some(pb) = self.listeners.get_mut(&key.primary) {
            match key.secondary {
                Some(s) => {
                    let mut bucket_empty = false;
                    if let Some(bands) = pb.specific.get_mut(&s) {
                        removed_sub = take_entry(bands, entry_id);
                        bucket_empty = bands.is_empty();
                    }
                    if bucket_empty {
                        pb.specific.remove(&s);
                    }
                }
                None => {
                    removed_sub = take_entry(&mut pb.generic, entry_id);
                }
            }
            primary_empty = pb.generic.is_empty() && pb.specific.is_empty();
        }
        if primary_empty {
            self.listeners.remove(&key.primary);
        }
        if let Some(sub) = removed_sub {
            self.by_subscription.remove(&sub);
        }
    }

    /// Drop a whole bucket at once. Returns the number of listeners it held.
    fn remove_bucket(&mut self, key: &ListenerKey) -> usize {
        let mut dropped: Vec<Entry> = Vec::new();
        let mut primary_empty = false;
        if let Some(pb) = self.listeners.get_mut(&key.primary) {
            match key.secondary {
                Some(s) => {
                    if let Some(bands) = pb.specific.remove(&s) {
                        dropped = bands.0.into_iter().flatten().collect();
                    }
                }
                None => {
                    let bands = std::mem::take(&mut pb.generic);
                    dropped = bands.0.into_iter().flatten().collect();
                }
            }
            primary_empty = pb.generic.is_empty() && pb.specific.is_empty();
        }
        if primary_empty {
            self.listeners.remove(&key.primary);
        }
        for e in &dropped {
            if let Some(sub) = e.sub {
                self.by_subscription.remove(&sub);
            }
        }
        dropped.len()
    }

    fn apply_deferred(&mut self) {
        let ops = std::mem::take(&mut self.deferred);
        for op in ops {
            match op {
                Deferred::Subscribe { key, order, entry } => self.insert_entry(key, order, entry),
                Deferred::Unsubscribe(id) => {
                    self.remove_subscription(&id);
                }
                Deferred::Kill { key, entry_id } => self.remove_entry(&key, entry_id),
            }
        }
    }
}

fn take_entry(bands: &mut Bands, entry_id: u64) -> Option<SubscriptionId> {
    for band in bands.0.iter_mut() {
        if let Some(pos) = band.iter().position(|e| e.id == entry_id) {
            return band.remove(pos).sub;
        }
    }
    None
}
