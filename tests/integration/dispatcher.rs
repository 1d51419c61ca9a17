//! Dispatcher scenarios: re-entrant subscription changes, cancellation,
//! named replacement, and deadline pacing.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use veld_core::TimeSource;
use veld_event::{
    Event, EventDispatcher, EventOrder, EventPtr, EventResponse, IdPair, Primary, Secondary,
    SubscriptionId,
};

use crate::init_tracing;

struct WorldEvent {
    id: IdPair,
}

impl Event for WorldEvent {
    fn id(&self) -> IdPair {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn event(primary: u32, secondary: u64) -> EventPtr {
    Arc::new(WorldEvent {
        id: IdPair::new(Primary(primary), Secondary(secondary)),
    })
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recorder(log: &Log, name: &'static str) -> Box<dyn FnMut(&EventPtr) -> EventResponse + Send> {
    let log = Arc::clone(log);
    Box::new(move |_| {
        log.lock().unwrap().push(name);
        EventResponse::nop()
    })
}

#[test]
fn reentrant_unsubscribe_is_deferred_past_the_current_event() {
    // L1 (EARLY), L2 (MIDDLE), L3 (MIDDLE) listen on (1, 7). L2's
    // handler unsubscribes L3 and subscribes L4 at MIDDLE. The event in
    // flight reaches L1, L2 and L3 — L3's removal is deferred — but not
    // L4. The next event reaches L1, L2, L4 only.
    init_tracing();
    let dispatcher = EventDispatcher::new(TimeSource::manual());
    let log: Log = Default::default();
    let pair = IdPair::new(Primary(1), Secondary(7));
    let l3 = SubscriptionId::fresh();

    dispatcher.subscribe(pair, EventOrder::Early, recorder(&log, "L1"));
    {
        let log_l2 = Arc::clone(&log);
        let log_l4 = Arc::clone(&log);
        let handle = dispatcher.clone();
        dispatcher.subscribe(
            pair,
            EventOrder::Middle,
            Box::new(move |_| {
                log_l2.lock().unwrap().push("L2");
                handle.unsubscribe(l3);
                let log_l4 = Arc::clone(&log_l4);
                handle.subscribe(
                    pair,
                    EventOrder::Middle,
                    Box::new(move |_| {
                        log_l4.lock().unwrap().push("L4");
                        EventResponse::nop()
                    }),
                );
                EventResponse::nop()
            }),
        );
    }
    dispatcher.subscribe_named(pair, l3, EventOrder::Middle, recorder(&log, "L3"));

    dispatcher.fire(event(1, 7));
    dispatcher.process_all();
    assert_eq!(
        std::mem::take(&mut *log.lock().unwrap()),
        ["L1", "L2", "L3"]
    );

    dispatcher.fire(event(1, 7));
    dispatcher.process_all();
    assert_eq!(
        std::mem::take(&mut *log.lock().unwrap()),
        ["L1", "L2", "L4"]
    );
}

#[test]
fn every_live_listener_sees_the_event_unless_cancelled() {
    init_tracing();
    let dispatcher = EventDispatcher::new(TimeSource::manual());
    let log: Log = Default::default();
    let pair = IdPair::new(Primary(2), Secondary(1));

    dispatcher.subscribe(pair, EventOrder::Early, recorder(&log, "early"));
    dispatcher.subscribe(Primary(2), EventOrder::Middle, recorder(&log, "generic"));
    {
        let log = Arc::clone(&log);
        dispatcher.subscribe(
            pair,
            EventOrder::Middle,
            Box::new(move |_| {
                log.lock().unwrap().push("canceller");
                EventResponse::cancel()
            }),
        );
    }
    dispatcher.subscribe(pair, EventOrder::Late, recorder(&log, "late"));

    dispatcher.fire(event(2, 1));
    dispatcher.process_all();
    // specific runs before generic within the middle band; cancel stops
    // the generic listener and the whole late band
    assert_eq!(
        std::mem::take(&mut *log.lock().unwrap()),
        ["early", "canceller"]
    );
}

#[test]
fn named_replacement_swaps_atomically() {
    init_tracing();
    let dispatcher = EventDispatcher::new(TimeSource::manual());
    let log: Log = Default::default();
    let pair = IdPair::new(Primary(3), Secondary(9));
    let id = SubscriptionId::from_raw(0xcafe);

    dispatcher.subscribe_named(pair, id, EventOrder::Middle, recorder(&log, "first"));
    dispatcher.subscribe_named(pair, id, EventOrder::Middle, recorder(&log, "second"));

    // the prior holder is gone before any further event fires
    dispatcher.fire(event(3, 9));
    dispatcher.process_all();
    assert_eq!(std::mem::take(&mut *log.lock().unwrap()), ["second"]);
}

#[test]
fn process_deadline_paces_the_queue() {
    init_tracing();
    let clock = TimeSource::manual();
    let dispatcher = EventDispatcher::new(clock.clone());
    let pair = IdPair::new(Primary(4), Secondary(4));
    {
        let clock = clock.clone();
        dispatcher.subscribe(
            pair,
            EventOrder::Middle,
            Box::new(move |_| {
                clock.advance(Duration::from_millis(4));
                EventResponse::nop()
            }),
        );
    }

    for _ in 0..10 {
        dispatcher.fire(event(4, 4));
    }
    // a 10ms budget admits three 4ms listeners before the deadline check
    // stops the drain
    let deadline = clock.now() + Duration::from_millis(10);
    let processed = dispatcher.process(deadline);
    assert_eq!(processed, 3);
    assert_eq!(dispatcher.queued_len(), 7);
    assert_eq!(dispatcher.process_all(), 7);
}

#[test]
fn listener_failure_never_cancels_the_event() {
    init_tracing();
    let dispatcher = EventDispatcher::new(TimeSource::manual());
    let log: Log = Default::default();
    let pair = IdPair::new(Primary(5), Secondary(5));

    dispatcher.subscribe(
        pair,
        EventOrder::Early,
        Box::new(|_| panic!("deliberate listener failure")),
    );
    dispatcher.subscribe(pair, EventOrder::Late, recorder(&log, "after"));

    dispatcher.fire(event(5, 5));
    dispatcher.process_all();
    assert_eq!(std::mem::take(&mut *log.lock().unwrap()), ["after"]);
}
