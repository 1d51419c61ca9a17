//! Event identities, ordering bands, and listener return codes.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event family — the coarse tag of an event (input, network, scene, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Primary(pub u32);

/// Subject identity within a family — typically an object or stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Secondary(pub u64);

/// The two-level key every event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdPair {
    pub primary: Primary,
    pub secondary: Secondary,
}

impl IdPair {
    pub fn new(primary: Primary, secondary: Secondary) -> Self {
        IdPair { primary, secondary }
    }
}

/// An immutable event record. Many listeners may read the same event
/// concurrently; none may mutate it, hence events travel as `Arc`s.
pub trait Event: Send + Sync {
    fn id(&self) -> IdPair;

    /// Concrete-type access for listeners that know what they subscribed
    /// to. Implementors return `self`.
    fn as_any(&self) -> &dyn Any;
}

pub type EventPtr = Arc<dyn Event>;

/// What a listener subscribed to: a full pair (specific) or a primary
/// alone (generic — fires on every secondary of that primary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub primary: Primary,
    pub secondary: Option<Secondary>,
}

impl From<IdPair> for ListenerKey {
    fn from(pair: IdPair) -> Self {
        ListenerKey {
            primary: pair.primary,
            secondary: Some(pair.secondary),
        }
    }
}

impl From<Primary> for ListenerKey {
    fn from(primary: Primary) -> Self {
        ListenerKey {
            primary,
            secondary: None,
        }
    }
}

/// Intra-event delivery band. All EARLY listeners run before any MIDDLE,
/// all MIDDLE before any LATE; insertion order within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrder {
    Early,
    Middle,
    Late,
}

pub(crate) const NUM_ORDERS: usize = 3;

impl EventOrder {
    pub(crate) fn index(self) -> usize {
        match self {
            EventOrder::Early => 0,
            EventOrder::Middle => 1,
            EventOrder::Late => 2,
        }
    }
}

/// Bitset a listener returns to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventResponse(u8);

impl EventResponse {
    const DELETE_LISTENER: u8 = 1;
    const CANCEL_EVENT: u8 = 2;

    /// Keep the listener, keep delivering the event.
    pub fn nop() -> Self {
        EventResponse(0)
    }

    /// Schedule removal of this listener.
    pub fn del() -> Self {
        EventResponse(Self::DELETE_LISTENER)
    }

    /// Stop further delivery of this event.
    pub fn cancel() -> Self {
        EventResponse(Self::CANCEL_EVENT)
    }

    pub fn cancel_and_del() -> Self {
        EventResponse(Self::DELETE_LISTENER | Self::CANCEL_EVENT)
    }

    pub fn deletes_listener(self) -> bool {
        self.0 & Self::DELETE_LISTENER != 0
    }

    pub fn cancels_event(self) -> bool {
        self.0 & Self::CANCEL_EVENT != 0
    }
}

/// Stable opaque identifier for named unsubscription and replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    /// A process-unique id.
    pub fn fresh() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }

    /// Caller-chosen id. Ids above 2^48 never collide with `fresh()` in
    /// practice; collisions simply behave as named replacement.
    pub fn from_raw(raw: u64) -> Self {
        SubscriptionId(raw)
    }
}
