pub mod dispatcher;
pub mod types;

pub use dispatcher::{EventDispatcher, ListenerFn};
pub use types::{
    Event, EventOrder, EventPtr, EventResponse, IdPair, ListenerKey, Primary, Secondary,
    SubscriptionId,
};
