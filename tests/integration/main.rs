//! End-to-end scenarios over in-memory pipes, a scripted blob fetcher,
//! and the manual clock.

mod cache;
mod dispatcher;
mod transport;

pub(crate) use veld_tests::init_tracing;
