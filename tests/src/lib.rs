//! Shared support for the end-to-end test suite.

use std::sync::Once;

/// Install the tracing subscriber once per test binary, honoring
/// RUST_LOG so a failing scenario can be rerun with full traces.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
