//! Monotonic time for the dispatcher and cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic instant measured from its [`TimeSource`]'s epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AbsTime(Duration);

impl AbsTime {
    pub const ZERO: AbsTime = AbsTime(Duration::ZERO);

    /// An instant no deadline ever reaches.
    pub const FAR_FUTURE: AbsTime = AbsTime(Duration::from_secs(u64::MAX));

    pub fn since_epoch(&self) -> Duration {
        self.0
    }

    /// Saturates to zero when `earlier` is actually later.
    pub fn duration_since(&self, earlier: AbsTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::ops::Add<Duration> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: Duration) -> AbsTime {
        AbsTime(self.0.saturating_add(rhs))
    }
}

/// Source of monotonic instants.
///
/// `monotonic()` tracks the wall driver; `manual()` only moves when a
/// test advances it. Both hand out [`AbsTime`] values relative to their
/// own epoch, so instants from different sources never mix meaningfully.
#[derive(Clone)]
pub struct TimeSource {
    inner: Arc<ClockInner>,
}

enum ClockInner {
    Monotonic { epoch: Instant },
    Manual { nanos: AtomicU64 },
}

impl TimeSource {
    pub fn monotonic() -> Self {
        TimeSource {
            inner: Arc::new(ClockInner::Monotonic {
                epoch: Instant::now(),
            }),
        }
    }

    /// A clock that stands still until advanced. For tests.
    pub fn manual() -> Self {
        TimeSource {
            inner: Arc::new(ClockInner::Manual {
                nanos: AtomicU64::new(0),
            }),
        }
    }

    pub fn now(&self) -> AbsTime {
        match &*self.inner {
            ClockInner::Monotonic { epoch } => AbsTime(epoch.elapsed()),
            ClockInner::Manual { nanos } => {
                AbsTime(Duration::from_nanos(nanos.load(Ordering::Acquire)))
            }
        }
    }

    /// Move a manual clock forward. Calling this on a monotonic source is
    /// a bug in the test.
    pub fn advance(&self, by: Duration) {
        match &*self.inner {
            ClockInner::Manual { nanos } => {
                nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
            }
            ClockInner::Monotonic { .. } => {
                panic!("advance() called on a monotonic time source");
            }
        }
    }
}
