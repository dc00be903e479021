//! Time abstraction for testability.
//!
//! The reactor and everything built on it measure time through a [`Clock`]
//! so that timer firing and batch-duration arithmetic can be tested
//! deterministically. In production use [`SystemClock`]; in tests use
//! [`MockClock`] and advance it by hand.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Abstraction over time.
///
/// The core is single-threaded, so clocks are shared as `Rc<dyn Clock>`.
pub trait Clock {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Returns the elapsed time since the given instant.
    fn elapsed(&self, since: Instant) -> Duration {
        self.now().saturating_duration_since(since)
    }
}

/// A shared clock handle.
pub type SharedClock = Rc<dyn Clock>;

/// System clock that uses real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A mock clock for testing time-dependent code.
///
/// The clock starts at a base instant and only moves when advanced.
#[derive(Debug)]
pub struct MockClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Creates a new mock clock starting at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    /// Creates a mock clock behind a shared handle.
    #[must_use]
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::new())
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.offset.set(self.offset.get() + duration);
    }

    /// Returns the current offset from the base time.
    #[must_use]
    pub fn offset(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

impl Clock for Rc<MockClock> {
    fn now(&self) -> Instant {
        self.as_ref().now()
    }
}
