//! The shared virtual clock scalar and its wall-clock mapping.

use crate::{source::TimeSource, Clock};
use std::{
    fmt,
    ops::Add,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Roughly analogous to [std::time::Instant], but on a virtual timeline.
///
/// Instants are measured from an arbitrary zero chosen by the caller and are totally ordered.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualInstant(Duration);

impl VirtualInstant {
    /// The zero of the virtual timeline.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// The latest representable instant.
    pub const MAX: Self = Self(Duration::MAX);

    /// Create an instant `offset` after zero.
    pub const fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    /// Create an instant `secs` seconds after zero.
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Create an instant `millis` milliseconds after zero.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Create an instant `nanos` nanoseconds after zero.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(Duration::from_nanos(nanos))
    }

    /// Offset of this instant from zero.
    pub const fn as_duration(&self) -> Duration {
        self.0
    }

    /// Milliseconds since zero, saturating at `u64::MAX`.
    pub fn as_millis(&self) -> u64 {
        self.0.as_millis().min(u64::MAX as u128) as u64
    }

    /// Returns `self + duration`, or `None` on overflow.
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration).map(Self)
    }

    /// Returns the time elapsed from `earlier` to `self`, or `None` if `earlier` is later.
    pub fn checked_duration_since(self, earlier: Self) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for VirtualInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs)
            .expect("overflow when adding duration to virtual instant")
    }
}

impl fmt::Debug for VirtualInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualInstant({:?})", self.0)
    }
}

struct Inner {
    now: Mutex<VirtualInstant>,
    initial_ticks: VirtualInstant,
    initial_date: SystemTime,
}

/// Cloneable, thread-safe view of a virtual timeline.
///
/// Any thread may read the clock. Only the owning [crate::TimeDomain] writes it, through the same
/// lock used for reads.
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<Inner>,
}

impl VirtualClock {
    pub(crate) fn new(initial_date: SystemTime, initial_ticks: VirtualInstant) -> Self {
        Self {
            inner: Arc::new(Inner {
                now: Mutex::new(initial_ticks),
                initial_ticks,
                initial_date,
            }),
        }
    }

    /// The virtual origin the clock started at.
    pub fn initial_ticks(&self) -> VirtualInstant {
        self.inner.initial_ticks
    }

    /// The wall-clock time that corresponds to [VirtualClock::initial_ticks].
    pub fn initial_date(&self) -> SystemTime {
        self.inner.initial_date
    }

    /// Map a virtual instant onto the wall clock, or `None` if the date is not representable.
    ///
    /// Instants before the origin map to the origin date.
    pub fn checked_date_of(&self, instant: VirtualInstant) -> Option<SystemTime> {
        let elapsed = instant.saturating_duration_since(self.inner.initial_ticks);
        self.inner.initial_date.checked_add(elapsed)
    }

    /// Map a virtual instant onto the wall clock.
    ///
    /// # Panics
    ///
    /// Panics if the date is not representable. The clock itself never reaches such an instant,
    /// so this cannot happen for [Clock::now].
    pub fn date_of(&self, instant: VirtualInstant) -> SystemTime {
        self.checked_date_of(instant)
            .expect("virtual date overflowed")
    }

    /// Move the clock to `instant`.
    ///
    /// Callers must have already checked that `instant` is after the current value.
    pub(crate) fn set(&self, instant: VirtualInstant) {
        let mut now = self.inner.now.lock().unwrap();
        debug_assert!(instant > *now, "virtual time must move forward");
        *now = instant;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> VirtualInstant {
        *self.inner.now.lock().unwrap()
    }

    fn date(&self) -> SystemTime {
        self.date_of(self.now())
    }
}

impl TimeSource for VirtualClock {
    fn current(&self) -> SystemTime {
        self.date()
    }
}
