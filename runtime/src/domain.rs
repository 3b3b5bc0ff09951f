//! An auto-advancing virtual time domain.
//!
//! The domain owns a [VirtualClock] and decides when it may move. Every change funnels through
//! [TimeDomain::try_advance_virtual_time], which clamps the request to the fence (if any) and
//! refuses to move backwards. Two drivers call it:
//!
//! - [TimeDomain::maybe_fast_forward_to_wake_up], invoked by the host at the point it would
//!   otherwise block waiting for its next delayed task.
//! - The [TaskObserver] the domain registers with its host, which forces a jump to the next
//!   wake-up once `max_starvation` tasks have run without one (otherwise an endless stream of
//!   immediate work would keep the host from ever going idle). The observer lives outside the
//!   domain's `RefCell`: it queries the host while the domain is not borrowed, so a host may read
//!   the domain from [Scheduler::next_wake_up].
//!
//! # Ownership
//!
//! A [TimeDomain] holds an `Rc` to its host and is therefore `!Send`: it never leaves the thread
//! that attached it, and all mutation goes through `&mut self`. Other threads read the timeline
//! through the [VirtualClock] returned by [TimeDomain::clock].
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use warptime_runtime::{domain::Config, mocks, Clock, Scheduler, TimeDomain, VirtualInstant};
//!
//! let scheduler = mocks::Scheduler::new();
//! let domain = TimeDomain::attach(Config::default(), scheduler.clone(), &mut Registry::default())
//!     .unwrap();
//!
//! // Nothing is due, so there is nothing to skip to
//! assert!(!domain.borrow_mut().maybe_fast_forward_to_wake_up(None, false));
//!
//! // Skip straight to the next timer instead of waiting for it
//! scheduler.set_next_wake_up(Some(VirtualInstant::from_secs(60)));
//! let next = scheduler.next_wake_up();
//! assert!(domain.borrow_mut().maybe_fast_forward_to_wake_up(next, false));
//! assert_eq!(domain.borrow().now(), VirtualInstant::from_secs(60));
//! ```

use crate::{
    fence::FenceController,
    source::{self, OverrideGuard},
    Clock, Error, ObserverId, Scheduler, Stall, SystemTimeExt, TaskInfo, TaskObserver,
    VirtualClock, VirtualInstant, WakeUp,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, trace, warn};

/// Prefix for domain metrics.
const METRICS_PREFIX: &str = "virtual_time";

/// Configuration for a [TimeDomain].
#[derive(Clone, Debug)]
pub struct Config {
    /// Wall-clock time that corresponds to `initial_ticks`.
    pub initial_date: SystemTime,

    /// Virtual instant the clock starts at.
    pub initial_ticks: VirtualInstant,

    /// Whether the host may fast-forward to its next wake-up when idle.
    pub auto_advance: bool,

    /// Number of tasks that may run without virtual time advancing before a jump to the next
    /// wake-up is forced. Zero disables forcing.
    pub max_starvation: usize,

    /// Initial fence (inclusive upper bound on the clock), if any.
    pub fence: Option<VirtualInstant>,

    /// Install the domain's clock as the process-wide [crate::source] override while attached.
    pub override_time_source: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_date: UNIX_EPOCH,
            initial_ticks: VirtualInstant::ZERO,
            auto_advance: true,
            max_starvation: 0,
            fence: None,
            override_time_source: false,
        }
    }
}

impl Config {
    /// Ensure the configuration describes a reachable timeline.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(fence) = self.fence {
            if fence < self.initial_ticks {
                return Err(Error::FenceBeforeOrigin(fence, self.initial_ticks));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Metrics {
    advances: Counter,
    clamps: Counter,
    catch_ups: Counter,
    forced_advances: Counter,
    fast_forwards: Counter,
    now: Gauge,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            advances: Counter::default(),
            clamps: Counter::default(),
            catch_ups: Counter::default(),
            forced_advances: Counter::default(),
            fast_forwards: Counter::default(),
            now: Gauge::default(),
        };
        registry.register(
            "advances",
            "Number of times virtual time moved forward",
            metrics.advances.clone(),
        );
        registry.register(
            "clamps",
            "Number of advance requests limited by the fence",
            metrics.clamps.clone(),
        );
        registry.register(
            "catch_ups",
            "Number of deferred advances released by a fence change",
            metrics.catch_ups.clone(),
        );
        registry.register(
            "forced_advances",
            "Number of advances forced to prevent delayed task starvation",
            metrics.forced_advances.clone(),
        );
        registry.register(
            "fast_forwards",
            "Number of advances to the next wake-up performed instead of idling",
            metrics.fast_forwards.clone(),
        );
        registry.register(
            "now_ms",
            "Current virtual time in milliseconds",
            metrics.now.clone(),
        );
        metrics
    }

    fn observe(&self, now: VirtualInstant) {
        self.now.set(now.as_millis().min(i64::MAX as u64) as i64);
    }

    fn record(&self, now: VirtualInstant) {
        self.advances.inc();
        self.observe(now);
    }
}

/// A virtual timeline attached to a host [Scheduler].
pub struct TimeDomain<S: Scheduler> {
    clock: VirtualClock,
    fence: FenceController,

    auto_advance: bool,
    max_starvation: usize,
    starvation: usize,

    scheduler: Rc<S>,
    guard: Option<Rc<RefCell<StarvationGuard<S>>>>,
    registration: Option<ObserverId>,
    time_override: Option<OverrideGuard>,

    metrics: Metrics,
}

/// Task observer registered with the host on behalf of a [TimeDomain].
struct StarvationGuard<S: Scheduler> {
    domain: Weak<RefCell<TimeDomain<S>>>,
    scheduler: Rc<S>,
}

impl<S: Scheduler> TaskObserver for StarvationGuard<S> {
    fn will_run(&mut self, _task: TaskInfo<'_>) {}

    fn did_run(&mut self, task: TaskInfo<'_>) {
        let Some(domain) = self.domain.upgrade() else {
            return;
        };
        if !domain.borrow_mut().starved() {
            return;
        }

        // The domain is not borrowed while the host answers
        let wake_up = self.scheduler.next_wake_up();
        domain.borrow_mut().force_advance(wake_up, task);
    }
}

impl<S: Scheduler + 'static> TimeDomain<S> {
    /// Create a domain and register it as a task observer of `scheduler`.
    ///
    /// The domain stays registered until [TimeDomain::detach] is called or it is dropped.
    pub fn attach(
        cfg: Config,
        scheduler: Rc<S>,
        registry: &mut Registry,
    ) -> Result<Rc<RefCell<Self>>, Error> {
        cfg.validate()?;

        // Install the clock as the ambient time source before anything can observe it
        let clock = VirtualClock::new(cfg.initial_date, cfg.initial_ticks);
        let time_override = if cfg.override_time_source {
            Some(source::install(Arc::new(clock.clone()))?)
        } else {
            None
        };

        // Initialize domain
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));
        metrics.observe(cfg.initial_ticks);
        let domain = Rc::new(RefCell::new(Self {
            clock,
            fence: FenceController::new(cfg.fence),
            auto_advance: cfg.auto_advance,
            max_starvation: cfg.max_starvation,
            starvation: 0,
            scheduler: scheduler.clone(),
            guard: None,
            registration: None,
            time_override,
            metrics,
        }));

        // Register for task notifications
        let guard = Rc::new(RefCell::new(StarvationGuard {
            domain: Rc::downgrade(&domain),
            scheduler: scheduler.clone(),
        }));
        let observer: Weak<RefCell<dyn TaskObserver>> = Rc::downgrade(&guard) as Weak<RefCell<dyn TaskObserver>>;
        let id = scheduler.add_task_observer(observer);
        {
            let mut domain = domain.borrow_mut();
            domain.guard = Some(guard);
            domain.registration = Some(id);
        }
        debug!(
            now = cfg.initial_ticks.as_millis(),
            date = cfg.initial_date.epoch_millis(),
            auto_advance = cfg.auto_advance,
            max_starvation = cfg.max_starvation,
            "attached virtual time domain"
        );
        Ok(domain)
    }
}

impl<S: Scheduler> TimeDomain<S> {
    /// Name of the domain (for diagnostics).
    pub fn name(&self) -> &'static str {
        "AutoAdvancingVirtualTimeDomain"
    }

    /// Returns a handle other threads may use to read the timeline.
    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    /// Returns whether the domain is still registered with its host.
    pub fn is_attached(&self) -> bool {
        self.registration.is_some()
    }

    /// Unregister from the host and remove the time source override (if installed).
    ///
    /// The clock remains readable. Calling this more than once is a no-op.
    pub fn detach(&mut self) {
        if let Some(id) = self.registration.take() {
            self.scheduler.remove_task_observer(id);
            debug!(now = self.clock.now().as_millis(), "detached virtual time domain");
        }
        self.guard.take();
        self.time_override.take();
    }

    /// The active fence, if any.
    pub fn fence(&self) -> Option<VirtualInstant> {
        self.fence.fence()
    }

    /// The most recent request deferred by the fence, if it has not been superseded.
    pub fn pending_advance(&self) -> Option<VirtualInstant> {
        self.fence.pending()
    }

    /// Tasks run since the last successful forced (or fast-forward) advance.
    pub fn starvation_count(&self) -> usize {
        self.starvation
    }

    /// Threshold at which an advance is forced (zero when disabled).
    pub fn max_starvation(&self) -> usize {
        self.max_starvation
    }

    /// Whether [TimeDomain::maybe_fast_forward_to_wake_up] may move the clock.
    pub fn auto_advance_enabled(&self) -> bool {
        self.auto_advance
    }

    /// Allow or forbid fast-forwarding to the next wake-up.
    ///
    /// Fence and starvation state are kept, so re-enabling resumes where it left off.
    pub fn enable_auto_advance(&mut self, enabled: bool) {
        self.auto_advance = enabled;
        debug!(enabled, "set auto-advance");
    }

    /// Set the number of tasks that may run before an advance is forced (zero disables).
    pub fn set_max_starvation(&mut self, max: usize) {
        self.max_starvation = max;
        if max == 0 {
            self.starvation = 0;
        }
        debug!(max, "set max starvation");
    }

    /// Replace the fence.
    ///
    /// If an earlier request was deferred by the old fence, it is retried immediately against
    /// the new one (so raising or clearing the fence releases the held-back time).
    pub fn set_fence(&mut self, fence: Option<VirtualInstant>) {
        let now = self.clock.now();
        if let Some(fence) = fence {
            if fence < now {
                warn!(
                    fence = fence.as_millis(),
                    now = now.as_millis(),
                    "fence is behind current virtual time"
                );
            }
        }
        debug!(fence = ?fence.map(|fence| fence.as_millis()), "set virtual time fence");
        let Some(pending) = self.fence.replace(fence) else {
            return;
        };
        if let Ok(to) = self.try_advance_virtual_time(pending) {
            self.metrics.catch_ups.inc();
            debug!(
                to = to.as_millis(),
                pending = ?self.fence.pending().map(|pending| pending.as_millis()),
                "caught up to deferred advance"
            );
        }
    }

    /// Move the clock towards `requested`, clamped to the fence.
    ///
    /// Returns the new instant, or why the clock did not move.
    pub fn try_advance_virtual_time(
        &mut self,
        requested: VirtualInstant,
    ) -> Result<VirtualInstant, Stall> {
        // The fence is applied before the monotonicity check
        let (effective, clamped) = self.fence.clamp(requested);
        if clamped {
            self.metrics.clamps.inc();
        }
        let now = self.clock.now();
        if effective <= now {
            let stall = if clamped && requested > now {
                Stall::Fenced
            } else {
                Stall::NotAfterNow
            };
            trace!(
                requested = requested.as_millis(),
                now = now.as_millis(),
                ?stall,
                "virtual time unchanged"
            );
            return Err(stall);
        }

        // Every instant the clock holds must map onto the wall clock
        if self.clock.checked_date_of(effective).is_none() {
            warn!(
                requested = requested.as_millis(),
                now = now.as_millis(),
                "virtual date not representable"
            );
            return Err(Stall::Overflow);
        }

        // Advance
        self.clock.set(effective);
        self.metrics.record(effective);
        debug!(
            from = now.as_millis(),
            to = effective.as_millis(),
            clamped,
            "advanced virtual time"
        );
        Ok(effective)
    }

    /// Move the clock towards `requested`, returning whether it changed.
    pub fn maybe_advance_virtual_time(&mut self, requested: VirtualInstant) -> bool {
        self.try_advance_virtual_time(requested).is_ok()
    }

    /// Jump to `wake_up` instead of idling until it.
    ///
    /// `quit_when_idle` is accepted for hosts that track it but does not affect the outcome.
    pub fn try_fast_forward_to_wake_up(
        &mut self,
        wake_up: Option<WakeUp>,
        _quit_when_idle: bool,
    ) -> Result<VirtualInstant, Stall> {
        if !self.auto_advance {
            return Err(Stall::Disabled);
        }
        let Some(wake_up) = wake_up else {
            return Err(Stall::Unbounded);
        };
        let now = self.try_advance_virtual_time(wake_up.time)?;
        self.starvation = 0;
        self.metrics.fast_forwards.inc();
        Ok(now)
    }

    /// Jump to `wake_up` instead of idling until it, returning whether the clock changed.
    ///
    /// A `true` return means work is now due: the host should poll again rather than block.
    pub fn maybe_fast_forward_to_wake_up(
        &mut self,
        wake_up: Option<WakeUp>,
        quit_when_idle: bool,
    ) -> bool {
        self.try_fast_forward_to_wake_up(wake_up, quit_when_idle)
            .is_ok()
    }
}

impl<S: Scheduler> Clock for TimeDomain<S> {
    fn now(&self) -> VirtualInstant {
        self.clock.now()
    }

    fn date(&self) -> SystemTime {
        self.clock.date()
    }
}

impl<S: Scheduler> TimeDomain<S> {
    /// Count a task that just ran, returning whether an advance should be forced.
    fn starved(&mut self) -> bool {
        if self.max_starvation == 0 {
            return false;
        }
        self.starvation = self.starvation.saturating_add(1);
        self.starvation >= self.max_starvation
    }

    /// Jump to the host's next wake-up to prevent starvation.
    ///
    /// Until an advance succeeds, every task retries.
    fn force_advance(&mut self, wake_up: Option<WakeUp>, task: TaskInfo<'_>) {
        let Some(wake_up) = wake_up else {
            trace!(task = task.id, starvation = self.starvation, "no wake-up to force");
            return;
        };
        if let Ok(to) = self.try_advance_virtual_time(wake_up.time) {
            debug!(
                task = task.id,
                label = task.label,
                starvation = self.starvation,
                to = to.as_millis(),
                "forced advance to prevent starvation"
            );
            self.starvation = 0;
            self.metrics.forced_advances.inc();
        }
    }
}

impl<S: Scheduler> Drop for TimeDomain<S> {
    fn drop(&mut self) {
        self.detach();
    }
}
