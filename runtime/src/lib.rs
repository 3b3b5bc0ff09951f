//! Drive task schedulers with an auto-advancing virtual clock.
//!
//! A [TimeDomain] replaces the system clock for a cooperative scheduler. Instead of blocking until
//! the next timer fires, the scheduler asks the domain to fast-forward to it, which makes a day of
//! timers complete in milliseconds and makes time-dependent logic reproducible.
//!
//! # Terminology
//!
//! The host scheduler implements [Scheduler] (to answer "when is the next wake-up?" and to accept
//! observers) and calls [TaskObserver] hooks around every task it runs. The domain registers a
//! [TaskObserver] to prevent delayed work from being starved by an endless stream of immediate work.
//! The domain is never borrowed while that observer calls back into the host.
//!
//! For a complete host, see the [deterministic] module.
//!
//! # Status
//!
//! `warptime-runtime` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use std::{cell::RefCell, future::Future, rc::Weak, time::SystemTime};
use thiserror::Error;

mod clock;
pub use clock::{VirtualClock, VirtualInstant};
pub mod deterministic;
pub mod domain;
pub use domain::TimeDomain;
mod fence;
pub mod mocks;
pub mod source;
mod utils;
pub use utils::*;

/// Errors that can occur when configuring or interacting with a virtual time domain.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("time source override already installed")]
    OverrideInstalled,
    #[error("fence {0:?} is before the virtual origin {1:?}")]
    FenceBeforeOrigin(VirtualInstant, VirtualInstant),
    #[error("closed")]
    Closed,
}

/// Reasons an attempt to move virtual time did not change the clock.
///
/// None of these are failures: each is a legitimate steady state of a scheduler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    /// The (possibly clamped) target is at or behind the current instant.
    #[error("target is not after now")]
    NotAfterNow,
    /// The target was ahead of now but the fence blocked all of it.
    #[error("target is blocked by the fence")]
    Fenced,
    /// Auto-advance is disabled.
    #[error("auto-advance is disabled")]
    Disabled,
    /// There is no known wake-up to move to.
    #[error("no wake-up is scheduled")]
    Unbounded,
    /// The target has no wall-clock date (it lies beyond what [SystemTime] can represent).
    #[error("target date is not representable")]
    Overflow,
}

/// Interface that any task scheduler must implement to start running a root task.
pub trait Runner {
    /// Context defines the environment available to tasks.
    type Context;

    /// Start running a root task.
    ///
    /// When this function returns, all spawned tasks will be canceled.
    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future;
}

/// Read access to a virtual timeline.
pub trait Clock {
    /// Returns the current virtual instant.
    fn now(&self) -> VirtualInstant;

    /// Returns the wall-clock time that corresponds to [Clock::now].
    fn date(&self) -> SystemTime;
}

/// The next instant at which a delayed task becomes due.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WakeUp {
    pub time: VirtualInstant,
}

impl WakeUp {
    /// Create a wake-up due at `time`.
    pub fn at(time: VirtualInstant) -> Self {
        Self { time }
    }
}

/// Description of a task passed to [TaskObserver] hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskInfo<'a> {
    /// Identifier assigned by the host scheduler.
    pub id: u128,
    /// Label of the task (may be empty).
    pub label: &'a str,
}

/// Hooks a host scheduler invokes around every task it executes.
pub trait TaskObserver {
    /// Called immediately before a task runs.
    fn will_run(&mut self, task: TaskInfo<'_>);

    /// Called immediately after a task ran (whether or not it completed).
    fn did_run(&mut self, task: TaskInfo<'_>);
}

/// Identifier of a registered [TaskObserver].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub u64);

/// Interface a host scheduler exposes to a [TimeDomain].
///
/// All methods are invoked from the scheduler's own thread and must not block.
pub trait Scheduler {
    /// Returns the time of the next delayed task, if any.
    ///
    /// May read the attached [TimeDomain] (it is not borrowed during this call).
    fn next_wake_up(&self) -> Option<WakeUp>;

    /// Register an observer to be notified around every task.
    ///
    /// The scheduler only holds a weak reference: dropping the observer's last strong
    /// reference stops notifications.
    fn add_task_observer(&self, observer: Weak<RefCell<dyn TaskObserver>>) -> ObserverId;

    /// Unregister an observer previously returned by [Scheduler::add_task_observer].
    fn remove_task_observer(&self, id: ObserverId);
}
