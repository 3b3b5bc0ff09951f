//! A mock host for driving a [crate::TimeDomain] without an executor.

use crate::{
    utils::{notify_did_run, notify_will_run, Observers},
    ObserverId, TaskInfo, TaskObserver, VirtualInstant, WakeUp,
};
use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

/// Implementation of [crate::Scheduler] with a manually controlled next wake-up.
///
/// Tasks are "run" with [Scheduler::run_task], which only notifies observers.
#[derive(Default)]
pub struct Scheduler {
    wake_up: Cell<Option<WakeUp>>,
    observers: RefCell<Observers>,
    queries: Cell<usize>,
}

impl Scheduler {
    /// Create a scheduler with no pending wake-up.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Set the time reported by [crate::Scheduler::next_wake_up].
    pub fn set_next_wake_up(&self, time: Option<VirtualInstant>) {
        self.wake_up.set(time.map(WakeUp::at));
    }

    /// Number of times the next wake-up was queried.
    pub fn queries(&self) -> usize {
        self.queries.get()
    }

    /// Number of live registered observers.
    pub fn observers(&self) -> usize {
        self.observers.borrow_mut().len()
    }

    /// Notify observers that the task `id` ran.
    pub fn run_task(&self, id: u128) {
        let snapshot = self.observers.borrow().snapshot();
        let task = TaskInfo { id, label: "mock" };
        notify_will_run(&snapshot, task);
        notify_did_run(&snapshot, task);
    }
}

impl crate::Scheduler for Scheduler {
    fn next_wake_up(&self) -> Option<WakeUp> {
        self.queries.set(self.queries.get() + 1);
        self.wake_up.get()
    }

    fn add_task_observer(&self, observer: Weak<RefCell<dyn TaskObserver>>) -> ObserverId {
        self.observers.borrow_mut().add(observer)
    }

    fn remove_task_observer(&self, id: ObserverId) {
        self.observers.borrow_mut().remove(id);
    }
}
