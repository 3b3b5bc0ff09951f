//! Drive a [TimeDomain] from a host scheduler defined outside the crate.

use prometheus_client::registry::Registry;
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::{Rc, Weak},
    time::{Duration, UNIX_EPOCH},
};
use warptime_macros::test_traced;
use warptime_runtime::{
    domain::Config, notify_did_run, notify_will_run, Clock, ObserverId, Observers, Scheduler,
    TaskInfo, TaskObserver, TimeDomain, VirtualInstant, WakeUp,
};

/// A run loop of named jobs: immediate jobs run in order, delayed jobs run once due.
#[derive(Default)]
struct Loop {
    immediate: RefCell<VecDeque<&'static str>>,
    delayed: RefCell<BTreeMap<VirtualInstant, Vec<&'static str>>>,
    observers: RefCell<Observers>,
    log: RefCell<Vec<(VirtualInstant, &'static str)>>,
}

impl Loop {
    fn post(&self, job: &'static str) {
        self.immediate.borrow_mut().push_back(job);
    }

    fn post_at(&self, time: VirtualInstant, job: &'static str) {
        self.delayed.borrow_mut().entry(time).or_default().push(job);
    }

    fn promote(&self, now: VirtualInstant) {
        let mut delayed = self.delayed.borrow_mut();
        let later = delayed.split_off(&(now + Duration::from_nanos(1)));
        let due = std::mem::replace(&mut *delayed, later);
        let mut immediate = self.immediate.borrow_mut();
        for jobs in due.into_values() {
            immediate.extend(jobs);
        }
    }

    /// Run until no job is left (or the domain refuses to skip ahead).
    fn run<S: Scheduler>(&self, domain: &Rc<RefCell<TimeDomain<S>>>) {
        let mut id = 0u128;
        loop {
            let now = domain.borrow().now();
            self.promote(now);
            let next = self.immediate.borrow_mut().pop_front();
            let Some(job) = next else {
                let wake_up = self.next_wake_up();
                if !domain
                    .borrow_mut()
                    .maybe_fast_forward_to_wake_up(wake_up, false)
                {
                    return;
                }
                continue;
            };
            id += 1;
            let task = TaskInfo { id, label: job };
            let observers = self.observers.borrow().snapshot();
            notify_will_run(&observers, task);
            self.log.borrow_mut().push((now, job));
            notify_did_run(&observers, task);
        }
    }
}

impl Scheduler for Loop {
    fn next_wake_up(&self) -> Option<WakeUp> {
        self.delayed
            .borrow()
            .keys()
            .next()
            .copied()
            .map(WakeUp::at)
    }

    fn add_task_observer(&self, observer: Weak<RefCell<dyn TaskObserver>>) -> ObserverId {
        self.observers.borrow_mut().add(observer)
    }

    fn remove_task_observer(&self, id: ObserverId) {
        self.observers.borrow_mut().remove(id);
    }
}

#[test_traced]
fn test_skips_to_delayed_jobs() {
    let host = Rc::new(Loop::default());
    let domain =
        TimeDomain::attach(Config::default(), host.clone(), &mut Registry::default()).unwrap();
    host.post("a");
    host.post_at(VirtualInstant::from_secs(3_600), "c");
    host.post_at(VirtualInstant::from_secs(60), "b");

    host.run(&domain);
    assert_eq!(
        *host.log.borrow(),
        vec![
            (VirtualInstant::ZERO, "a"),
            (VirtualInstant::from_secs(60), "b"),
            (VirtualInstant::from_secs(3_600), "c"),
        ]
    );
    assert_eq!(
        domain.borrow().date(),
        UNIX_EPOCH + Duration::from_secs(3_600)
    );
}

#[test]
fn test_fence_stops_the_loop() {
    let host = Rc::new(Loop::default());
    let cfg = Config {
        fence: Some(VirtualInstant::from_secs(90)),
        ..Config::default()
    };
    let domain = TimeDomain::attach(cfg, host.clone(), &mut Registry::default()).unwrap();
    host.post_at(VirtualInstant::from_secs(60), "b");
    host.post_at(VirtualInstant::from_secs(120), "c");

    // The loop reaches the fence and gives up
    host.run(&domain);
    assert_eq!(
        *host.log.borrow(),
        vec![(VirtualInstant::from_secs(60), "b")]
    );
    assert_eq!(domain.borrow().now(), VirtualInstant::from_secs(90));
    assert_eq!(
        domain.borrow().pending_advance(),
        Some(VirtualInstant::from_secs(120))
    );

    // Raising the fence releases the deferred advance
    domain.borrow_mut().set_fence(None);
    assert_eq!(domain.borrow().now(), VirtualInstant::from_secs(120));
    host.run(&domain);
    assert_eq!(host.log.borrow().len(), 2);
}

#[test]
fn test_starvation_forces_delayed_jobs() {
    let host = Rc::new(Loop::default());
    let cfg = Config {
        auto_advance: false,
        max_starvation: 3,
        ..Config::default()
    };
    let domain = TimeDomain::attach(cfg, host.clone(), &mut Registry::default()).unwrap();
    host.post_at(VirtualInstant::from_secs(10), "delayed");
    for _ in 0..5 {
        host.post("busy");
    }

    // Time moves while busy jobs are still queued, even though the loop may not skip ahead
    host.run(&domain);
    let log = host.log.borrow();
    assert_eq!(log.len(), 6);
    assert_eq!(log[2].0, VirtualInstant::ZERO);
    assert_eq!(log[3], (VirtualInstant::from_secs(10), "busy"));
    assert_eq!(log[5], (VirtualInstant::from_secs(10), "delayed"));
    assert_eq!(domain.borrow().starvation_count(), 3);
}

#[test]
fn test_dropping_domain_unregisters() {
    let host = Rc::new(Loop::default());
    let domain =
        TimeDomain::attach(Config::default(), host.clone(), &mut Registry::default()).unwrap();
    assert_eq!(host.observers.borrow_mut().len(), 1);
    drop(domain);
    assert!(host.observers.borrow_mut().is_empty());
}

/// A host whose next wake-up is always five seconds after the domain's current time.
#[derive(Default)]
struct Relative {
    domain: RefCell<Weak<RefCell<TimeDomain<Relative>>>>,
    observers: RefCell<Observers>,
}

impl Scheduler for Relative {
    fn next_wake_up(&self) -> Option<WakeUp> {
        let domain = self.domain.borrow().upgrade()?;
        let now = domain.borrow().now();
        Some(WakeUp::at(now + Duration::from_secs(5)))
    }

    fn add_task_observer(&self, observer: Weak<RefCell<dyn TaskObserver>>) -> ObserverId {
        self.observers.borrow_mut().add(observer)
    }

    fn remove_task_observer(&self, id: ObserverId) {
        self.observers.borrow_mut().remove(id);
    }
}

#[test]
fn test_wake_up_query_may_read_domain() {
    let host = Rc::new(Relative::default());
    let cfg = Config {
        max_starvation: 1,
        ..Config::default()
    };
    let domain = TimeDomain::attach(cfg, host.clone(), &mut Registry::default()).unwrap();
    *host.domain.borrow_mut() = Rc::downgrade(&domain);

    // Each task forces an advance, querying the host while it runs
    let task = TaskInfo {
        id: 1,
        label: "relative",
    };
    for expected in [5, 10] {
        let observers = host.observers.borrow().snapshot();
        notify_will_run(&observers, task);
        notify_did_run(&observers, task);
        assert_eq!(domain.borrow().now(), VirtualInstant::from_secs(expected));
        assert_eq!(domain.borrow().starvation_count(), 0);
    }
}
