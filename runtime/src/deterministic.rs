//! A deterministic runtime that runs tasks on an auto-advancing virtual timeline.
//!
//! Tasks are selected in a random order derived from a seed. Whenever no task is ready, the runner
//! asks its [TimeDomain] to fast-forward to the earliest sleeper instead of waiting for it, so a day
//! of timers completes in milliseconds of real time. The domain's starvation guard keeps a task
//! that never stops rescheduling itself from holding sleepers back forever.
//!
//! # Panics
//!
//! If any task panics, the runtime will panic (and shutdown). If no task is ready and virtual time
//! cannot advance (nothing is sleeping, auto-advance is disabled, or the fence was reached), the
//! runtime panics with "runtime stalled".
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use warptime_runtime::{deterministic, Clock, Runner, VirtualInstant};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let child = context.with_label("child").spawn(|context| async move {
//!         context.sleep(Duration::from_secs(3_600)).await;
//!         "hello"
//!     });
//!     assert_eq!(child.await.unwrap(), "hello");
//!     assert_eq!(context.now(), VirtualInstant::from_secs(3_600));
//!     println!("Auditor state: {}", context.auditor().state());
//! });
//! ```

use crate::{
    domain::{self, TimeDomain},
    hex,
    utils::{notify_did_run, notify_will_run, Observers},
    Clock, Handle, ObserverId, Scheduler, SystemTimeExt, TaskInfo, TaskObserver, VirtualClock,
    VirtualInstant, WakeUp,
};
use futures::task::{waker_ref, ArcWake};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use rand::{prelude::SliceRandom, rngs::StdRng, SeedableRng};
use sha2::{Digest, Sha256};
use std::{
    cell::{Cell, RefCell},
    collections::{BinaryHeap, HashMap},
    future::Future,
    mem::take,
    pin::Pin,
    rc::{Rc, Weak},
    sync::{Arc, Mutex},
    task::{self, Poll, Waker},
    time::{Duration, SystemTime},
};
use tracing::trace;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Identifier reserved for the root task.
const ROOT: u128 = 0;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    label: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
    task_polls: Family<Work, Counter>,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
            task_polls: Family::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        registry.register(
            "task_polls",
            "Total number of task polls",
            metrics.task_polls.clone(),
        );
        metrics
    }
}

/// Track the state of the runtime for determinism auditing.
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self {
            hash: Vec::new().into(),
        }
    }
}

impl Auditor {
    fn update(&self, event: &[u8], fields: &[&[u8]]) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(event);
        for field in fields {
            hasher.update(field);
        }
        *hash = hasher.finalize().to_vec();
    }

    fn spawn(&self, task: u128, label: &str) {
        self.update(b"spawn", &[&task.to_be_bytes()[..], label.as_bytes()]);
    }

    fn process_task(&self, task: u128, label: &str) {
        self.update(b"process_task", &[&task.to_be_bytes()[..], label.as_bytes()]);
    }

    fn advance(&self, now: VirtualInstant) {
        self.update(b"advance", &[&now.as_duration().as_nanos().to_be_bytes()[..]]);
    }

    /// Generate a representation of the current state of the runtime.
    ///
    /// This can be used to ensure that logic running on top
    /// of the runtime is interacting deterministically.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap().clone();
        hex(&hash)
    }
}

/// Configuration for the `deterministic` runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// If the runtime is still executing once virtual time has moved this far past its origin
    /// (i.e. a test hasn't finished), panic.
    pub timeout: Option<Duration>,

    /// Configuration of the virtual time domain driving the runtime.
    pub domain: domain::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            timeout: None,
            domain: domain::Config {
                max_starvation: 100,
                ..domain::Config::default()
            },
        }
    }
}

/// Wakes a task by pushing its identifier onto the ready queue.
struct TaskWaker {
    id: u128,
    ready: Arc<Mutex<Vec<u128>>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.lock().unwrap().push(arc_self.id);
    }
}

struct Task {
    label: String,
    future: Pin<Box<dyn Future<Output = ()>>>,
    waker: Arc<TaskWaker>,
}

struct Alarm {
    time: VirtualInstant,
    waker: Waker,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time.eq(&other.time)
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap
        other.time.cmp(&self.time)
    }
}

/// Run queue, sleepers, and observers of the `deterministic` runtime.
struct Executor {
    counter: Cell<u128>,
    tasks: RefCell<HashMap<u128, Task>>,
    ready: Arc<Mutex<Vec<u128>>>,
    sleeping: RefCell<BinaryHeap<Alarm>>,
    observers: RefCell<Observers>,
    rng: RefCell<StdRng>,
    metrics: Metrics,
    auditor: Arc<Auditor>,
}

impl Executor {
    fn new(seed: u64, registry: &mut Registry) -> Self {
        Self {
            counter: Cell::new(ROOT + 1),
            tasks: RefCell::new(HashMap::new()),
            ready: Arc::new(Mutex::new(vec![ROOT])),
            sleeping: RefCell::new(BinaryHeap::new()),
            observers: RefCell::new(Observers::default()),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            metrics: Metrics::init(registry),
            auditor: Arc::new(Auditor::default()),
        }
    }

    fn register(&self, label: &str, future: Pin<Box<dyn Future<Output = ()>>>) {
        let id = self.counter.get();
        self.counter
            .set(id.checked_add(1).expect("task counter overflow"));
        let waker = Arc::new(TaskWaker {
            id,
            ready: self.ready.clone(),
        });
        self.tasks.borrow_mut().insert(
            id,
            Task {
                label: label.to_string(),
                future,
                waker,
            },
        );
        self.ready.lock().unwrap().push(id);
        self.auditor.spawn(id, label);
        trace!(id, label, "spawned task");
    }

    fn drain(&self) -> Vec<u128> {
        take(&mut *self.ready.lock().unwrap())
    }

    fn is_idle(&self) -> bool {
        self.ready.lock().unwrap().is_empty()
    }

    fn observers(&self) -> Vec<Rc<RefCell<dyn TaskObserver>>> {
        self.observers.borrow().snapshot()
    }

    /// Wake all sleepers due at or before `now`.
    fn wake_due(&self, now: VirtualInstant) {
        let mut to_wake = Vec::new();
        {
            let mut sleeping = self.sleeping.borrow_mut();
            while let Some(next) = sleeping.peek() {
                if next.time > now {
                    break;
                }
                if let Some(alarm) = sleeping.pop() {
                    to_wake.push(alarm.waker);
                }
            }
        }
        for waker in to_wake {
            waker.wake();
        }
    }

    /// Poll a task once, notifying observers around it.
    fn run<F>(&self, id: u128, label: &str, waker: &Arc<TaskWaker>, future: Pin<&mut F>) -> Poll<F::Output>
    where
        F: Future + ?Sized,
    {
        let info = TaskInfo { id, label };
        let observers = self.observers();
        notify_will_run(&observers, info);

        // Record task for auditing
        self.auditor.process_task(id, label);
        self.metrics
            .task_polls
            .get_or_create(&Work {
                label: label.to_string(),
            })
            .inc();
        trace!(id, "processing task");

        // Task is re-queued in its `wake_by_ref` implementation
        let waker = waker_ref(waker);
        let mut cx = task::Context::from_waker(&waker);
        let result = future.poll(&mut cx);
        notify_did_run(&observers, info);
        result
    }
}

impl Scheduler for Executor {
    fn next_wake_up(&self) -> Option<WakeUp> {
        self.sleeping
            .borrow()
            .peek()
            .map(|alarm| WakeUp::at(alarm.time))
    }

    fn add_task_observer(&self, observer: Weak<RefCell<dyn TaskObserver>>) -> ObserverId {
        self.observers.borrow_mut().add(observer)
    }

    fn remove_task_observer(&self, id: ObserverId) {
        self.observers.borrow_mut().remove(id);
    }
}

/// Implementation of [crate::Runner] for the `deterministic` runtime.
pub struct Runner {
    cfg: Config,
}

impl Runner {
    /// Initialize a new `deterministic` runtime with the given configuration.
    pub fn new(cfg: Config) -> Self {
        // Ensure config is valid
        if let Err(err) = cfg.domain.validate() {
            panic!("invalid domain configuration: {}", err);
        }
        if cfg.timeout == Some(Duration::ZERO) {
            panic!("timeout must be non-zero");
        }
        Self { cfg }
    }

    /// Initialize a new `deterministic` runtime with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(Config {
            seed,
            ..Config::default()
        })
    }

    /// Initialize a new `deterministic` runtime with the default configuration
    /// but exit after the given timeout.
    pub fn timed(timeout: Duration) -> Self {
        Self::new(Config {
            timeout: Some(timeout),
            ..Config::default()
        })
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl crate::Runner for Runner {
    type Context = Context;

    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future,
    {
        // Initialize runtime
        let mut registry = Registry::default();
        let runtime_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);
        let executor = Rc::new(Executor::new(self.cfg.seed, runtime_registry));
        let domain = TimeDomain::attach(self.cfg.domain.clone(), executor.clone(), runtime_registry)
            .unwrap_or_else(|err| panic!("failed to attach time domain: {}", err));
        let clock = domain.borrow().clock();
        let deadline = self.cfg.timeout.map(|timeout| {
            clock
                .initial_ticks()
                .checked_add(timeout)
                .expect("timeout overflowed")
        });
        let context = Context {
            label: String::new(),
            executor: executor.clone(),
            domain: domain.clone(),
            clock: clock.clone(),
            registry: Rc::new(RefCell::new(registry)),
        };

        // Pin root task to the heap
        let mut root = Box::pin(f(context));
        let root_waker = Arc::new(TaskWaker {
            id: ROOT,
            ready: executor.ready.clone(),
        });

        // Process tasks until root task completes or progress stalls
        let mut last = clock.now();
        let mut iter: u64 = 0;
        let output = 'run: loop {
            // Ensure we have not exceeded our deadline
            if let Some(deadline) = deadline {
                if clock.now() >= deadline {
                    panic!("runtime timeout");
                }
            }

            // Snapshot available tasks (a task woken many times runs once)
            let mut tasks = executor.drain();
            tasks.sort_unstable();
            tasks.dedup();
            tasks.shuffle(&mut *executor.rng.borrow_mut());

            // Run all snapshotted tasks
            trace!(iter, tasks = tasks.len(), "starting loop");
            for id in tasks {
                if id == ROOT {
                    if let Poll::Ready(output) = executor.run(ROOT, "", &root_waker, root.as_mut()) {
                        trace!(id, "task is complete");
                        break 'run output;
                    }
                    trace!(id, "task is still pending");
                    continue;
                }

                // Take the task out while polling so it can spawn others
                let task = executor.tasks.borrow_mut().remove(&id);
                let Some(mut task) = task else {
                    // Already completed
                    continue;
                };
                if executor
                    .run(id, &task.label, &task.waker, task.future.as_mut())
                    .is_pending()
                {
                    trace!(id, "task is still pending");
                    executor.tasks.borrow_mut().insert(id, task);
                    continue;
                }
                trace!(id, "task is complete");
            }

            // Wake sleepers that became due (including via forced advances)
            let now = clock.now();
            if now != last {
                executor.auditor.advance(now);
                last = now;
            }
            executor.wake_due(now);

            // Skip time if there is nothing to do
            if executor.is_idle() {
                let wake_up = executor.next_wake_up();
                if !domain
                    .borrow_mut()
                    .maybe_fast_forward_to_wake_up(wake_up, false)
                {
                    panic!("runtime stalled");
                }
                let now = clock.now();
                trace!(
                    now = now.as_millis(),
                    date = clock.date().epoch_millis(),
                    "time skipped"
                );
                executor.auditor.advance(now);
                last = now;
                executor.wake_due(now);
            }
            iter += 1;
        };

        // Cancel all remaining tasks
        drop(root);
        let remaining = take(&mut *executor.tasks.borrow_mut());
        drop(remaining);
        executor.sleeping.borrow_mut().clear();
        domain.borrow_mut().detach();
        output
    }
}

/// Implementation of [crate::Clock] and task spawning for the `deterministic` runtime.
///
/// A context is bound to the thread running [Runner::start] and cannot be sent elsewhere. Use
/// [Context::clock] to read the timeline from other threads.
#[derive(Clone)]
pub struct Context {
    label: String,
    executor: Rc<Executor>,
    domain: Rc<RefCell<TimeDomain<Executor>>>,
    clock: VirtualClock,
    registry: Rc<RefCell<Registry>>,
}

impl Context {
    /// Return a context whose spawned tasks carry `label` (nested under the current label).
    pub fn with_label(&self, label: &str) -> Self {
        let label = if self.label.is_empty() {
            label.to_string()
        } else {
            format!("{}_{}", self.label, label)
        };
        Self {
            label,
            ..self.clone()
        }
    }

    /// The label of this context.
    pub fn label(&self) -> String {
        self.label.clone()
    }

    /// Spawn a task with the current context.
    ///
    /// The task starts running even if the returned [Handle] is never awaited.
    pub fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        // Get metrics
        let label = self.label.clone();
        let work = Work {
            label: label.clone(),
        };
        self.executor
            .metrics
            .tasks_spawned
            .get_or_create(&work)
            .inc();
        let gauge = self
            .executor
            .metrics
            .tasks_running
            .get_or_create(&work)
            .clone();

        // Set up the task
        let executor = self.executor.clone();
        let future = f(self);
        let (future, handle) = Handle::init(future, gauge);

        // Spawn the task
        executor.register(&label, Box::pin(future));
        handle
    }

    /// Sleep for the given duration of virtual time.
    pub fn sleep(&self, duration: Duration) -> Sleeper {
        let deadline = self
            .clock
            .now()
            .checked_add(duration)
            .expect("overflow when setting wake time");
        self.sleep_until(deadline)
    }

    /// Sleep until the given virtual instant.
    pub fn sleep_until(&self, deadline: VirtualInstant) -> Sleeper {
        Sleeper {
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            time: deadline,
            registered: false,
        }
    }

    /// Returns a handle other threads may use to read the timeline.
    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    /// Explicitly move virtual time towards `target` (clamped to the fence).
    pub fn advance_to(&self, target: VirtualInstant) -> bool {
        self.domain.borrow_mut().maybe_advance_virtual_time(target)
    }

    /// See [TimeDomain::set_fence].
    pub fn set_fence(&self, fence: Option<VirtualInstant>) {
        self.domain.borrow_mut().set_fence(fence);
    }

    /// See [TimeDomain::enable_auto_advance].
    pub fn enable_auto_advance(&self, enabled: bool) {
        self.domain.borrow_mut().enable_auto_advance(enabled);
    }

    /// See [TimeDomain::set_max_starvation].
    pub fn set_max_starvation(&self, max: usize) {
        self.domain.borrow_mut().set_max_starvation(max);
    }

    /// The active fence, if any.
    pub fn fence(&self) -> Option<VirtualInstant> {
        self.domain.borrow().fence()
    }

    /// The most recent request deferred by the fence, if any.
    pub fn pending_advance(&self) -> Option<VirtualInstant> {
        self.domain.borrow().pending_advance()
    }

    /// Tasks run since virtual time last advanced to a wake-up.
    pub fn starvation_count(&self) -> usize {
        self.domain.borrow().starvation_count()
    }

    /// The auditor tracking this runtime.
    pub fn auditor(&self) -> Arc<Auditor> {
        self.executor.auditor.clone()
    }

    /// Encode all runtime metrics in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry.borrow()).expect("encoding failed");
        buffer
    }
}

impl Clock for Context {
    fn now(&self) -> VirtualInstant {
        self.clock.now()
    }

    fn date(&self) -> SystemTime {
        self.clock.date()
    }
}

/// Future that resolves once virtual time reaches its deadline.
pub struct Sleeper {
    executor: Rc<Executor>,
    clock: VirtualClock,
    time: VirtualInstant,
    registered: bool,
}

impl Future for Sleeper {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        if self.clock.now() >= self.time {
            return Poll::Ready(());
        }
        if !self.registered {
            self.registered = true;
            self.executor.sleeping.borrow_mut().push(Alarm {
                time: self.time,
                waker: cx.waker().clone(),
            });
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reschedule, source, Error, Runner as _};
    use futures::{channel::oneshot, stream::FuturesUnordered, task::noop_waker, StreamExt};
    use std::{rc::Rc, time::UNIX_EPOCH};
    use warptime_macros::test_traced;

    async fn task(i: usize) -> usize {
        for _ in 0..5 {
            reschedule().await;
        }
        i
    }

    fn run_with_seed(seed: u64) -> (String, Vec<usize>) {
        Runner::seeded(seed).start(|context| async move {
            // Randomly schedule tasks
            let mut handles = FuturesUnordered::new();
            for i in 0..5 {
                handles.push(context.clone().spawn(move |_| task(i)));
            }

            // Collect output order
            let mut outputs = Vec::new();
            while let Some(result) = handles.next().await {
                outputs.push(result.unwrap());
            }
            (context.auditor().state(), outputs)
        })
    }

    #[test]
    fn test_same_seed_same_order() {
        // Generate initial outputs
        let mut outputs = Vec::new();
        for seed in 0..100 {
            let output = run_with_seed(seed);
            assert_eq!(output.1.len(), 5);
            outputs.push(output);
        }

        // Ensure they match
        for seed in 0..100 {
            let output = run_with_seed(seed);
            assert_eq!(output, outputs[seed as usize]);
        }
    }

    #[test_traced("TRACE")]
    fn test_different_seeds_different_order() {
        let output1 = run_with_seed(12345);
        let output2 = run_with_seed(54321);
        assert_ne!(output1, output2);
    }

    #[test]
    fn test_alarm_min_heap() {
        // Populate heap
        let now = VirtualInstant::from_secs(100);
        let alarms = vec![
            Alarm {
                time: now + Duration::new(10, 0),
                waker: noop_waker(),
            },
            Alarm {
                time: now + Duration::new(5, 0),
                waker: noop_waker(),
            },
            Alarm {
                time: now + Duration::new(15, 0),
                waker: noop_waker(),
            },
            Alarm {
                time: now + Duration::new(5, 0),
                waker: noop_waker(),
            },
        ];
        let mut heap = BinaryHeap::new();
        for alarm in alarms {
            heap.push(alarm);
        }

        // Verify min-heap
        let mut sorted_times = Vec::new();
        while let Some(alarm) = heap.pop() {
            sorted_times.push(alarm.time);
        }
        assert_eq!(
            sorted_times,
            vec![
                now + Duration::new(5, 0),
                now + Duration::new(5, 0),
                now + Duration::new(10, 0),
                now + Duration::new(15, 0),
            ]
        );
    }

    #[test]
    fn test_day_of_timers() {
        let initial_date = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let runner = Runner::new(Config {
            domain: domain::Config {
                initial_date,
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            for _ in 0..1_440 {
                context.sleep(Duration::from_secs(60)).await;
            }
            assert_eq!(context.now(), VirtualInstant::from_secs(86_400));
            assert_eq!(context.date(), initial_date + Duration::from_secs(86_400));
        });
    }

    #[test_traced]
    fn test_sleepers_wake_in_order() {
        Runner::default().start(|context| async move {
            let woken = Rc::new(RefCell::new(Vec::new()));
            let mut handles = Vec::new();
            for secs in [30, 10, 20, 10] {
                let woken = woken.clone();
                handles.push(context.clone().spawn(move |context| async move {
                    context.sleep(Duration::from_secs(secs)).await;
                    woken.borrow_mut().push((secs, context.now()));
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            let woken = woken.borrow();
            let times = woken.iter().map(|(secs, _)| *secs).collect::<Vec<_>>();
            assert_eq!(times, vec![10, 10, 20, 30]);
            for (secs, now) in woken.iter() {
                assert_eq!(*now, VirtualInstant::from_secs(*secs));
            }
        });
    }

    #[test]
    fn test_sleep_until_past_is_ready() {
        Runner::default().start(|context| async move {
            context.sleep(Duration::from_secs(5)).await;
            context.sleep_until(VirtualInstant::from_secs(1)).await;
            context.sleep(Duration::ZERO).await;
            assert_eq!(context.now(), VirtualInstant::from_secs(5));
        });
    }

    #[test_traced]
    fn test_starvation_guard_releases_sleepers() {
        let runner = Runner::new(Config {
            domain: domain::Config {
                max_starvation: 10,
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            // A task that never stops rescheduling itself
            let done = Rc::new(Cell::new(false));
            let spinner = context.clone().spawn({
                let done = done.clone();
                move |_| async move {
                    let mut spins = 0u64;
                    while !done.get() {
                        spins += 1;
                        reschedule().await;
                    }
                    spins
                }
            });

            // The sleeper still wakes
            context.sleep(Duration::from_secs(10)).await;
            assert_eq!(context.now(), VirtualInstant::from_secs(10));
            done.set(true);
            let spins = spinner.await.unwrap();
            assert!(spins > 0);
        });
    }

    #[test]
    fn test_explicit_advance_without_auto_advance() {
        let runner = Runner::new(Config {
            domain: domain::Config {
                auto_advance: false,
                max_starvation: 0,
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            // Drive time manually from another task
            let driver = context.clone().spawn(|context| async move {
                for secs in 1..=5 {
                    reschedule().await;
                    assert!(context.advance_to(VirtualInstant::from_secs(secs)));
                }
            });
            context.sleep(Duration::from_secs(3)).await;
            assert!(context.now() >= VirtualInstant::from_secs(3));
            driver.await.unwrap();
            assert_eq!(context.now(), VirtualInstant::from_secs(5));
        });
    }

    #[test]
    fn test_fence_holds_back_sleepers() {
        let runner = Runner::new(Config {
            domain: domain::Config {
                fence: Some(VirtualInstant::from_secs(5)),
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            let fired = Rc::new(Cell::new(false));
            let child = context.clone().spawn({
                let fired = fired.clone();
                move |context| async move {
                    context.sleep(Duration::from_secs(10)).await;
                    fired.set(true);
                    context.now()
                }
            });

            // Reach the fence
            context.sleep(Duration::from_secs(5)).await;
            assert_eq!(context.now(), VirtualInstant::from_secs(5));
            assert!(!fired.get());

            // Lift it
            context.set_fence(None);
            assert_eq!(child.await.unwrap(), VirtualInstant::from_secs(10));
            assert!(fired.get());
        });
    }

    #[test]
    fn test_fence_catch_up_from_task() {
        let runner = Runner::new(Config {
            domain: domain::Config {
                fence: Some(VirtualInstant::from_secs(5)),
                auto_advance: false,
                max_starvation: 0,
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            assert!(context.advance_to(VirtualInstant::from_secs(8)));
            assert_eq!(context.now(), VirtualInstant::from_secs(5));
            assert_eq!(context.pending_advance(), Some(VirtualInstant::from_secs(8)));

            context.set_fence(Some(VirtualInstant::from_secs(20)));
            assert_eq!(context.now(), VirtualInstant::from_secs(8));
            assert_eq!(context.fence(), Some(VirtualInstant::from_secs(20)));
        });
    }

    #[test]
    #[should_panic(expected = "runtime stalled")]
    fn test_fence_stall() {
        let runner = Runner::new(Config {
            domain: domain::Config {
                fence: Some(VirtualInstant::from_secs(5)),
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            context.sleep(Duration::from_secs(10)).await;
        });
    }

    #[test]
    #[should_panic(expected = "runtime stalled")]
    fn test_stalled() {
        Runner::default().start(|_| async move {
            let (_sender, receiver) = oneshot::channel::<()>();
            let _ = receiver.await;
        });
    }

    #[test]
    #[should_panic(expected = "runtime stalled")]
    fn test_disabled_auto_advance_stalls() {
        let runner = Runner::new(Config {
            domain: domain::Config {
                auto_advance: false,
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            context.sleep(Duration::from_secs(1)).await;
        });
    }

    #[test]
    #[should_panic(expected = "runtime timeout")]
    fn test_timeout() {
        Runner::timed(Duration::from_secs(10)).start(|context| async move {
            loop {
                context.sleep(Duration::from_secs(1)).await;
            }
        });
    }

    #[test]
    #[should_panic(expected = "timeout must be non-zero")]
    fn test_bad_timeout() {
        Runner::timed(Duration::ZERO);
    }

    #[test]
    #[should_panic(expected = "invalid domain configuration")]
    fn test_bad_fence() {
        Runner::new(Config {
            domain: domain::Config {
                initial_ticks: VirtualInstant::from_secs(10),
                fence: Some(VirtualInstant::from_secs(1)),
                ..domain::Config::default()
            },
            ..Config::default()
        });
    }

    #[test]
    fn test_abort() {
        Runner::default().start(|context| async move {
            let handle = context.clone().spawn(|context| async move {
                context.sleep(Duration::from_secs(86_400)).await;
            });
            reschedule().await;
            handle.abort();
            assert!(matches!(handle.await, Err(Error::Closed)));
            assert_eq!(context.now(), VirtualInstant::ZERO);
        });
    }

    #[test]
    fn test_labels() {
        Runner::default().start(|context| async move {
            let context = context.with_label("parent").with_label("child");
            assert_eq!(context.label(), "parent_child");
            context.spawn(|_| async move {}).await.unwrap();
        });
    }

    #[test]
    fn test_clock_readable_from_other_threads() {
        Runner::default().start(|context| async move {
            context.sleep(Duration::from_secs(7)).await;
            let clock = context.clock();
            let now = std::thread::spawn(move || clock.now()).join().unwrap();
            assert_eq!(now, VirtualInstant::from_secs(7));
        });
    }

    #[test]
    fn test_time_source_override() {
        let _serial = source::serial();
        let initial_date = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let runner = Runner::new(Config {
            domain: domain::Config {
                initial_date,
                override_time_source: true,
                ..domain::Config::default()
            },
            ..Config::default()
        });
        runner.start(|context| async move {
            context.sleep(Duration::from_secs(30)).await;
            assert_eq!(source::now(), initial_date + Duration::from_secs(30));
            assert_eq!(source::now(), context.date());
        });
        assert!(!source::is_overridden());
    }

    #[test]
    fn test_metrics() {
        Runner::default().start(|context| async move {
            context
                .with_label("worker")
                .spawn(|context| async move {
                    context.sleep(Duration::from_secs(1)).await;
                })
                .await
                .unwrap();
            let buffer = context.encode();
            assert!(buffer.contains("runtime_tasks_spawned_total{label=\"worker\"} 1"));
            assert!(buffer.contains("runtime_tasks_running{label=\"worker\"} 0"));
            assert!(buffer.contains("runtime_virtual_time_fast_forwards_total 1"));
            assert!(buffer.contains("runtime_virtual_time_now_ms 1000"));
        });
    }

    #[test]
    fn test_cancelled_tasks_stop_running() {
        let context = Runner::default().start(|context| async move {
            // Polled once, then left sleeping
            context.with_label("started").spawn(|context| async move {
                context.sleep(Duration::from_secs(60)).await;
            });
            context.sleep(Duration::from_secs(1)).await;

            // Never polled
            context.with_label("unstarted").spawn(|_| async move {});
            let buffer = context.encode();
            assert!(buffer.contains("runtime_tasks_running{label=\"started\"} 1"));
            assert!(buffer.contains("runtime_tasks_running{label=\"unstarted\"} 1"));
            context
        });
        let buffer = context.encode();
        assert!(buffer.contains("runtime_tasks_running{label=\"started\"} 0"));
        assert!(buffer.contains("runtime_tasks_running{label=\"unstarted\"} 0"));
    }

    #[test]
    fn test_auditor_records_time() {
        let run = |secs: u64| {
            Runner::default().start(|context| async move {
                context.sleep(Duration::from_secs(secs)).await;
                context.auditor().state()
            })
        };
        assert_eq!(run(1), run(1));
        assert_ne!(run(1), run(2));
    }
}
