//! Utility functions for hosts and tasks running on a virtual timeline.

use crate::{Error, ObserverId, TaskInfo, TaskObserver};
use futures::{
    channel::oneshot,
    stream::{AbortHandle, Abortable},
    FutureExt,
};
use prometheus_client::metrics::gauge::Gauge;
use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    sync::{Arc, Once},
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};

/// Yield control back to the runtime.
pub async fn reschedule() {
    struct Reschedule {
        yielded: bool,
    }

    impl Future for Reschedule {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    Reschedule { yielded: false }.await
}

/// Converts bytes to a hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 16] = b"0123456789abcdef";
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push(ALPHABET[(byte >> 4) as usize] as char);
        hex.push(ALPHABET[(byte & 0x0f) as usize] as char);
    }
    hex
}

/// Helpers for rendering wall-clock dates in logs.
pub trait SystemTimeExt {
    /// Milliseconds since the Unix epoch (zero for dates before it).
    fn epoch_millis(&self) -> u64;
}

impl SystemTimeExt for SystemTime {
    fn epoch_millis(&self) -> u64 {
        self.duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis().min(u64::MAX as u128) as u64)
            .unwrap_or(0)
    }
}

/// Registry of weakly-held [TaskObserver]s that a host scheduler notifies around every task.
///
/// Observers whose last strong reference was dropped are skipped and pruned lazily.
#[derive(Default)]
pub struct Observers {
    next: u64,
    registered: Vec<(ObserverId, Weak<RefCell<dyn TaskObserver>>)>,
}

impl Observers {
    /// Register an observer.
    pub fn add(&mut self, observer: Weak<RefCell<dyn TaskObserver>>) -> ObserverId {
        let id = ObserverId(self.next);
        self.next = self.next.checked_add(1).expect("observer id overflow");
        self.registered.push((id, observer));
        id
    }

    /// Unregister an observer (no-op if unknown).
    pub fn remove(&mut self, id: ObserverId) {
        self.registered.retain(|(registered, _)| *registered != id);
    }

    /// Number of registered observers that are still alive.
    pub fn len(&mut self) -> usize {
        self.registered
            .retain(|(_, observer)| observer.strong_count() > 0);
        self.registered.len()
    }

    /// Returns whether no live observer is registered.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Upgrade all live observers, in registration order.
    ///
    /// Hosts must take the snapshot (and release any borrow of the registry) before invoking
    /// hooks, since an observer may unregister itself from within a hook.
    pub fn snapshot(&self) -> Vec<Rc<RefCell<dyn TaskObserver>>> {
        self.registered
            .iter()
            .filter_map(|(_, observer)| observer.upgrade())
            .collect()
    }
}

/// Invoke [TaskObserver::will_run] on every observer in `snapshot`.
pub fn notify_will_run(snapshot: &[Rc<RefCell<dyn TaskObserver>>], task: TaskInfo<'_>) {
    for observer in snapshot {
        observer.borrow_mut().will_run(task);
    }
}

/// Invoke [TaskObserver::did_run] on every observer in `snapshot`.
pub fn notify_did_run(snapshot: &[Rc<RefCell<dyn TaskObserver>>], task: TaskInfo<'_>) {
    for observer in snapshot {
        observer.borrow_mut().did_run(task);
    }
}

/// Handle to a spawned task.
pub struct Handle<T> {
    aborter: AbortHandle,
    receiver: oneshot::Receiver<T>,

    running: Gauge,
    once: Arc<Once>,
}

/// Decrements the running gauge (at most once per task) when dropped.
struct Running {
    gauge: Gauge,
    once: Arc<Once>,
}

impl Drop for Running {
    fn drop(&mut self) {
        let gauge = &self.gauge;
        self.once.call_once(|| {
            gauge.dec();
        });
    }
}

impl<T: 'static> Handle<T> {
    pub(crate) fn init<F>(f: F, running: Gauge) -> (impl Future<Output = ()>, Self)
    where
        F: Future<Output = T> + 'static,
    {
        // Increment running counter
        running.inc();

        // Initialize channels to handle result/abort
        let once = Arc::new(Once::new());
        let (sender, receiver) = oneshot::channel();
        let (aborter, abort_registration) = AbortHandle::new_pair();

        // Wrap the future to record completion (or cancellation, if it is dropped first)
        let wrapped = {
            let guard = Running {
                gauge: running.clone(),
                once: once.clone(),
            };
            async move {
                let result = f.await;
                drop(guard);
                let _ = sender.send(result);
            }
        };

        // Make the future abortable
        let abortable = Abortable::new(wrapped, abort_registration);
        (
            abortable.map(|_| ()),
            Self {
                aborter,
                receiver,

                running,
                once,
            },
        )
    }
}

impl<T> Handle<T> {
    /// Stop the task the next time the runtime would poll it.
    pub fn abort(&self) {
        // Stop task
        self.aborter.abort();

        // Decrement running counter
        self.once.call_once(|| {
            self.running.dec();
        });
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Closed))
    }
}
