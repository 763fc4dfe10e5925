use super::entry::Pid;
use crate::error::Result;
use crate::image_set::ImageName;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A process-arrival or process-departure record as captured by the monitor,
/// before the process manager has turned it into a registry mutation.
#[derive(Debug, Clone)]
pub enum RawProcessEvent {
    Arrived {
        pid: Pid,
        parent_pid: Option<Pid>,
        image: ImageName,
    },
    Departed {
        pid: Pid,
    },
}

struct Shared {
    queue: Mutex<VecDeque<RawProcessEvent>>,
    wake: Condvar,
    dispatch_enabled: AtomicBool,
    exiting: AtomicBool,
}

/// Dispatches process-lifecycle records queued by the host to a single
/// consumer worker thread, in order.
///
/// Dispatch starts disabled: records queue up but the worker will not drain
/// them until [`ProcessMonitor::enable_dispatch`] is called, so the initial
/// bulk process-registration payload can be applied before any live event is
/// observed.
pub struct ProcessMonitor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ProcessMonitor {
    pub fn spawn(sink: impl Fn(RawProcessEvent) + Send + Sync + 'static) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            dispatch_enabled: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("splittun-procmon".into())
            .spawn(move || Self::worker_loop(worker_shared, sink))
            .expect("failed to spawn process monitor worker");

        ProcessMonitor {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues a record. Safe to call from any thread, including one invoked
    /// directly by the host's process notification callback.
    pub fn enqueue(&self, event: RawProcessEvent) {
        self.shared.queue.lock().push_back(event);
        self.shared.wake.notify_one();
    }

    /// Allows the worker to begin draining the queue.
    pub fn enable_dispatch(&self) {
        self.shared.dispatch_enabled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    fn worker_loop(shared: Arc<Shared>, sink: impl Fn(RawProcessEvent) + Send + Sync) {
        loop {
            let mut queue = shared.queue.lock();
            loop {
                if shared.exiting.load(Ordering::SeqCst) {
                    return;
                }
                if shared.dispatch_enabled.load(Ordering::SeqCst) && !queue.is_empty() {
                    break;
                }
                shared.wake.wait(&mut queue);
            }
            let drained: VecDeque<RawProcessEvent> = std::mem::take(&mut queue);
            drop(queue);

            for event in drained {
                sink(event);
            }
        }
    }

    /// Signals the worker to exit and joins it. Queued records that outlive
    /// the worker are simply dropped.
    pub fn shutdown(mut self) {
        self.shared.exiting.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// External collaborator that feeds raw process-lifecycle notifications into
/// a [`ProcessMonitor`], mirroring how `talpid-core`'s windows split-tunnel
/// module abstracts its callback registration behind an injectable handle
/// rather than wiring directly to a host FFI callback. `start` hands the
/// source a sink closure to invoke for every arrival/departure it observes;
/// `stop` asks it to unregister.
pub trait ProcessNotificationSource: Send + Sync + 'static {
    fn start(&self, sink: Arc<dyn Fn(RawProcessEvent) + Send + Sync>) -> Result<()>;
    fn stop(&self);
}

/// Deterministic [`ProcessNotificationSource`] for tests: `emit` pushes a
/// synthetic record directly to the registered sink, with no threading or
/// timing involved.
#[derive(Default)]
pub struct TestNotificationSource {
    sink: Mutex<Option<Arc<dyn Fn(RawProcessEvent) + Send + Sync>>>,
}

impl TestNotificationSource {
    pub fn new() -> Self {
        TestNotificationSource { sink: Mutex::new(None) }
    }

    /// Delivers `event` to the registered sink, if any; a no-op before
    /// `start` or after `stop`.
    pub fn emit(&self, event: RawProcessEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink(event);
        }
    }
}

impl ProcessNotificationSource for TestNotificationSource {
    fn start(&self, sink: Arc<dyn Fn(RawProcessEvent) + Send + Sync>) -> Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        *self.sink.lock() = None;
    }
}

/// `cfg(windows)` placeholder for a real `PsSetCreateProcessNotifyRoutineEx`
/// source. Kernel-mode callback registration cannot be driven from a
/// `winapi`-based user-mode crate (see DESIGN.md), so `start` always fails
/// rather than pretending to register anything.
#[cfg(windows)]
pub struct WindowsNotificationSource;

#[cfg(windows)]
impl ProcessNotificationSource for WindowsNotificationSource {
    fn start(&self, _sink: Arc<dyn Fn(RawProcessEvent) + Send + Sync>) -> Result<()> {
        Err(crate::error::Error::InvalidArgument(
            "process notification registration requires kernel-mode callback installation, unavailable from user mode",
        ))
    }

    fn stop(&self) {}
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.shared.exiting.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        // Not joining here: a caller that wants to guarantee the worker has
        // stopped should call `shutdown()` explicitly.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn events_are_held_until_dispatch_enabled() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let monitor = ProcessMonitor::spawn(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.enqueue(RawProcessEvent::Departed { pid: 1 });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        monitor.enable_dispatch();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        monitor.shutdown();
    }

    #[test]
    fn dispatch_preserves_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let monitor = ProcessMonitor::spawn(move |event| {
            if let RawProcessEvent::Departed { pid } = event {
                order_clone.lock().push(pid);
            }
        });
        monitor.enable_dispatch();
        for pid in 1..=5 {
            monitor.enqueue(RawProcessEvent::Departed { pid });
        }
        std::thread::sleep(Duration::from_millis(50));
        monitor.shutdown();
        assert_eq!(*order.lock(), vec![1, 2, 3, 4, 5]);
    }
}
