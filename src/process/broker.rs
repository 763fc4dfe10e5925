use super::entry::Pid;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A process lifecycle notification, published after the process manager has
/// fully applied one process-arrival or process-departure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLifecycleEvent {
    Arrived(Pid),
    Departed(Pid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(ProcessLifecycleEvent) + Send + Sync>;

/// Publish/subscribe hub letting dependent subsystems (pending
/// classifications, in particular) react to process lifecycle events
/// without being directly wired into the process manager.
#[derive(Default)]
pub struct ProcessEventBroker {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl ProcessEventBroker {
    pub fn new() -> Self {
        ProcessEventBroker {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(ProcessLifecycleEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Notifies every subscriber. The subscriber list is cloned out before
    /// invoking callbacks so a subscriber is free to subscribe/unsubscribe
    /// from within its own callback without deadlocking.
    pub fn publish(&self, event: ProcessLifecycleEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in subscribers {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_reaches_all_subscribers() {
        let broker = ProcessEventBroker::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = count.clone();
        broker.subscribe(move |_| {
            count_a.fetch_add(1, Ordering::SeqCst);
        });
        let count_b = count.clone();
        broker.subscribe(move |_| {
            count_b.fetch_add(1, Ordering::SeqCst);
        });

        broker.publish(ProcessLifecycleEvent::Arrived(1));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broker = ProcessEventBroker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = broker.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        broker.unsubscribe(id);
        broker.publish(ProcessLifecycleEvent::Departed(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
