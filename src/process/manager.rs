use super::broker::{ProcessEventBroker, ProcessLifecycleEvent};
use super::entry::{Pid, ProcessEntry, Settings, SplittingStatus};
use super::monitor::RawProcessEvent;
use super::registry::ProcessRegistry;
use crate::error::{Error, Result};
use crate::eventing::{EventRecord, SplittingReason};
use crate::firewall::coordinator::FirewallCoordinator;
use crate::firewall::filters::FilterEngine;
use crate::image_set::{ImageName, ImageSet};
use log::{debug, warn};
use parking_lot::RwLock;
use std::sync::Arc;

type EventSink = Arc<dyn Fn(EventRecord) + Send + Sync>;

/// Owns the process registry together with the app-image configuration that
/// decides which processes split, and keeps the firewall state reconciled
/// with it.
///
/// This is the "process management" half of the driver; it delegates actual
/// filter/transaction work to the [`FirewallCoordinator`], and reports
/// splitting transitions to user-space through an injected event sink (the
/// driver's [`crate::eventing::Eventing`] queue).
pub struct ProcessManager<E: FilterEngine + Clone> {
    registry: ProcessRegistry,
    broker: ProcessEventBroker,
    split_images: RwLock<ImageSet>,
    coordinator: Arc<FirewallCoordinator<E>>,
    event_sink: EventSink,
}

impl<E: FilterEngine + Clone + 'static> ProcessManager<E> {
    pub fn new(coordinator: FirewallCoordinator<E>, event_sink: impl Fn(EventRecord) + Send + Sync + 'static) -> Self {
        let broker = ProcessEventBroker::new();
        let coordinator = Arc::new(coordinator);

        let subscribed_coordinator = coordinator.clone();
        broker.subscribe(move |event| subscribed_coordinator.on_process_event(event));

        ProcessManager {
            registry: ProcessRegistry::new(),
            broker,
            split_images: RwLock::new(ImageSet::new()),
            coordinator,
            event_sink: Arc::new(event_sink),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &ProcessEventBroker {
        &self.broker
    }

    pub fn coordinator(&self) -> &FirewallCoordinator<E> {
        &self.coordinator
    }

    /// Replaces the configured set of split images and reconciles every live
    /// process against it.
    pub fn set_split_images(&self, images: ImageSet) -> Result<()> {
        *self.split_images.write() = images;
        self.reconcile()
    }

    fn is_split_image(&self, image: &ImageName) -> bool {
        self.split_images.read().has_entry_exact(image)
    }

    pub fn split_images_snapshot(&self) -> Vec<ImageName> {
        let mut names = Vec::new();
        self.split_images.read().for_each(|image| names.push(image.clone()));
        names
    }

    /// Applies one raw process-lifecycle record from the monitor, updating
    /// the registry and, on arrival, resolving the initial splitting status
    /// from configuration and inheritance before asking the coordinator to
    /// apply (or skip) firewall state.
    pub fn apply(&self, event: RawProcessEvent) -> Result<()> {
        match event {
            RawProcessEvent::Arrived { pid, parent_pid, image } => self.handle_arrival(pid, parent_pid, image),
            RawProcessEvent::Departed { pid } => self.handle_departure(pid),
        }
    }

    fn handle_arrival(&self, pid: Pid, parent_pid: Option<Pid>, image: ImageName) -> Result<()> {
        let inherited = parent_pid
            .and_then(|ppid| self.registry.find_entry(ppid))
            .map(|parent| parent.current.status.is_split())
            .unwrap_or(false);

        let status = if self.is_split_image(&image) {
            SplittingStatus::OnByConfig
        } else if inherited {
            SplittingStatus::OnByInheritance
        } else {
            SplittingStatus::Off
        };

        let entry = ProcessEntry::new(pid, parent_pid, image, status);
        match self.registry.add_entry(entry.clone()) {
            Ok(()) => {}
            Err(Error::DuplicateObject) => {
                // A pid can be reported arrived twice (e.g. a racing rescan);
                // accept it silently if it's the same process, reject it
                // otherwise so stale state never overwrites a live entry.
                let matches = self
                    .registry
                    .find_entry(pid)
                    .map(|existing| existing.parent_pid == parent_pid && existing.image == entry.image)
                    .unwrap_or(false);
                if !matches {
                    (self.event_sink)(EventRecord::ErrorMessage {
                        status: Error::DuplicateObject.status_code() as u32,
                        message: format!("duplicate arrival for pid {} with mismatched parent/image", pid),
                    });
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        if status.is_split() {
            let reason = transition_reason(status, true);
            match self.coordinator.split_process(&entry.image) {
                Ok(()) => {
                    self.registry.with_entry_mut(pid, |e| e.current.has_firewall_state = true);
                    (self.event_sink)(EventRecord::StartSplitting {
                        pid,
                        reason,
                        image: entry.image.clone(),
                    });
                }
                Err(_) => {
                    (self.event_sink)(EventRecord::StartSplittingError {
                        pid,
                        image: entry.image.clone(),
                    });
                }
            }
        }

        debug!("process {} arrived, splitting={:?}", pid, status);
        self.broker.publish(ProcessLifecycleEvent::Arrived(pid));
        Ok(())
    }

    fn handle_departure(&self, pid: Pid) -> Result<()> {
        let entry = self.registry.delete_entry(pid);
        if let Some(entry) = entry {
            if entry.current.has_firewall_state {
                let reason = transition_reason(entry.current.status, false);
                match self.coordinator.unsplit_process(&entry.image) {
                    Ok(()) => {
                        (self.event_sink)(EventRecord::StopSplitting {
                            pid,
                            reason,
                            image: entry.image.clone(),
                        });
                    }
                    Err(_) => {
                        (self.event_sink)(EventRecord::StopSplittingError {
                            pid,
                            image: entry.image.clone(),
                        });
                    }
                }
            }
        } else {
            warn!("departure for untracked pid {}", pid);
        }
        self.broker.publish(ProcessLifecycleEvent::Departed(pid));
        Ok(())
    }

    /// Recomputes the target splitting status for every live process against
    /// current configuration and inheritance, then drives each process whose
    /// target differs from its current status to convergence.
    ///
    /// This is a fixed-point iteration rather than a single pass: a parent's
    /// status can change in the same reconciliation round as its child's (for
    /// example, a config change that un-splits a parent should cascade to an
    /// inheriting child that was never itself configured), so each round
    /// re-evaluates every process until a full pass makes no further change.
    pub fn reconcile(&self) -> Result<()> {
        loop {
            let pids = self.registry.pids();
            let mut changed = false;

            for pid in pids {
                let target = self.registry.find_entry(pid).map(|entry| {
                    let inherited = entry
                        .parent_pid
                        .and_then(|ppid| self.registry.find_entry(ppid))
                        .map(|parent| parent.current.status.is_split())
                        .unwrap_or(false);

                    if self.is_split_image(&entry.image) {
                        SplittingStatus::OnByConfig
                    } else if inherited {
                        SplittingStatus::OnByInheritance
                    } else {
                        SplittingStatus::Off
                    }
                });

                let Some(target) = target else { continue };

                let applied = self.registry.with_entry_mut(pid, |entry| {
                    if entry.current.status == target {
                        return false;
                    }
                    entry.previous = entry.current;
                    entry.target = Settings::new(target);
                    true
                });

                if applied == Some(true) {
                    self.apply_transition(pid, target)?;
                    changed = true;
                }
            }

            if !changed {
                return Ok(());
            }
        }
    }

    fn apply_transition(&self, pid: Pid, target: SplittingStatus) -> Result<()> {
        let entry = self.registry.find_entry(pid);
        let had_state = entry.as_ref().map(|entry| entry.current.has_firewall_state).unwrap_or(false);
        let Some(entry) = entry else { return Ok(()) };

        if target.is_split() && !had_state {
            match self.coordinator.split_process(&entry.image) {
                Ok(()) => {
                    self.registry.with_entry_mut(pid, |entry| {
                        entry.current.status = target;
                        entry.current.has_firewall_state = true;
                    });
                    (self.event_sink)(EventRecord::StartSplitting {
                        pid,
                        reason: reconcile_reason(target),
                        image: entry.image.clone(),
                    });
                }
                Err(_) => {
                    (self.event_sink)(EventRecord::StartSplittingError {
                        pid,
                        image: entry.image.clone(),
                    });
                }
            }
        } else if !target.is_split() && had_state {
            match self.coordinator.unsplit_process(&entry.image) {
                Ok(()) => {
                    self.registry.with_entry_mut(pid, |entry| {
                        entry.current.status = target;
                        entry.current.has_firewall_state = false;
                    });
                    (self.event_sink)(EventRecord::StopSplitting {
                        pid,
                        reason: reconcile_reason(entry.current.status),
                        image: entry.image.clone(),
                    });
                }
                Err(_) => {
                    (self.event_sink)(EventRecord::StopSplittingError {
                        pid,
                        image: entry.image.clone(),
                    });
                }
            }
        } else {
            self.registry.with_entry_mut(pid, |entry| {
                entry.current.status = target;
            });
        }
        Ok(())
    }
}

/// Reason bits for a transition triggered by a process arriving or
/// departing (always carries the arriving/departing bit alongside the
/// splitting-cause bit).
fn transition_reason(status: SplittingStatus, arriving: bool) -> SplittingReason {
    let mut reason = reconcile_reason(status);
    reason |= if arriving {
        SplittingReason::PROCESS_ARRIVING
    } else {
        SplittingReason::PROCESS_DEPARTING
    };
    reason
}

/// Reason bits for a transition triggered by a configuration or address
/// change rather than by an arrival/departure (no arriving/departing bit).
fn reconcile_reason(status: SplittingStatus) -> SplittingReason {
    match status {
        SplittingStatus::OnByInheritance => SplittingReason::BY_INHERITANCE,
        _ => SplittingReason::BY_CONFIG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressRegistry;
    use crate::firewall::coordinator::FirewallCoordinator;
    use crate::firewall::filters::MockEngine;

    fn manager() -> ProcessManager<std::sync::Arc<MockEngine>> {
        let engine = MockEngine::new();
        let addresses = AddressRegistry::new();
        let coordinator = FirewallCoordinator::new(engine, addresses);
        ProcessManager::new(coordinator, |_event| {})
    }

    #[test]
    fn arrival_inherits_parent_split_status() {
        let mgr = manager();
        let mut images = ImageSet::new();
        images.add_entry("\\device\\parent.exe");
        mgr.set_split_images(images).unwrap();

        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\parent.exe"),
        })
        .unwrap();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 2,
            parent_pid: Some(1),
            image: ImageName::new("\\device\\child.exe"),
        })
        .unwrap();

        let child = mgr.registry().find_entry(2).unwrap();
        assert_eq!(child.current.status, SplittingStatus::OnByInheritance);
    }

    #[test]
    fn departure_clears_registry_entry() {
        let mgr = manager();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\app.exe"),
        })
        .unwrap();
        mgr.apply(RawProcessEvent::Departed { pid: 1 }).unwrap();
        assert!(mgr.registry().find_entry(1).is_none());
    }

    fn manager_with_sink() -> (ProcessManager<std::sync::Arc<MockEngine>>, Arc<parking_lot::Mutex<Vec<EventRecord>>>) {
        let engine = MockEngine::new();
        let addresses = AddressRegistry::new();
        let coordinator = FirewallCoordinator::new(engine, addresses);
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        let mgr = ProcessManager::new(coordinator, move |event| sink.lock().push(event));
        (mgr, events)
    }

    #[test]
    fn duplicate_arrival_matching_is_accepted_silently() {
        let (mgr, events) = manager_with_sink();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\app.exe"),
        })
        .unwrap();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\APP.EXE"),
        })
        .unwrap();

        assert!(events.lock().is_empty());
        assert_eq!(mgr.registry().pids().len(), 1);
    }

    #[test]
    fn duplicate_arrival_mismatched_image_emits_error_and_is_rejected() {
        let (mgr, events) = manager_with_sink();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\app.exe"),
        })
        .unwrap();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\other.exe"),
        })
        .unwrap();

        assert!(matches!(events.lock()[0], EventRecord::ErrorMessage { .. }));
        let entry = mgr.registry().find_entry(1).unwrap();
        assert_eq!(entry.image, ImageName::new("\\device\\app.exe"));
    }

    #[test]
    fn reconcile_cascades_to_inheriting_children() {
        let mgr = manager();
        let mut images = ImageSet::new();
        images.add_entry("\\device\\parent.exe");
        mgr.set_split_images(images).unwrap();

        mgr.apply(RawProcessEvent::Arrived {
            pid: 1,
            parent_pid: None,
            image: ImageName::new("\\device\\parent.exe"),
        })
        .unwrap();
        mgr.apply(RawProcessEvent::Arrived {
            pid: 2,
            parent_pid: Some(1),
            image: ImageName::new("\\device\\child.exe"),
        })
        .unwrap();

        mgr.set_split_images(ImageSet::new()).unwrap();

        let parent = mgr.registry().find_entry(1).unwrap();
        let child = mgr.registry().find_entry(2).unwrap();
        assert_eq!(parent.current.status, SplittingStatus::Off);
        assert_eq!(child.current.status, SplittingStatus::Off);
    }
}
