use crate::address::AddressSet;
use crate::error::{Error, Result};
use crate::eventing::{EventDeliveryResult, EventRecord, Eventing};
use crate::firewall::coordinator::FirewallCoordinator;
use crate::firewall::filters::FilterEngine;
use crate::firewall::ProcessLookup;
use crate::image_set::{ImageName, ImageSet};
use crate::process::{Pid, ProcessManager, RawProcessEvent};
use crate::wire;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// One of the five lifecycle states the driver moves through.
///
/// Transitions: STARTED -> INITIALIZED on explicit initialise; INITIALIZED
/// -> READY on initial process-set registration; READY <-> ENGAGED driven by
/// "has exclusions AND VPN active"; any -> STARTED on reset if teardown
/// succeeds; else any -> ZOMBIE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Started,
    Initialized,
    Ready,
    Engaged,
    Zombie,
}

/// Identifies one request-interface operation for the admission check in
/// [`RequestCode::admits`]. Mirrors the per-opcode minimum-state table the
/// original driver's IOCTL dispatcher consults before doing any other work,
/// rather than scattering an ad hoc state check across every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestCode {
    Initialize,
    RegisterProcesses,
    SetConfiguration,
    ClearConfiguration,
    RegisterAddresses,
    QueryProcess,
    Reset,
}

impl RequestCode {
    /// Whether `state` is an acceptable starting point for this request.
    /// `GetState`/`GetConfiguration`/`GetAddresses`/`DequeueEvent` have no
    /// entry here because they are answered from every state, including
    /// ZOMBIE - only `Reset` joins them as a ZOMBIE-admitted request, since
    /// it is the sole recovery path out of it.
    fn admits(self, state: DriverState) -> bool {
        use DriverState::*;
        match self {
            RequestCode::Initialize => state == Started,
            RequestCode::RegisterProcesses => state == Initialized,
            RequestCode::Reset => true,
            RequestCode::SetConfiguration
            | RequestCode::ClearConfiguration
            | RequestCode::RegisterAddresses
            | RequestCode::QueryProcess => state != Zombie,
        }
    }
}

/// Top-level coordination object tying the process manager, the firewall
/// coordinator, and the eventing queue together behind the driver state
/// lock. This is the closest analogue to the host's IOCTL dispatch surface,
/// minus the actual serialisation over a device handle (out of scope, see
/// DESIGN.md).
pub struct SplitTunnelDriver<E: FilterEngine + Clone> {
    state: Mutex<DriverState>,
    manager: ProcessManager<E>,
    eventing: Arc<Mutex<Eventing>>,
    has_exclusions: Mutex<bool>,
}

impl<E: FilterEngine + Clone> SplitTunnelDriver<E> {
    pub fn new(coordinator: FirewallCoordinator<E>) -> Self {
        let eventing = Arc::new(Mutex::new(Eventing::new()));
        let sink_eventing = eventing.clone();
        let manager = ProcessManager::new(coordinator, move |record| {
            sink_eventing.lock().emit(record, wire::encoded_event_size);
        });

        SplitTunnelDriver {
            state: Mutex::new(DriverState::Started),
            manager,
            eventing,
            has_exclusions: Mutex::new(false),
        }
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    pub fn manager(&self) -> &ProcessManager<E> {
        &self.manager
    }

    /// Admits or rejects `code` against the current state per
    /// [`RequestCode::admits`].
    fn admit(&self, code: RequestCode) -> Result<()> {
        if code.admits(*self.state.lock()) {
            Ok(())
        } else {
            Err(Error::StateMismatch)
        }
    }

    /// STARTED -> INITIALIZED.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !RequestCode::Initialize.admits(*state) {
            return Err(Error::StateMismatch);
        }
        *state = DriverState::Initialized;
        Ok(())
    }

    /// Applies the initial bulk process-registration payload, then
    /// transitions INITIALIZED -> READY and enables process-event dispatch.
    pub fn register_processes(&self, events: Vec<RawProcessEvent>) -> Result<()> {
        self.admit(RequestCode::RegisterProcesses)?;

        for event in events {
            if let Err(err) = self.manager.apply(event) {
                error!("bulk process registration entry rejected: {}", err);
                self.emit(EventRecord::ErrorMessage {
                    status: err.status_code() as u32,
                    message: err.to_string(),
                });
            }
        }

        *self.state.lock() = DriverState::Ready;
        self.recompute_engaged()
    }

    /// Replaces the active exclusion set, reconciles every process against
    /// it, and recomputes the engaged state.
    pub fn set_configuration(&self, names: Vec<String>) -> Result<()> {
        self.admit(RequestCode::SetConfiguration)?;
        let images = ImageSet::try_from_list(names)?;
        *self.has_exclusions.lock() = !images.is_empty();
        self.manager.set_split_images(images)?;
        self.recompute_engaged()
    }

    pub fn clear_configuration(&self) -> Result<()> {
        self.admit(RequestCode::ClearConfiguration)?;
        *self.has_exclusions.lock() = false;
        self.manager.set_split_images(ImageSet::new())?;
        self.recompute_engaged()
    }

    /// Answered from any state, including ZOMBIE (GET-CONFIGURATION).
    pub fn configured_images(&self) -> Vec<ImageName> {
        self.manager.split_images_snapshot()
    }

    pub fn register_addresses(&self, addresses: AddressSet) -> Result<()> {
        self.admit(RequestCode::RegisterAddresses)?;
        self.manager.coordinator().register_updated_addresses(addresses)?;
        self.recompute_engaged()
    }

    /// Answered from any state, including ZOMBIE (GET-IP-ADDRESSES).
    pub fn get_addresses(&self) -> AddressSet {
        *self.manager.coordinator().addresses().get()
    }

    /// Applies a process-lifecycle event (arrival or departure) coming from
    /// the monitor's worker thread, then publishes it to both internal
    /// subscribers and the eventing queue. Not itself one of the request
    /// codes in [`RequestCode`] - it originates from the notification
    /// source, not a host request - but still refuses new work once ZOMBIE.
    pub fn handle_process_event(&self, event: RawProcessEvent) -> Result<()> {
        if *self.state.lock() == DriverState::Zombie {
            return Err(Error::StateMismatch);
        }
        self.manager.apply(event)
    }

    pub fn query_process(&self, pid: Pid) -> Result<(Pid, Option<Pid>, bool, ImageName)> {
        self.admit(RequestCode::QueryProcess)?;
        let entry = self.manager.registry().find_entry(pid).ok_or(Error::NotFound)?;
        Ok((entry.pid, entry.parent_pid, entry.current.status.is_split(), entry.image))
    }

    /// The lookup a classify callout consults, distinct from the host-facing
    /// `query_process` request above: it is never gated by `admit` and never
    /// fails. Once ZOMBIE it resolves every pid as "known, not split" rather
    /// than touching the registry at all, so an inflight callout's verdict
    /// becomes a plain continue instead of racing torn-down firewall state.
    pub fn callout_lookup(&self, pid: Pid) -> ProcessLookup {
        if *self.state.lock() == DriverState::Zombie {
            return ProcessLookup::Known { split: false };
        }
        match self.manager.registry().find_entry(pid) {
            Some(entry) => ProcessLookup::Known {
                split: entry.current.status.is_split(),
            },
            None => ProcessLookup::Unknown,
        }
    }

    /// READY <-> ENGAGED, driven by "has exclusions AND VPN active".
    fn recompute_engaged(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, DriverState::Ready | DriverState::Engaged) {
            return Ok(());
        }

        let should_engage = *self.has_exclusions.lock() && self.manager.coordinator().addresses().get().vpn_active();
        let is_engaged = *state == DriverState::Engaged;

        if should_engage && !is_engaged {
            drop(state);
            match self.manager.coordinator().enable_splitting() {
                Ok(()) => {
                    *self.state.lock() = DriverState::Engaged;
                    info!("driver engaged");
                    Ok(())
                }
                Err(err) => {
                    warn!("failed to engage splitting: {}", err);
                    Err(err)
                }
            }
        } else if !should_engage && is_engaged {
            drop(state);
            match self.manager.coordinator().disable_splitting() {
                Ok(()) => {
                    *self.state.lock() = DriverState::Ready;
                    info!("driver disengaged");
                    Ok(())
                }
                Err(err) => {
                    error!("failed to disengage splitting, entering zombie state: {}", err);
                    *self.state.lock() = DriverState::Zombie;
                    Err(Error::FatalTeardownFailure)
                }
            }
        } else {
            Ok(())
        }
    }

    fn emit(&self, record: EventRecord) {
        self.eventing.lock().emit(record, wire::encoded_event_size);
    }

    pub fn dequeue_event(&self, capacity: usize) -> EventDeliveryResult {
        self.eventing.lock().collect(capacity, wire::encoded_event_size)
    }

    /// RESET: tears down firewall state, clears the registry and
    /// configuration, cancels pended eventing work, and returns to STARTED.
    /// If teardown fails the driver becomes (or remains) ZOMBIE.
    pub fn reset(&self) -> Result<()> {
        if self.manager.coordinator().is_engaged() {
            if let Err(err) = self.manager.coordinator().disable_splitting() {
                error!("reset: teardown failed, entering zombie state: {}", err);
                *self.state.lock() = DriverState::Zombie;
                return Err(Error::FatalTeardownFailure);
            }
        }

        self.manager.registry().reset();
        *self.has_exclusions.lock() = false;
        self.eventing.lock().teardown();
        *self.state.lock() = DriverState::Started;
        Ok(())
    }
}
