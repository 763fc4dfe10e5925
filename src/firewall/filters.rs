use crate::address::Family;
use crate::error::{Error, FrameworkError, Result};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionToken(pub u64);

/// An opaque handle standing in for `FWPS_CLASSIFY_OUT` plus the
/// continuation token `FwpsPendClassify` would hand back; held by a pended
/// classification until it is resumed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassifyHandle(pub u64);

/// The WFP layer (or layer-like grouping) a filter is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    BindRedirectV4,
    BindRedirectV6,
    ConnectRedirectV4,
    ConnectRedirectV6,
    AuthConnectV4,
    AuthConnectV6,
    AuthRecvAcceptV4,
    AuthRecvAcceptV6,
    DnsAuthConnectV4,
    DnsAuthConnectV6,
    DnsAuthRecvAcceptV4,
    DnsAuthRecvAcceptV6,
    BlockTunnelV4,
    BlockTunnelV6,
}

impl Layer {
    pub fn family(self) -> Family {
        use Layer::*;
        match self {
            BindRedirectV4 | ConnectRedirectV4 | AuthConnectV4 | AuthRecvAcceptV4
            | DnsAuthConnectV4 | DnsAuthRecvAcceptV4 | BlockTunnelV4 => Family::V4,
            _ => Family::V6,
        }
    }
}

/// Action a filter applies once its conditions match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The default verdict every callout initialises to: defer to lower-weighted filters.
    Continue,
    /// Hard-permit: action-right cleared so no lower-weighted filter can override it.
    Permit,
    /// Hard-block: action-right cleared.
    Block,
}

/// A condition narrowing which traffic a filter matches. Kept as a small,
/// explicit enum rather than a generic key/value condition list, since the
/// coordinator and app-filters module only ever need these shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    ApplicationIdentifier(Vec<u8>),
    LocalAddressEquals(IpAddr),
    LocalAddressNotEquals(IpAddr),
    RemotePortEquals(u16),
}

/// Declarative description of one filter to be added; the WFP-specific
/// engine translates this into `FWPM_FILTER0` plus condition arrays, the
/// mock engine just stores it.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub layer: Layer,
    pub action: Action,
    pub conditions: Vec<Condition>,
    /// Weight is always maximum in this design (see app-filters module and
    /// coordinator filter installation); kept as a field for forward
    /// compatibility rather than hardcoded at every call site.
    pub max_weight: bool,
    pub provider_context: u64,
}

/// Abstraction boundary over the host packet-filter framework (WFP on
/// Windows). Real callout registration and classification happen in kernel
/// mode and are out of reach for a user-mode binding - see DESIGN.md - so
/// this trait only covers the filter/transaction management surface a
/// user-mode session can legitimately drive, plus the pended-classification
/// primitives the mock engine emulates for testing.
pub trait FilterEngine: Send + Sync + 'static {
    fn begin_transaction(&self) -> Result<TransactionToken>;
    fn commit_transaction(&self, token: TransactionToken) -> Result<()>;
    fn abort_transaction(&self, token: TransactionToken) -> Result<()>;

    fn add_filter(&self, token: TransactionToken, spec: FilterSpec) -> Result<FilterId>;
    fn remove_filter(&self, token: TransactionToken, id: FilterId) -> Result<()>;

    /// Completes a pended classification, applying `action` and resuming the
    /// framework's re-evaluation of the request.
    fn complete_classify(&self, handle: ClassifyHandle, action: Action, rewrite: Option<IpAddr>) -> Result<()>;
}

/// A transaction log entry recorded by the in-memory engine purely to
/// support test assertions about what happened.
#[derive(Debug, Clone)]
pub enum EngineLogEntry {
    Added(FilterId, Layer),
    Removed(FilterId),
}

struct PendingTxn {
    added: Vec<FilterId>,
    removed: Vec<(FilterId, FilterSpec)>,
}

/// In-memory [`FilterEngine`] used by the process/firewall subsystems' own
/// test suites and by the end-to-end scenario tests; it plays the role the
/// teacher's tests play against a simulated driver rather than real WFP.
pub struct MockEngine {
    filters: parking_lot::Mutex<std::collections::HashMap<FilterId, FilterSpec>>,
    txns: parking_lot::Mutex<std::collections::HashMap<TransactionToken, PendingTxn>>,
    next_id: AtomicU64,
    next_txn: AtomicU64,
    log: parking_lot::Mutex<Vec<EngineLogEntry>>,
    fail_remove: std::sync::atomic::AtomicBool,
}

impl MockEngine {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(MockEngine {
            filters: parking_lot::Mutex::new(std::collections::HashMap::new()),
            txns: parking_lot::Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicU64::new(1),
            next_txn: AtomicU64::new(1),
            log: parking_lot::Mutex::new(Vec::new()),
            fail_remove: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn filter_count(&self) -> usize {
        self.filters.lock().len()
    }

    pub fn has_filter(&self, id: FilterId) -> bool {
        self.filters.lock().contains_key(&id)
    }

    pub fn log(&self) -> Vec<EngineLogEntry> {
        self.log.lock().clone()
    }

    /// Test hook: makes the next `remove_filter` call fail, simulating a
    /// teardown failure that drives the driver into the zombie state.
    pub fn simulate_remove_failure(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }
}

impl FilterEngine for MockEngine {
    fn begin_transaction(&self) -> Result<TransactionToken> {
        let token = TransactionToken(self.next_txn.fetch_add(1, Ordering::SeqCst));
        self.txns.lock().insert(
            token,
            PendingTxn {
                added: Vec::new(),
                removed: Vec::new(),
            },
        );
        Ok(token)
    }

    fn commit_transaction(&self, token: TransactionToken) -> Result<()> {
        self.txns
            .lock()
            .remove(&token)
            .ok_or(Error::TransactionOwnerMismatch)?;
        Ok(())
    }

    fn abort_transaction(&self, token: TransactionToken) -> Result<()> {
        let txn = self
            .txns
            .lock()
            .remove(&token)
            .ok_or(Error::TransactionOwnerMismatch)?;
        let mut filters = self.filters.lock();
        for id in txn.added {
            filters.remove(&id);
        }
        for (id, spec) in txn.removed {
            filters.insert(id, spec);
        }
        Ok(())
    }

    fn add_filter(&self, token: TransactionToken, spec: FilterSpec) -> Result<FilterId> {
        let mut txns = self.txns.lock();
        let txn = txns.get_mut(&token).ok_or(Error::TransactionOwnerMismatch)?;
        let id = FilterId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.log.lock().push(EngineLogEntry::Added(id, spec.layer));
        self.filters.lock().insert(id, spec);
        txn.added.push(id);
        Ok(id)
    }

    fn remove_filter(&self, token: TransactionToken, id: FilterId) -> Result<()> {
        if self.fail_remove.swap(false, Ordering::SeqCst) {
            return Err(Error::FrameworkFailure(FrameworkError::new(
                -1,
                "simulated filter removal failure",
            )));
        }
        let mut txns = self.txns.lock();
        let txn = txns.get_mut(&token).ok_or(Error::TransactionOwnerMismatch)?;
        let spec = self.filters.lock().remove(&id).ok_or(Error::NotFound)?;
        self.log.lock().push(EngineLogEntry::Removed(id));
        txn.removed.push((id, spec));
        Ok(())
    }

    fn complete_classify(&self, _handle: ClassifyHandle, _action: Action, _rewrite: Option<IpAddr>) -> Result<()> {
        Ok(())
    }
}

impl<T: FilterEngine> FilterEngine for std::sync::Arc<T> {
    fn begin_transaction(&self) -> Result<TransactionToken> {
        (**self).begin_transaction()
    }

    fn commit_transaction(&self, token: TransactionToken) -> Result<()> {
        (**self).commit_transaction(token)
    }

    fn abort_transaction(&self, token: TransactionToken) -> Result<()> {
        (**self).abort_transaction(token)
    }

    fn add_filter(&self, token: TransactionToken, spec: FilterSpec) -> Result<FilterId> {
        (**self).add_filter(token, spec)
    }

    fn remove_filter(&self, token: TransactionToken, id: FilterId) -> Result<()> {
        (**self).remove_filter(token, id)
    }

    fn complete_classify(&self, handle: ClassifyHandle, action: Action, rewrite: Option<IpAddr>) -> Result<()> {
        (**self).complete_classify(handle, action, rewrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(layer: Layer) -> FilterSpec {
        FilterSpec {
            layer,
            action: Action::Permit,
            conditions: Vec::new(),
            max_weight: true,
            provider_context: 0,
        }
    }

    #[test]
    fn abort_restores_removed_filters() {
        let engine = MockEngine::new();
        let txn = engine.begin_transaction().unwrap();
        let id = engine.add_filter(txn, spec(Layer::BindRedirectV4)).unwrap();
        engine.commit_transaction(txn).unwrap();

        let txn = engine.begin_transaction().unwrap();
        engine.remove_filter(txn, id).unwrap();
        assert!(!engine.has_filter(id));
        engine.abort_transaction(txn).unwrap();
        assert!(engine.has_filter(id));
    }

    #[test]
    fn abort_discards_added_filters() {
        let engine = MockEngine::new();
        let txn = engine.begin_transaction().unwrap();
        let id = engine.add_filter(txn, spec(Layer::BindRedirectV6)).unwrap();
        engine.abort_transaction(txn).unwrap();
        assert!(!engine.has_filter(id));
    }
}
