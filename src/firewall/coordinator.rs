use super::appfilters::AppFilters;
use super::filters::{Action, Condition, FilterEngine, FilterId, FilterSpec, Layer, TransactionToken};
use super::pending::PendingClassifications;
use crate::address::{AddressRegistry, AddressSet, Family};
use crate::error::{Error, Result};
use crate::process::ProcessLifecycleEvent;
use log::debug;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::thread::ThreadId;

/// Provider-context value the coordinator hands to every filter it installs
/// so callouts can reach the coordinator's state with one dereference. Kept
/// as an opaque `u64` since the real provider-context payload is a raw
/// pointer, meaningless off the host this driver runs on.
const PROVIDER_CONTEXT: u64 = 1;

struct FiveFamilyFilters {
    bind_redirect_v4: FilterId,
    bind_redirect_v6: FilterId,
    connect_redirect_v4: FilterId,
    connect_redirect_v6: FilterId,
    permit_non_tunnel: Vec<FilterId>,
    block_tunnel: Vec<FilterId>,
}

/// Owns the packet-filter session, the app-filters module, and the
/// pending-classifications module; exposes enable/disable-splitting,
/// address registration, and the composed transaction facility used by the
/// process manager.
pub struct FirewallCoordinator<E: FilterEngine + Clone> {
    engine: E,
    addresses: AddressRegistry,
    app_filters: Mutex<AppFilters<E>>,
    pending: PendingClassifications<E>,
    installed: Mutex<Option<FiveFamilyFilters>>,
}

impl<E: FilterEngine + Clone> FirewallCoordinator<E> {
    pub fn new(engine: E, addresses: AddressRegistry) -> Self {
        let pending = PendingClassifications::new(engine.clone());
        FirewallCoordinator {
            engine,
            addresses,
            app_filters: Mutex::new(AppFilters::new()),
            pending,
            installed: Mutex::new(None),
        }
    }

    pub fn addresses(&self) -> &AddressRegistry {
        &self.addresses
    }

    pub fn pending(&self) -> &PendingClassifications<E> {
        &self.pending
    }

    pub fn is_engaged(&self) -> bool {
        self.installed.lock().is_some()
    }

    /// Reacts to a process lifecycle event by resolving pending
    /// classifications for the affected pid, and (on arrival/departure)
    /// asks the app-filters module for firewall state changes via the
    /// caller-driven `split_process`/`unsplit_process` entry points.
    pub fn on_process_event(&self, event: ProcessLifecycleEvent) {
        self.pending.on_process_event(event);
    }

    /// Installs the five filter families inside one framework transaction:
    /// bind-redirect v4/v6, connect-redirect v4/v6, and permit-non-tunnel
    /// (four filters per family, baseline + DNS sublayer), plus, when only
    /// one family has a usable internet address, a block-tunnel filter for
    /// the family without one. Adopts the newer per-family-block design
    /// over the older explicit-permit-filter design (see DESIGN.md).
    pub fn enable_splitting(&self) -> Result<()> {
        if self.is_engaged() {
            return Err(Error::StateMismatch);
        }

        let addresses = self.addresses.get();
        let token = self.engine.begin_transaction()?;

        let result = self.install_five_families(token, &addresses);
        match result {
            Ok(filters) => {
                self.engine.commit_transaction(token)?;
                *self.installed.lock() = Some(filters);
                Ok(())
            }
            Err(err) => {
                let _ = self.engine.abort_transaction(token);
                Err(err)
            }
        }
    }

    fn install_five_families(&self, token: TransactionToken, addresses: &AddressSet) -> Result<FiveFamilyFilters> {
        let bind_redirect_v4 = self.engine.add_filter(token, redirect_spec(Layer::BindRedirectV4))?;
        let bind_redirect_v6 = self.engine.add_filter(token, redirect_spec(Layer::BindRedirectV6))?;
        let connect_redirect_v4 = self.engine.add_filter(token, redirect_spec(Layer::ConnectRedirectV4))?;
        let connect_redirect_v6 = self.engine.add_filter(token, redirect_spec(Layer::ConnectRedirectV6))?;

        let mut permit_non_tunnel = Vec::new();
        for (family, tunnel) in [(Family::V4, addresses.tunnel_ipv4.map(IpAddr::V4)), (Family::V6, addresses.tunnel_ipv6.map(IpAddr::V6))] {
            for layer in permit_layers(family) {
                let mut conditions = Vec::new();
                if let Some(tunnel) = tunnel {
                    conditions.push(Condition::LocalAddressNotEquals(tunnel));
                }
                if matches!(layer, Layer::DnsAuthConnectV4 | Layer::DnsAuthConnectV6 | Layer::DnsAuthRecvAcceptV4 | Layer::DnsAuthRecvAcceptV6) {
                    conditions.push(Condition::RemotePortEquals(53));
                }
                let id = self.engine.add_filter(
                    token,
                    FilterSpec {
                        layer,
                        action: Action::Permit,
                        conditions,
                        max_weight: true,
                        provider_context: PROVIDER_CONTEXT,
                    },
                )?;
                permit_non_tunnel.push(id);
            }
        }

        let mut block_tunnel = Vec::new();
        let v4_usable = addresses.has_internet_address(Family::V4);
        let v6_usable = addresses.has_internet_address(Family::V6);
        if v4_usable && !v6_usable {
            block_tunnel.push(self.engine.add_filter(token, block_tunnel_spec(Layer::BlockTunnelV6))?);
        } else if v6_usable && !v4_usable {
            block_tunnel.push(self.engine.add_filter(token, block_tunnel_spec(Layer::BlockTunnelV4))?);
        }

        Ok(FiveFamilyFilters {
            bind_redirect_v4,
            bind_redirect_v6,
            connect_redirect_v4,
            connect_redirect_v6,
            permit_non_tunnel,
            block_tunnel,
        })
    }

    /// Removes every filter `enable_splitting` installed and resets the
    /// app-filters module, inside a coupled transaction.
    pub fn disable_splitting(&self) -> Result<()> {
        let installed = self.installed.lock().take().ok_or(Error::StateMismatch)?;

        let token = self.engine.begin_transaction()?;
        let mut app_filters = self.app_filters.lock();
        app_filters.begin_transaction()?;

        let result = (|| -> Result<()> {
            self.engine.remove_filter(token, installed.bind_redirect_v4)?;
            self.engine.remove_filter(token, installed.bind_redirect_v6)?;
            self.engine.remove_filter(token, installed.connect_redirect_v4)?;
            self.engine.remove_filter(token, installed.connect_redirect_v6)?;
            for id in &installed.permit_non_tunnel {
                self.engine.remove_filter(token, *id)?;
            }
            for id in &installed.block_tunnel {
                self.engine.remove_filter(token, *id)?;
            }
            app_filters.reset(&self.engine, token)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                app_filters.commit();
                self.engine.commit_transaction(token)?;
                self.pending.fail_all();
                Ok(())
            }
            Err(err) => {
                let _ = app_filters.abort(&self.engine, token);
                let _ = self.engine.abort_transaction(token);
                *self.installed.lock() = Some(installed);
                Err(err)
            }
        }
    }

    /// Rebuilds the five address-dependent filter families and asks the
    /// app-filters module to rebuild its per-image filters against the new
    /// tunnel addresses; any failure aborts both inner transactions and
    /// leaves the previously installed filters in place. Unlike a
    /// disable/enable cycle, this never calls `AppFilters::reset`, so
    /// already-split processes keep their in-tunnel block protection across
    /// the address change.
    pub fn register_updated_addresses(&self, addresses: AddressSet) -> Result<()> {
        self.addresses.set(addresses);

        let installed = match self.installed.lock().take() {
            Some(installed) => installed,
            None => return Ok(()),
        };

        let token = self.engine.begin_transaction()?;
        let mut app_filters = self.app_filters.lock();
        app_filters.begin_transaction()?;

        let result = (|| -> Result<FiveFamilyFilters> {
            self.engine.remove_filter(token, installed.bind_redirect_v4)?;
            self.engine.remove_filter(token, installed.bind_redirect_v6)?;
            self.engine.remove_filter(token, installed.connect_redirect_v4)?;
            self.engine.remove_filter(token, installed.connect_redirect_v6)?;
            for id in &installed.permit_non_tunnel {
                self.engine.remove_filter(token, *id)?;
            }
            for id in &installed.block_tunnel {
                self.engine.remove_filter(token, *id)?;
            }
            app_filters.update_filters(
                &self.engine,
                token,
                addresses.tunnel_ipv4.map(IpAddr::V4),
                addresses.tunnel_ipv6.map(IpAddr::V6),
                PROVIDER_CONTEXT,
            )?;
            self.install_five_families(token, &addresses)
        })();

        match result {
            Ok(filters) => {
                app_filters.commit();
                self.engine.commit_transaction(token)?;
                *self.installed.lock() = Some(filters);
                debug!("rebuilt app filters for {} image reference(s)", app_filters.total_refcount());
                Ok(())
            }
            Err(err) => {
                let _ = app_filters.abort(&self.engine, token);
                let _ = self.engine.abort_transaction(token);
                *self.installed.lock() = Some(installed);
                Err(err)
            }
        }
    }

    /// Registers a block-tunnel app-filter entry for `image`, incrementing
    /// its reference count if one already exists. A no-op while splitting
    /// is not engaged, matching the engaged-state gate the coordinator
    /// otherwise enforces for all filter-bearing operations.
    pub fn split_process(&self, image: &crate::image_set::ImageName) -> Result<()> {
        if !self.is_engaged() {
            return Ok(());
        }
        self.register_app_block(image)
    }

    pub fn unsplit_process(&self, image: &crate::image_set::ImageName) -> Result<()> {
        if !self.is_engaged() {
            return Ok(());
        }
        self.remove_app_block(image)
    }

    fn register_app_block(&self, image: &crate::image_set::ImageName) -> Result<()> {
        let addresses = self.addresses.get();
        let token = self.engine.begin_transaction()?;
        let mut app_filters = self.app_filters.lock();
        app_filters.begin_transaction()?;

        let result = app_filters.register_block(
            &self.engine,
            token,
            image,
            addresses.tunnel_ipv4.map(IpAddr::V4),
            addresses.tunnel_ipv6.map(IpAddr::V6),
            PROVIDER_CONTEXT,
        );

        match result {
            Ok(()) => {
                app_filters.commit();
                self.engine.commit_transaction(token)
            }
            Err(err) => {
                let _ = app_filters.abort(&self.engine, token);
                let _ = self.engine.abort_transaction(token);
                Err(err)
            }
        }
    }

    fn remove_app_block(&self, image: &crate::image_set::ImageName) -> Result<()> {
        let token = self.engine.begin_transaction()?;
        let mut app_filters = self.app_filters.lock();
        app_filters.begin_transaction()?;

        let result = app_filters.remove_block(&self.engine, token, image);

        match result {
            Ok(()) => {
                app_filters.commit();
                self.engine.commit_transaction(token)
            }
            Err(err) => {
                let _ = app_filters.abort(&self.engine, token);
                let _ = self.engine.abort_transaction(token);
                Err(err)
            }
        }
    }

    /// Opens the composed transaction facility for process-manager use.
    pub fn begin_transaction(&self) -> Result<CoordinatorTransaction<'_, E>> {
        let token = self.engine.begin_transaction()?;
        let mut app_filters = self.app_filters.lock();
        if let Err(err) = app_filters.begin_transaction() {
            let _ = self.engine.abort_transaction(token);
            return Err(err);
        }
        drop(app_filters);

        Ok(CoordinatorTransaction {
            coordinator: self,
            token,
            owner: std::thread::current().id(),
            resolved: false,
        })
    }
}

/// Composed transaction owning both the framework transaction and the
/// app-filters transaction; records the opening thread and rejects
/// commit/abort from any other thread.
pub struct CoordinatorTransaction<'a, E: FilterEngine + Clone> {
    coordinator: &'a FirewallCoordinator<E>,
    token: TransactionToken,
    owner: ThreadId,
    resolved: bool,
}

impl<'a, E: FilterEngine + Clone> CoordinatorTransaction<'a, E> {
    pub fn token(&self) -> TransactionToken {
        self.token
    }

    fn check_owner(&self) -> Result<()> {
        if std::thread::current().id() != self.owner {
            return Err(Error::TransactionOwnerMismatch);
        }
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.check_owner()?;
        self.coordinator.app_filters.lock().commit();
        self.coordinator.engine.commit_transaction(self.token)?;
        self.resolved = true;
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.check_owner()?;
        self.coordinator.app_filters.lock().abort(&self.coordinator.engine, self.token)?;
        self.coordinator.engine.abort_transaction(self.token)?;
        self.resolved = true;
        Ok(())
    }
}

impl<'a, E: FilterEngine + Clone> Drop for CoordinatorTransaction<'a, E> {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self.coordinator.app_filters.lock().abort(&self.coordinator.engine, self.token);
            let _ = self.coordinator.engine.abort_transaction(self.token);
        }
    }
}

fn redirect_spec(layer: Layer) -> FilterSpec {
    FilterSpec {
        layer,
        action: Action::Continue,
        conditions: Vec::new(),
        max_weight: true,
        provider_context: PROVIDER_CONTEXT,
    }
}

fn block_tunnel_spec(layer: Layer) -> FilterSpec {
    FilterSpec {
        layer,
        action: Action::Block,
        conditions: Vec::new(),
        max_weight: true,
        provider_context: PROVIDER_CONTEXT,
    }
}

fn permit_layers(family: Family) -> Vec<Layer> {
    match family {
        Family::V4 => vec![
            Layer::AuthConnectV4,
            Layer::AuthRecvAcceptV4,
            Layer::DnsAuthConnectV4,
            Layer::DnsAuthRecvAcceptV4,
        ],
        Family::V6 => vec![
            Layer::AuthConnectV6,
            Layer::AuthRecvAcceptV6,
            Layer::DnsAuthConnectV6,
            Layer::DnsAuthRecvAcceptV6,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::filters::MockEngine;
    use std::net::Ipv4Addr;

    fn coordinator() -> FirewallCoordinator<std::sync::Arc<MockEngine>> {
        let engine = MockEngine::new();
        let addresses = AddressRegistry::new();
        addresses.set(AddressSet {
            tunnel_ipv4: Some(Ipv4Addr::new(10, 0, 0, 2)),
            internet_ipv4: Some(Ipv4Addr::new(192, 168, 1, 10)),
            ..Default::default()
        });
        FirewallCoordinator::new(engine, addresses)
    }

    #[test]
    fn enable_then_disable_removes_all_filters() {
        let coordinator = coordinator();
        coordinator.enable_splitting().unwrap();
        assert!(coordinator.is_engaged());
        coordinator.disable_splitting().unwrap();
        assert!(!coordinator.is_engaged());
    }

    #[test]
    fn enable_twice_rejected() {
        let coordinator = coordinator();
        coordinator.enable_splitting().unwrap();
        assert!(matches!(coordinator.enable_splitting(), Err(Error::StateMismatch)));
    }

    #[test]
    fn single_family_internet_gets_opposite_family_block() {
        let coordinator = coordinator();
        // Only v4 has an internet address configured in `coordinator()`.
        coordinator.enable_splitting().unwrap();
        let installed = coordinator.installed.lock();
        assert_eq!(installed.as_ref().unwrap().block_tunnel.len(), 1);
    }

    #[test]
    fn register_updated_addresses_rebuilds_app_filters_instead_of_wiping_them() {
        let coordinator = coordinator();
        coordinator.enable_splitting().unwrap();
        let image = crate::image_set::ImageName::new("\\device\\app.exe");
        coordinator.split_process(&image).unwrap();
        assert_eq!(coordinator.app_filters.lock().entries().len(), 1);

        coordinator
            .register_updated_addresses(AddressSet {
                tunnel_ipv4: Some(Ipv4Addr::new(10, 0, 0, 3)),
                internet_ipv4: Some(Ipv4Addr::new(192, 168, 1, 20)),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(coordinator.app_filters.lock().entries().len(), 1);
    }

    #[test]
    fn composed_transaction_rejects_foreign_thread_commit() {
        let coordinator = coordinator();
        let txn = coordinator.begin_transaction().unwrap();
        let result = std::thread::scope(|scope| {
            scope.spawn(|| txn.commit()).join().unwrap()
        });
        assert!(matches!(result, Err(Error::TransactionOwnerMismatch)));
    }
}
