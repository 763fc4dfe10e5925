use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Address family, used throughout the firewall layer to pick the v4/v6 half
/// of an [`AddressSet`] or a filter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// The interface addresses the splitting decision is made against.
///
/// Any field may be absent. "VPN active" is defined as "a tunnel address of
/// either family is present".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressSet {
    pub internet_ipv4: Option<Ipv4Addr>,
    pub tunnel_ipv4: Option<Ipv4Addr>,
    pub internet_ipv6: Option<Ipv6Addr>,
    pub tunnel_ipv6: Option<Ipv6Addr>,
}

impl AddressSet {
    pub fn vpn_active(&self) -> bool {
        self.tunnel_ipv4.is_some() || self.tunnel_ipv6.is_some()
    }

    /// Returns `(tunnel, internet)` addresses for `family`, each widened to
    /// `IpAddr` so callers don't need to match on family twice.
    pub fn pair_for(&self, family: Family) -> (Option<IpAddr>, Option<IpAddr>) {
        match family {
            Family::V4 => (
                self.tunnel_ipv4.map(IpAddr::V4),
                self.internet_ipv4.map(IpAddr::V4),
            ),
            Family::V6 => (
                self.tunnel_ipv6.map(IpAddr::V6),
                self.internet_ipv6.map(IpAddr::V6),
            ),
        }
    }

    pub fn has_internet_address(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.internet_ipv4.is_some(),
            Family::V6 => self.internet_ipv6.is_some(),
        }
    }

    pub fn has_tunnel_address(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.tunnel_ipv4.is_some(),
            Family::V6 => self.tunnel_ipv6.is_some(),
        }
    }
}

/// Copy-on-write holder for the current [`AddressSet`].
///
/// Producers read a cheap `Arc` clone, mutate their own copy, then
/// re-publish with the lock held only for the swap - the spinlock-guarded
/// copy-on-write scheme described for the address set.
#[derive(Default)]
pub struct AddressRegistry {
    current: Mutex<Arc<AddressSet>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        AddressRegistry {
            current: Mutex::new(Arc::new(AddressSet::default())),
        }
    }

    pub fn get(&self) -> Arc<AddressSet> {
        self.current.lock().clone()
    }

    pub fn set(&self, addresses: AddressSet) {
        *self.current.lock() = Arc::new(addresses);
    }
}
