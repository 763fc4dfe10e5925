use crate::address::{AddressSet, Family};
use crate::process::Pid;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The verdict a callout reaches for one classification. `Pend` is only
/// returned when the owning process is unknown; the caller is expected to
/// capture a [`crate::firewall::pending::PendedClassification`] in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Permit,
    /// Carries the address the local endpoint should be rewritten to.
    Rewrite(IpAddr),
    Block,
    Pend,
}

/// Whether the requesting process is known, and if so, whether it's split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLookup {
    Unknown,
    Known { split: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct BindRequest {
    pub pid: Pid,
    pub family: Family,
    pub local_address: IpAddr,
    /// Addresses previously written to this request by earlier classify
    /// rounds, most recent first; used for recursion detection.
    pub rewritten_by: &'static [u64],
    pub this_filter_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    pub pid: Pid,
    pub family: Family,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
}

/// Stateless decision functions backing the three callout families.
/// Registration of the callouts themselves (a kernel-mode operation) is
/// handled by the coordinator/engine boundary; this module only implements
/// the verdict logic so it can be exercised directly in tests.
pub struct Callouts;

impl Callouts {
    /// Bind-redirect: rewrites the local address of a split process's bind
    /// when it is unspecified or equals the tunnel address of the family.
    /// Recursion (a prior round of this same filter already rewrote this
    /// request) aborts the rewrite - note the abort path does not become
    /// `Permit`, it stays `Continue`, since the classify-out's permit flag
    /// is only set inside the branch that actually performs a rewrite.
    pub fn bind_redirect(lookup: ProcessLookup, request: BindRequest, addresses: &AddressSet) -> Verdict {
        let split = match lookup {
            ProcessLookup::Unknown => return Verdict::Pend,
            ProcessLookup::Known { split } => split,
        };
        if !split {
            return Verdict::Continue;
        }

        if request.rewritten_by.contains(&request.this_filter_id) {
            return Verdict::Continue;
        }

        let (tunnel, internet) = addresses.pair_for(request.family);
        let is_unspecified = is_unspecified(request.local_address);
        let equals_tunnel = tunnel.map(|t| t == request.local_address).unwrap_or(false);

        if is_unspecified || equals_tunnel {
            if let Some(internet) = internet {
                return Verdict::Rewrite(internet);
            }
        }
        Verdict::Continue
    }

    /// Connect-redirect: rewrite iff the local address equals the tunnel
    /// address, or the remote address is not itself a local address.
    pub fn connect_redirect(lookup: ProcessLookup, request: ConnectRequest, addresses: &AddressSet) -> Verdict {
        let split = match lookup {
            ProcessLookup::Unknown => return Verdict::Pend,
            ProcessLookup::Known { split } => split,
        };
        if !split {
            return Verdict::Continue;
        }

        let (tunnel, internet) = addresses.pair_for(request.family);
        let equals_tunnel = tunnel.map(|t| t == request.local_address).unwrap_or(false);
        let remote_is_local = is_local_address(request.remote_address);

        if equals_tunnel || !remote_is_local {
            if let Some(internet) = internet {
                return Verdict::Rewrite(internet);
            }
        }
        Verdict::Continue
    }

    /// Permit-split-apps: hard-permit for split processes only, paired at
    /// the filter layer with a "local address not equal to tunnel address"
    /// condition so in-tunnel traffic is left to block-split-apps.
    pub fn permit_split_apps(lookup: ProcessLookup) -> Verdict {
        match lookup {
            ProcessLookup::Known { split: true } => Verdict::Permit,
            _ => Verdict::Continue,
        }
    }

    /// Block-split-apps: hard-block for split processes, and for unknown
    /// ones too, protecting against a process whose split status just
    /// changed while a connection inside the tunnel is still active.
    pub fn block_split_apps(lookup: ProcessLookup) -> Verdict {
        match lookup {
            ProcessLookup::Known { split: true } => Verdict::Block,
            ProcessLookup::Unknown => Verdict::Block,
            ProcessLookup::Known { split: false } => Verdict::Continue,
        }
    }
}

fn is_unspecified(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED,
        IpAddr::V6(v6) => v6 == Ipv6Addr::UNSPECIFIED,
    }
}

/// "Local address" per the family-appropriate tests: loopback, link-local,
/// RFC1918/unique-local, site-local, limited-broadcast, and non-global
/// multicast.
pub fn is_local_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => is_local_v6(v6),
    }
}

fn is_local_v4(addr: Ipv4Addr) -> bool {
    if addr.is_loopback() || addr.is_link_local() || addr.is_broadcast() || addr.is_multicast() {
        return true;
    }
    let octets = addr.octets();
    // RFC 1918 private ranges.
    matches!(octets[0], 10) || (octets[0] == 172 && (16..=31).contains(&octets[1])) || (octets[0] == 192 && octets[1] == 168)
}

fn is_local_v6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() {
        return true;
    }
    let segments = addr.segments();
    let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
    let is_site_local = (segments[0] & 0xffc0) == 0xfec0;
    let is_non_global_multicast = (segments[0] & 0xff00) == 0xff00 && (segments[0] & 0x000f) != 0x000e;
    is_unique_local || is_link_local || is_site_local || is_non_global_multicast
}
