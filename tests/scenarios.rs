//! End-to-end scenario coverage driving [`SplitTunnelDriver`] the way a host
//! would through its request surface, plus the callout decision functions a
//! host would call once filters are installed.

use splittun_core::address::{AddressRegistry, AddressSet, Family};
use splittun_core::driver::{DriverState, SplitTunnelDriver};
use splittun_core::error::Error;
use splittun_core::eventing::{EventDeliveryResult, EventRecord, SplittingReason};
use splittun_core::firewall::callouts::{BindRequest, Callouts, ProcessLookup, Verdict};
use splittun_core::firewall::filters::MockEngine;
use splittun_core::firewall::FirewallCoordinator;
use splittun_core::process::RawProcessEvent;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

type Driver = SplitTunnelDriver<Arc<MockEngine>>;

fn driver_with_addresses(addresses: AddressSet) -> Driver {
    let engine = MockEngine::new();
    let registry = AddressRegistry::new();
    registry.set(addresses);
    let coordinator = FirewallCoordinator::new(engine, registry);
    let driver = SplitTunnelDriver::new(coordinator);
    driver.initialize().unwrap();
    driver.register_processes(Vec::new()).unwrap();
    driver
}

fn tunnel_addresses() -> AddressSet {
    AddressSet {
        tunnel_ipv4: Some(Ipv4Addr::new(10, 0, 0, 2)),
        internet_ipv4: Some(Ipv4Addr::new(192, 168, 1, 10)),
        ..Default::default()
    }
}

fn lookup_for(driver: &Driver, pid: u32) -> ProcessLookup {
    match driver.query_process(pid) {
        Ok((_, _, split, _)) => ProcessLookup::Known { split },
        Err(Error::NotFound) => ProcessLookup::Unknown,
        Err(other) => panic!("unexpected query_process error: {other}"),
    }
}

/// Scenario A — simple exclusion: a split process's bind is redirected off
/// the unspecified/tunnel address, and its outbound connect is hard-permitted.
#[test]
fn scenario_a_simple_exclusion() {
    let driver = driver_with_addresses(tunnel_addresses());
    driver
        .set_configuration(vec!["\\Device\\HVol1\\App.exe".to_string()])
        .unwrap();
    assert_eq!(driver.state(), DriverState::Engaged);

    driver
        .handle_process_event(RawProcessEvent::Arrived {
            pid: 100,
            parent_pid: Some(4),
            image: splittun_core::image_set::ImageName::new("\\Device\\HVol1\\App.exe"),
        })
        .unwrap();

    let lookup = lookup_for(&driver, 100);
    assert_eq!(lookup, ProcessLookup::Known { split: true });

    let bind = BindRequest {
        pid: 100,
        family: Family::V4,
        local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        rewritten_by: &[],
        this_filter_id: 1,
    };
    let verdict = Callouts::bind_redirect(lookup, bind, &driver.get_addresses());
    assert_eq!(verdict, Verdict::Rewrite(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))));

    // The authorise-connect callout for the same pid, already on the
    // rewritten internet address, is hard-permitted by permit-split-apps.
    let verdict = Callouts::permit_split_apps(lookup);
    assert_eq!(verdict, Verdict::Permit);
}

/// Scenario B — inheritance: a child of a split process starts split too,
/// and the transition is reported with the inheritance reason bit.
#[test]
fn scenario_b_inheritance() {
    let driver = driver_with_addresses(tunnel_addresses());
    driver
        .set_configuration(vec!["\\Device\\HVol1\\App.exe".to_string()])
        .unwrap();

    driver
        .handle_process_event(RawProcessEvent::Arrived {
            pid: 100,
            parent_pid: Some(4),
            image: splittun_core::image_set::ImageName::new("\\Device\\HVol1\\App.exe"),
        })
        .unwrap();
    driver
        .handle_process_event(RawProcessEvent::Arrived {
            pid: 200,
            parent_pid: Some(100),
            image: splittun_core::image_set::ImageName::new("\\Device\\HVol1\\Child.exe"),
        })
        .unwrap();

    let (_, _, split, _) = driver.query_process(200).unwrap();
    assert!(split);

    // Drain the queue for the pid=200 start-splitting event (pid=100's own
    // arrival event is queued ahead of it).
    let mut found = None;
    for _ in 0..4 {
        match driver.dequeue_event(4096) {
            EventDeliveryResult::Delivered(EventRecord::StartSplitting { pid: 200, reason, .. }) => {
                found = Some(reason);
                break;
            }
            EventDeliveryResult::Delivered(_) => continue,
            EventDeliveryResult::Pended(_) => break,
        }
    }
    let reason = found.expect("expected a start-splitting event for pid 200");
    assert!(reason.contains(SplittingReason::BY_INHERITANCE));
    assert!(reason.contains(SplittingReason::PROCESS_ARRIVING));
}

/// Scenario C — dynamic configuration change: a running, unsplit process is
/// pulled into splitting by a later SET-CONFIGURATION, with the plain
/// by-config reason (no process-arriving bit, since nothing arrived).
#[test]
fn scenario_c_dynamic_configuration_change() {
    let driver = driver_with_addresses(tunnel_addresses());

    driver
        .handle_process_event(RawProcessEvent::Arrived {
            pid: 100,
            parent_pid: Some(4),
            image: splittun_core::image_set::ImageName::new("\\Device\\HVol1\\App.exe"),
        })
        .unwrap();
    assert_eq!(driver.state(), DriverState::Ready);
    let (_, _, split, _) = driver.query_process(100).unwrap();
    assert!(!split);

    driver
        .set_configuration(vec!["\\Device\\HVol1\\App.exe".to_string()])
        .unwrap();
    assert_eq!(driver.state(), DriverState::Engaged);

    let mut found = None;
    for _ in 0..4 {
        match driver.dequeue_event(4096) {
            EventDeliveryResult::Delivered(EventRecord::StartSplitting { pid: 100, reason, .. }) => {
                found = Some(reason);
                break;
            }
            EventDeliveryResult::Delivered(_) => continue,
            EventDeliveryResult::Pended(_) => break,
        }
    }
    let reason = found.expect("expected a start-splitting event for pid 100");
    assert_eq!(reason, SplittingReason::BY_CONFIG);

    // The tunnel-bound connect is caught by block-split-apps, not
    // connect-redirect (it only rewrites, it never blocks).
    let lookup = lookup_for(&driver, 100);
    assert_eq!(Callouts::block_split_apps(lookup), Verdict::Block);
}

/// Scenario D — VPN inactive: configuration is accepted and stored, but
/// with no tunnel address present the driver never leaves READY, so no
/// filters are installed and no callout can ever see a split verdict.
#[test]
fn scenario_d_vpn_inactive_stays_ready() {
    let driver = driver_with_addresses(AddressSet::default());
    driver
        .set_configuration(vec!["\\Device\\HVol1\\App.exe".to_string()])
        .unwrap();

    assert_eq!(driver.state(), DriverState::Ready);
    assert!(!driver.manager().coordinator().is_engaged());
    assert_eq!(
        driver.configured_images(),
        vec![splittun_core::image_set::ImageName::new("\\Device\\HVol1\\App.exe")]
    );
}

/// Scenario E — teardown with pending: a classification captured for a
/// not-yet-known process is resolved (loopback rewrite, hard-permit) by a
/// subsequent process-lifecycle event for that same pid.
#[test]
fn scenario_e_teardown_with_pending() {
    let driver = driver_with_addresses(AddressSet::default());

    let pending = driver.manager().coordinator().pending();
    pending.capture(
        100,
        splittun_core::firewall::filters::ClassifyHandle(1),
        splittun_core::firewall::filters::Layer::BindRedirectV4,
        None,
    );
    assert_eq!(pending.len(), 1);

    driver.handle_process_event(RawProcessEvent::Departed { pid: 100 }).unwrap();

    assert!(pending.is_empty());
}

/// Scenario F — reset after failed teardown: a failing remove-filter call
/// during disengage drives the driver to ZOMBIE, after which every
/// non-GET-STATE request is rejected with state-mismatch.
#[test]
fn scenario_f_reset_after_failed_teardown() {
    let engine = MockEngine::new();
    let registry = AddressRegistry::new();
    registry.set(tunnel_addresses());
    let coordinator = FirewallCoordinator::new(engine.clone(), registry);
    let driver = SplitTunnelDriver::new(coordinator);
    driver.initialize().unwrap();
    driver.register_processes(Vec::new()).unwrap();

    driver
        .set_configuration(vec!["\\Device\\HVol1\\App.exe".to_string()])
        .unwrap();
    assert_eq!(driver.state(), DriverState::Engaged);

    engine.simulate_remove_failure();
    let result = driver.clear_configuration();
    assert!(matches!(result, Err(Error::FatalTeardownFailure)));
    assert_eq!(driver.state(), DriverState::Zombie);

    assert!(matches!(
        driver.set_configuration(vec!["\\Device\\Other.exe".to_string()]),
        Err(Error::StateMismatch)
    ));
    assert!(matches!(driver.query_process(100), Err(Error::StateMismatch)));

    // Inflight callouts still classify once ZOMBIE: the callout-facing
    // lookup is neutralised to "known, not split" rather than consulting
    // torn-down registry/firewall state, so every callout family continues
    // instead of producing Pend/Rewrite/Block.
    let lookup = driver.callout_lookup(100);
    assert_eq!(lookup, ProcessLookup::Known { split: false });

    let bind = BindRequest {
        pid: 100,
        family: Family::V4,
        local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        rewritten_by: &[],
        this_filter_id: 1,
    };
    assert_eq!(Callouts::bind_redirect(lookup, bind, &driver.get_addresses()), Verdict::Continue);
    assert_eq!(Callouts::permit_split_apps(lookup), Verdict::Continue);
    assert_eq!(Callouts::block_split_apps(lookup), Verdict::Continue);

    // RESET is the one request that must still work from ZOMBIE - it is the
    // recovery path. The earlier failure was a one-shot simulated fault, so
    // the retry inside reset() succeeds and the driver comes back to life.
    driver.reset().unwrap();
    assert_eq!(driver.state(), DriverState::Started);
}
