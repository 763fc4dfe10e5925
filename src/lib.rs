//! Core decision logic for per-application VPN split tunneling.
//!
//! This crate implements the host-independent half of a split-tunnel
//! facility: it tracks live processes, decides which of them should bypass
//! the tunnel, and drives an abstract packet-filter framework
//! ([`firewall::FilterEngine`]) to redirect their traffic accordingly. It
//! does not talk to any real packet-filter framework, process-notification
//! API, or IOCTL surface itself - those are host integration concerns. See
//! DESIGN.md for what was kept abstract and why.
//!
//! The pieces fit together as:
//!
//! - [`image_set`] / [`address`] hold the two inputs the splitting decision
//!   is made from: the configured exclusion list and the current tunnel /
//!   internet addresses.
//! - [`process`] tracks live processes and their splitting status, including
//!   inheritance from parent to child and reconciliation on configuration
//!   change.
//! - [`firewall`] holds the app-filter bookkeeping, callout decision logic,
//!   pended-classification handling, and the coordinator that ties them to
//!   an [`firewall::FilterEngine`] behind one transaction per state change.
//! - [`eventing`] and [`wire`] implement the outbound notification queue and
//!   its byte-buffer encoding.
//! - [`driver`] is the top-level state machine a host binds its request
//!   interface to.

pub mod address;
pub mod driver;
pub mod error;
pub mod error_ext;
pub mod eventing;
pub mod firewall;
pub mod image_set;
pub mod process;
pub mod wire;

pub use driver::{DriverState, SplitTunnelDriver};
pub use error::{Error, Result, StatusCode};
pub use firewall::FilterEngine;
