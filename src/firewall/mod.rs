pub mod appfilters;
pub mod callouts;
pub mod coordinator;
pub mod filters;
pub mod pending;

#[cfg(windows)]
pub mod wfp_engine;

pub use callouts::{BindRequest, Callouts, ConnectRequest, ProcessLookup, Verdict};
pub use coordinator::{CoordinatorTransaction, FirewallCoordinator};
pub use filters::{Action, FilterEngine, FilterId, FilterSpec, Layer, MockEngine, TransactionToken};
pub use pending::{PendedClassification, PendingClassifications};

#[cfg(windows)]
pub use wfp_engine::WfpEngine;
