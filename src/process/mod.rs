pub mod broker;
pub mod entry;
pub mod manager;
pub mod monitor;
pub mod registry;

pub use broker::{ProcessEventBroker, ProcessLifecycleEvent, SubscriptionId};
pub use entry::{Pid, ProcessEntry, Settings, SplittingStatus};
pub use manager::ProcessManager;
pub use monitor::{ProcessMonitor, ProcessNotificationSource, RawProcessEvent, TestNotificationSource};
pub use registry::ProcessRegistry;

#[cfg(windows)]
pub use monitor::WindowsNotificationSource;
