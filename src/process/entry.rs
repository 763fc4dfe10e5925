use crate::image_set::ImageName;

pub type Pid = u32;

/// Splitting status of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplittingStatus {
    Off,
    OnByConfig,
    OnByInheritance,
}

impl SplittingStatus {
    pub fn is_split(self) -> bool {
        !matches!(self, SplittingStatus::Off)
    }
}

/// A settings record: the splitting status plus whether firewall state
/// (an app-filter reference) currently backs it.
///
/// Invariant: `has_firewall_state` implies `status.is_split()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub status: SplittingStatus,
    pub has_firewall_state: bool,
}

impl Settings {
    pub const fn off() -> Self {
        Settings {
            status: SplittingStatus::Off,
            has_firewall_state: false,
        }
    }

    pub fn new(status: SplittingStatus) -> Self {
        Settings {
            status,
            has_firewall_state: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::off()
    }
}

/// One live process as tracked by the registry.
///
/// The parent identifier is looked up through the registry rather than
/// cached as a raw pointer (see DESIGN.md) - `get_parent_entry` plays the
/// role the cached pointer plays in the original design, invalidated
/// implicitly because a departed parent simply won't resolve.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub image: ImageName,
    pub current: Settings,
    pub target: Settings,
    pub previous: Settings,
}

impl ProcessEntry {
    pub fn new(pid: Pid, parent_pid: Option<Pid>, image: ImageName, status: SplittingStatus) -> Self {
        let settings = Settings::new(status);
        ProcessEntry {
            pid,
            parent_pid,
            image,
            current: settings,
            target: settings,
            previous: Settings::off(),
        }
    }
}
