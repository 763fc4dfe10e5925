use super::entry::{Pid, ProcessEntry};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Indexed map of live processes, keyed by process identifier.
///
/// Mutations are guarded by a single lock that nonetheless lets concurrent
/// readers (classify-time lookups) proceed without blocking each other -
/// modelled here with a reader/writer lock standing in for the spinlock the
/// original design uses, since kernel-style spinlocks have no idiomatic
/// user-space equivalent with the same semantics.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: RwLock<BTreeMap<Pid, ProcessEntry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        ProcessRegistry {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Inserts `entry`. Fails with `DuplicateObject` if the pid is already present.
    pub fn add_entry(&self, entry: ProcessEntry) -> Result<()> {
        let mut map = self.entries.write();
        if map.contains_key(&entry.pid) {
            return Err(Error::DuplicateObject);
        }
        map.insert(entry.pid, entry);
        Ok(())
    }

    pub fn find_entry(&self, pid: Pid) -> Option<ProcessEntry> {
        self.entries.read().get(&pid).cloned()
    }

    /// Applies `mutator` to the entry for `pid` in place, returning its result.
    pub fn with_entry_mut<R>(&self, pid: Pid, mutator: impl FnOnce(&mut ProcessEntry) -> R) -> Option<R> {
        let mut map = self.entries.write();
        map.get_mut(&pid).map(mutator)
    }

    /// Removes the entry for `pid`. Any remaining entry whose parent
    /// identifier equalled `pid` has its parent identifier cleared.
    pub fn delete_entry(&self, pid: Pid) -> Option<ProcessEntry> {
        let mut map = self.entries.write();
        let removed = map.remove(&pid);
        if removed.is_some() {
            for entry in map.values_mut() {
                if entry.parent_pid == Some(pid) {
                    entry.parent_pid = None;
                }
            }
        }
        removed
    }

    pub fn delete_entry_by_id(&self, pid: Pid) -> bool {
        self.delete_entry(pid).is_some()
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&ProcessEntry)) {
        for entry in self.entries.read().values() {
            visitor(entry);
        }
    }

    /// Resolves the parent entry of `entry`, or `None` if the parent
    /// identifier is unset or the parent has since departed.
    pub fn get_parent_entry(&self, entry: &ProcessEntry) -> Option<ProcessEntry> {
        let parent_pid = entry.parent_pid?;
        self.entries.read().get(&parent_pid).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn reset(&self) {
        self.entries.write().clear();
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.entries.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_set::ImageName;
    use crate::process::entry::SplittingStatus;

    fn entry(pid: Pid, parent: Option<Pid>) -> ProcessEntry {
        ProcessEntry::new(pid, parent, ImageName::new("\\Device\\App.exe"), SplittingStatus::Off)
    }

    #[test]
    fn duplicate_pid_rejected() {
        let registry = ProcessRegistry::new();
        registry.add_entry(entry(1, None)).unwrap();
        assert!(matches!(registry.add_entry(entry(1, None)), Err(Error::DuplicateObject)));
    }

    #[test]
    fn delete_clears_child_parent_refs() {
        let registry = ProcessRegistry::new();
        registry.add_entry(entry(1, None)).unwrap();
        registry.add_entry(entry(2, Some(1))).unwrap();

        registry.delete_entry(1);

        let child = registry.find_entry(2).unwrap();
        assert_eq!(child.parent_pid, None);
    }

    #[test]
    fn get_parent_entry_resolves_live_parent_only() {
        let registry = ProcessRegistry::new();
        registry.add_entry(entry(1, None)).unwrap();
        registry.add_entry(entry(2, Some(1))).unwrap();

        let child = registry.find_entry(2).unwrap();
        assert!(registry.get_parent_entry(&child).is_some());

        registry.delete_entry(1);
        let child = registry.find_entry(2).unwrap();
        assert!(registry.get_parent_entry(&child).is_none());
    }

    #[test]
    fn at_most_one_entry_per_pid() {
        let registry = ProcessRegistry::new();
        registry.add_entry(entry(1, None)).unwrap();
        let _ = registry.add_entry(entry(1, None));
        assert_eq!(registry.len(), 1);
    }
}
