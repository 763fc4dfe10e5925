use crate::error::{Error, Result};
use std::fmt;

/// A device-path image name, normalised to lower case.
///
/// Matching is byte-equal on the normalised form: length first, then bytes,
/// mirroring the registered-image comparison used by the driver's lookup
/// routines.
#[derive(Debug, Clone, Eq)]
pub struct ImageName(String);

impl ImageName {
    /// Normalises `raw` (lower-cases it) and wraps it.
    pub fn new(raw: &str) -> Self {
        ImageName(raw.to_lowercase())
    }

    /// Wraps `raw` without normalising it. Callers must guarantee `raw` is
    /// already in normalised form; used on paths at higher privilege levels
    /// where lower-casing is not a dispatch-level operation.
    pub fn from_normalized(raw: impl Into<String>) -> Self {
        ImageName(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds an [`ImageName`] from a `WCHAR` device path as it arrives in a
    /// real SET-CONFIGURATION/REGISTER-PROCESSES IOCTL buffer.
    #[cfg(windows)]
    pub fn from_wide(wide: &[u16]) -> Result<Self> {
        let s = widestring::U16Str::from_slice(wide)
            .to_string()
            .map_err(|_| Error::InvalidBuffer("image path is not valid utf-16"))?;
        Ok(ImageName::new(&s))
    }

    /// Encodes this name back to a nul-terminated `WCHAR` buffer, for a host
    /// writing it into a GET-CONFIGURATION response.
    #[cfg(windows)]
    pub fn to_wide(&self) -> widestring::U16CString {
        widestring::U16CString::from_str(&self.0).expect("normalised image names never contain an interior nul")
    }
}

impl PartialEq for ImageName {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0 == other.0
    }
}

impl std::hash::Hash for ImageName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered set of image names marked for splitting.
///
/// Duplicates are never stored. The set is only mutated from the serialised
/// request-handling path or during initial construction.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    entries: Vec<ImageName>,
}

impl ImageSet {
    pub fn new() -> Self {
        ImageSet {
            entries: Vec::new(),
        }
    }

    /// Builds a set from a user-provided list. Rejects an empty list.
    pub fn try_from_list(names: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut set = ImageSet::new();
        for name in names {
            set.add_entry(&name);
        }
        if set.is_empty() {
            return Err(Error::InvalidArgument("configuration must list at least one image"));
        }
        Ok(set)
    }

    /// Normalises and inserts `name`, skipping it if already present.
    pub fn add_entry(&mut self, name: &str) {
        self.add_entry_exact(ImageName::new(name));
    }

    /// Inserts a pre-normalised image name, skipping it if already present.
    pub fn add_entry_exact(&mut self, name: ImageName) {
        if !self.has_entry_exact(&name) {
            self.entries.push(name);
        }
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.has_entry_exact(&ImageName::new(name))
    }

    pub fn has_entry_exact(&self, name: &ImageName) -> bool {
        self.entries.iter().any(|entry| entry == name)
    }

    pub fn remove_entry(&mut self, name: &ImageName) {
        self.entries.retain(|entry| entry != name);
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&ImageName)) {
        for entry in &self.entries {
            visitor(entry);
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn normalisation_is_idempotent_prop(raw: String) -> bool {
        let once = ImageName::new(&raw);
        let twice = ImageName::new(once.as_str());
        once == twice
    }

    #[quickcheck]
    fn add_entry_is_idempotent_prop(raw: String) -> bool {
        let mut once = ImageSet::new();
        once.add_entry(&raw);
        let mut twice = once.clone();
        twice.add_entry(&raw);
        once.len() == twice.len()
    }

    #[test]
    fn normalisation_lowercases() {
        let name = ImageName::new("\\Device\\HarddiskVolume1\\App.exe");
        assert_eq!(name.as_str(), "\\device\\harddiskvolume1\\app.exe");
    }

    #[test]
    fn normalisation_is_idempotent() {
        let once = ImageName::new("\\Device\\App.EXE");
        let twice = ImageName::new(once.as_str());
        assert_eq!(once, twice);
    }

    #[test]
    fn add_entry_deduplicates() {
        let mut set = ImageSet::new();
        set.add_entry("\\Device\\App.exe");
        set.add_entry("\\Device\\APP.EXE");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn empty_list_rejected() {
        let result = ImageSet::try_from_list(Vec::<String>::new());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn round_trip_membership() {
        let set = ImageSet::try_from_list(vec![
            "\\Device\\A.exe".to_string(),
            "\\Device\\B.exe".to_string(),
        ])
        .unwrap();
        assert!(set.has_entry("\\Device\\a.exe"));
        assert!(set.has_entry("\\Device\\B.exe"));
        assert!(!set.has_entry("\\Device\\C.exe"));
    }
}
