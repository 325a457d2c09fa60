// Extension registry
//
// The ordered set of installed extensions owned by the manager. Order is
// install order; it drives teardown in uninstall_all.

use std::cell::RefCell;

use super::types::ExtensionInfo;

#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    entries: Vec<ExtensionInfo>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionInfo> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Add `info` at the end, replacing an entry with the same name.
    /// Returns the replaced entry.
    pub fn insert(&mut self, info: ExtensionInfo) -> Option<ExtensionInfo> {
        let previous = self.remove(&info.name);
        self.entries.push(info);
        previous
    }

    pub fn remove(&mut self, name: &str) -> Option<ExtensionInfo> {
        let idx = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(idx))
    }

    pub fn list(&self) -> Vec<ExtensionInfo> {
        self.entries.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Names of registered extensions that declare `name` as a dependency.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.dependencies.contains_key(name))
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read access to installed extensions, handed to the loader so it can
/// resolve cross-extension requires without owning the registry.
pub trait ExtensionDirectory {
    fn extension(&self, name: &str) -> Option<ExtensionInfo>;

    /// Every extension a require may reach.
    fn names(&self) -> Vec<String>;
}

impl ExtensionDirectory for RefCell<ExtensionRegistry> {
    fn extension(&self, name: &str) -> Option<ExtensionInfo> {
        self.borrow().get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.borrow().names()
    }
}
