//! ST-007: Path-addressed plugin table shared by the hook and lookup registries.
//!
//! Implementations are registered at startup under a dotted path
//! (`strata.hooks.command`). Configuration names them by a path string that is
//! tried verbatim first, then under each search-path prefix in order.

use crate::error::ConfigError;
use std::collections::HashMap;

#[derive(Clone)]
pub struct PluginTable<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for PluginTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone> PluginTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation. Paths are unique.
    pub fn insert(&mut self, path: &str, item: T) -> Result<(), ConfigError> {
        if self.entries.contains_key(path) {
            return Err(ConfigError::DuplicateRegistration(path.to_string()));
        }
        self.entries.insert(path.to_string(), item);
        Ok(())
    }

    /// Resolve a configured path against the search path.
    pub fn resolve(&self, path: &str, search_path: &[String]) -> Option<T> {
        if let Some(item) = self.entries.get(path) {
            return Some(item.clone());
        }
        search_path
            .iter()
            .map(|prefix| format!("{}.{}", prefix.trim_end_matches('.'), path))
            .find_map(|candidate| self.entries.get(&candidate).cloned())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl<T> FromIterator<(String, T)> for PluginTable<T> {
    /// Builds a table from distinct paths; a repeated path keeps the last item.
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
