//! Plugin reference resolution

use crate::scan::PluginReference;

/// Plugins run by ClusterScans that don't list any
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultPlugins {
    /// Namespace the default Plugin resources live in
    pub namespace: String,
    pub names: Vec<String>,
}

impl DefaultPlugins {
    pub fn new(namespace: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            names,
        }
    }

    /// Plugins a ClusterScan runs.
    ///
    /// An explicit list is used as-is; the defaults are never merged into it.
    pub fn resolve(&self, explicit: &[PluginReference]) -> Vec<PluginReference> {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        self.names
            .iter()
            .map(|name| PluginReference::new(name.clone(), Some(self.namespace.clone())))
            .collect()
    }
}
