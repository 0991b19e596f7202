//! Process-wide controller configuration
//!
//! Built once from command-line flags and validated before the controller
//! starts. Nothing here changes for the lifetime of the process.

use scan_pilot_core::DefaultPlugins;
use std::time::Duration;
use thiserror::Error;

/// Default requeue interval between passes
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration errors found at start-up
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("invalid default plugin name {0:?}")]
    InvalidPluginName(String),

    #[error("requeue interval must be at least one second")]
    RequeueTooShort,
}

/// Settings shared by every reconciliation
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Plugins run when a ClusterScan lists none
    pub default_plugins: DefaultPlugins,
    /// Image of the sidecar that turns plugin results into ClusterIssues
    pub worker_image: String,
    /// ServiceAccount the plugin Jobs run as, created in each scan namespace
    pub service_account_name: String,
    /// ClusterRoleBinding granting the plugin ServiceAccounts their role
    pub cluster_role_binding_name: String,
    /// ClusterRole referenced by the binding
    pub cluster_role_name: String,
    pub requeue_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_plugins: DefaultPlugins::new(
                "scan-pilot-system",
                vec!["popeye".to_string(), "marvin".to_string()],
            ),
            worker_image: "ghcr.io/scan-pilot/worker:latest".to_string(),
            service_account_name: "scan-pilot-plugins".to_string(),
            cluster_role_binding_name: "scan-pilot-plugins".to_string(),
            cluster_role_name: "scan-pilot-plugins".to_string(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}

impl ControllerConfig {
    /// Check the configuration once at start-up
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("default plugin namespace", &self.default_plugins.namespace),
            ("worker image", &self.worker_image),
            ("service account name", &self.service_account_name),
            ("cluster role binding name", &self.cluster_role_binding_name),
            ("cluster role name", &self.cluster_role_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(field));
            }
        }

        if let Some(name) = self
            .default_plugins
            .names
            .iter()
            .find(|n| !is_dns_label(n))
        {
            return Err(ConfigError::InvalidPluginName(name.clone()));
        }

        if self.requeue_interval < Duration::from_secs(1) {
            return Err(ConfigError::RequeueTooShort);
        }

        Ok(())
    }
}

/// RFC 1123 label: plugin names end up in CronJob names
fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
