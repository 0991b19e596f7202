//! ClusterScan custom resource

use crate::crd::EnvVar;
use crate::status::ClusterScanStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default number of successful Jobs kept per plugin
pub const DEFAULT_SUCCESSFUL_HISTORY_LIMIT: i32 = 3;
/// Default number of failed Jobs kept per plugin
pub const DEFAULT_FAILED_HISTORY_LIMIT: i32 = 1;

/// ClusterScanSpec declares which plugins run against a cluster, and when.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[kube(
    group = "scanpilot.io",
    version = "v1alpha1",
    kind = "ClusterScan",
    namespaced,
    status = "ClusterScanStatus",
    shortname = "cscan",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterRef.name"}"#,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Suspend","type":"boolean","jsonPath":".status.suspend"}"#,
    printcolumn = r#"{"name":"Plugins","type":"string","jsonPath":".status.pluginNames"}"#,
    printcolumn = r#"{"name":"Last Status","type":"string","jsonPath":".status.lastStatus"}"#,
    printcolumn = r#"{"name":"Issues","type":"integer","jsonPath":".status.totalIssues"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScanSpec {
    pub cluster_ref: ClusterReference,
    /// Cron expression applied to every plugin without its own schedule
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// Plugins to run; empty means the process-wide defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_scans_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_scans_history_limit: Option<i32>,
}

/// Name of the Cluster, in the ClusterScan's namespace
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
pub struct ClusterReference {
    pub name: String,
}

/// A plugin to run, plus per-use overrides
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

impl PluginReference {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
            ..Default::default()
        }
    }

    /// Namespace and name of the Plugin, defaulting to `default_namespace`
    pub fn namespaced_key<'a>(&'a self, default_namespace: &'a str) -> (&'a str, &'a str) {
        (
            self.namespace.as_deref().unwrap_or(default_namespace),
            &self.name,
        )
    }
}

impl ClusterScanSpec {
    /// Whether the whole scan is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspend.unwrap_or(false)
    }

    /// Schedule of a plugin: its own override or the scan-wide one
    pub fn plugin_schedule<'a>(&'a self, plugin: &'a PluginReference) -> &'a str {
        plugin.schedule.as_deref().unwrap_or(&self.schedule)
    }

    /// Suspend flag of a plugin: its own override or the scan-wide one
    pub fn plugin_suspended(&self, plugin: &PluginReference) -> bool {
        plugin.suspend.unwrap_or_else(|| self.is_suspended())
    }

    pub fn successful_history_limit(&self) -> i32 {
        self.successful_scans_history_limit
            .unwrap_or(DEFAULT_SUCCESSFUL_HISTORY_LIMIT)
    }

    pub fn failed_history_limit(&self) -> i32 {
        self.failed_scans_history_limit
            .unwrap_or(DEFAULT_FAILED_HISTORY_LIMIT)
    }
}

/// Name of the CronJob running `plugin` for the ClusterScan `scan`
pub fn cronjob_name(scan: &str, plugin: &str) -> String {
    format!("{}-{}", scan, plugin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ClusterScanSpec {
        ClusterScanSpec {
            cluster_ref: ClusterReference {
                name: "prod".to_string(),
            },
            schedule: "0 * * * *".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn plugin_schedule_prefers_override() {
        let spec = spec();
        let mut plugin = PluginReference::new("popeye", None);
        assert_eq!(spec.plugin_schedule(&plugin), "0 * * * *");

        plugin.schedule = Some("*/5 * * * *".to_string());
        assert_eq!(spec.plugin_schedule(&plugin), "*/5 * * * *");
    }

    #[test]
    fn plugin_suspend_falls_back_to_scan() {
        let mut spec = spec();
        let mut plugin = PluginReference::new("popeye", None);
        assert!(!spec.plugin_suspended(&plugin));

        spec.suspend = Some(true);
        assert!(spec.plugin_suspended(&plugin));

        plugin.suspend = Some(false);
        assert!(!spec.plugin_suspended(&plugin));
    }

    #[test]
    fn namespaced_key_defaults_namespace() {
        let local = PluginReference::new("marvin", None);
        assert_eq!(local.namespaced_key("scans"), ("scans", "marvin"));

        let shared = PluginReference::new("marvin", Some("scan-system".to_string()));
        assert_eq!(shared.namespaced_key("scans"), ("scan-system", "marvin"));
    }

    #[test]
    fn history_limits_have_defaults() {
        let mut spec = spec();
        assert_eq!(spec.successful_history_limit(), 3);
        assert_eq!(spec.failed_history_limit(), 1);

        spec.failed_scans_history_limit = Some(5);
        assert_eq!(spec.failed_history_limit(), 5);
    }

    #[test]
    fn deserializes_camel_case() {
        let spec: ClusterScanSpec = serde_json::from_str(
            r#"{
                "clusterRef": {"name": "prod"},
                "schedule": "0 3 * * *",
                "plugins": [{"name": "kubescape", "suspend": true, "env": [{"name": "LOG_LEVEL", "value": "debug"}]}]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.cluster_ref.name, "prod");
        assert_eq!(spec.plugins[0].suspend, Some(true));
        assert_eq!(spec.plugins[0].env[0], EnvVar::new("LOG_LEVEL", "debug"));
    }
}
