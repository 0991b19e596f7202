//! Custom resources read by the scan controller
//!
//! `Cluster`, `Plugin` and `ClusterIssue` are owned by other components;
//! the controller only reads them. `ClusterScan` lives in [`crate::scan`].

use crate::conditions::{Conditions, READY};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of every scan-pilot resource
pub const GROUP: &str = "scanpilot.io";

/// Label carrying the scan ID (the Job UID) on issues
pub const LABEL_SCAN_ID: &str = "scanpilot.io/scan-id";
/// Label carrying the plugin name
pub const LABEL_PLUGIN: &str = "scanpilot.io/plugin";
/// Label carrying the cluster name
pub const LABEL_CLUSTER: &str = "scanpilot.io/cluster";
/// Label carrying the ClusterScan name
pub const LABEL_CLUSTER_SCAN: &str = "scanpilot.io/cluster-scan";

/// Default key of the kubeconfig inside its Secret
pub const DEFAULT_KUBECONFIG_KEY: &str = "value";

/// ClusterSpec describes how to reach a registered cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[kube(
    group = "scanpilot.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "cl",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Issues","type":"integer","jsonPath":".status.totalIssues"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Secret holding the kubeconfig for the cluster.
    ///
    /// When unset the cluster is scanned with the in-cluster service account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_ref: Option<KubeconfigRef>,
}

/// Reference to a kubeconfig stored in a Secret of the cluster's namespace
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigRef {
    pub name: String,
    #[serde(default = "default_kubeconfig_key")]
    pub key: String,
}

fn default_kubeconfig_key() -> String {
    DEFAULT_KUBECONFIG_KEY.to_string()
}

/// ClusterStatus is maintained by the cluster reconciler.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    #[schemars(with = "Vec<crate::conditions::Condition>")]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_issues: Option<i64>,
}

impl Cluster {
    /// Whether the cluster reports `Ready=True`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.is_true(READY))
            .unwrap_or(false)
    }

    /// Reason and message of the Ready condition, for not-ready reporting
    pub fn readiness_detail(&self) -> (String, String) {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.get(READY))
            .map(|c| (c.reason.clone(), c.message.clone()))
            .unwrap_or_else(|| ("Unknown".to_string(), "cluster has no Ready condition".to_string()))
    }
}

/// Kind of findings a plugin reports
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    #[default]
    Misconfiguration,
    Vulnerability,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Misconfiguration => "misconfiguration",
            PluginType::Vulnerability => "vulnerability",
        }
    }
}

/// PluginSpec describes how to run a scanner.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[kube(
    group = "scanpilot.io",
    version = "v1alpha1",
    kind = "Plugin",
    namespaced,
    shortname = "plug",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, rename = "type")]
    pub plugin_type: PluginType,
}

/// Plain name/value environment variable
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// ClusterIssueSpec is one finding written by a plugin's worker.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[kube(
    group = "scanpilot.io",
    version = "v1alpha1",
    kind = "ClusterIssue",
    namespaced,
    shortname = "issue",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Severity","type":"string","jsonPath":".spec.severity"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssueSpec {
    pub id: String,
    pub message: String,
    pub severity: String,
    #[serde(default)]
    pub category: String,
    pub cluster: String,
    #[serde(default)]
    pub total_resources: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
