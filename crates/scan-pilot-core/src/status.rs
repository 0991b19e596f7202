//! ClusterScan status: per-plugin entries and their aggregate
//!
//! The aggregate fields of [`ClusterScanStatus`] are a pure function of the
//! `plugins` map. [`ClusterScanStatus::sync`] recomputes them from scratch on
//! every pass, so there is nothing to drift.

use crate::conditions::{Conditions, READY};
use crate::crd::{ClusterIssue, LABEL_SCAN_ID};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Outcome of a plugin run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ScanStatus {
    Active,
    Complete,
    Failed,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Active => write!(f, "Active"),
            ScanStatus::Complete => write!(f, "Complete"),
            ScanStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed state of one plugin of a ClusterScan
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginScanStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_finished_time: Option<DateTime<Utc>>,
    /// Only ever set from a run that finished `Complete`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastScanID", skip_serializing_if = "Option::is_none")]
    pub last_scan_id: Option<String>,
    #[serde(
        default,
        rename = "lastSuccessfulScanID",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_successful_scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ScanStatus>,
    /// `Complete` or `Failed`, never `Active`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_finished_status: Option<ScanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_count: Option<i64>,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub schedule: String,
}

/// Observed state of a ClusterScan
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScanStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    #[schemars(with = "Vec<crate::conditions::Condition>")]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    // Aggregates, recomputed by `sync`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_finished_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ScanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_finished_status: Option<ScanStatus>,
    /// Sorted, comma separated keys of `plugins`
    #[serde(default)]
    pub plugin_names: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_issues: Option<i64>,
    #[serde(default)]
    pub suspend: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, PluginScanStatus>,
}

fn latest(acc: Option<DateTime<Utc>>, value: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (acc, value) {
        (Some(a), Some(v)) => Some(a.max(v)),
        (a, v) => a.or(v),
    }
}

fn soonest(acc: Option<DateTime<Utc>>, value: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (acc, value) {
        (Some(a), Some(v)) => Some(a.min(v)),
        (a, v) => a.or(v),
    }
}

impl ClusterScanStatus {
    /// Status entry of a plugin, created empty on first use
    pub fn plugin_mut(&mut self, name: &str) -> &mut PluginScanStatus {
        self.plugins.entry(name.to_string()).or_default()
    }

    /// Recompute every aggregate field from `plugins`.
    ///
    /// `suspend` is the effective suspend flag of the scan: true while the
    /// cluster is not ready, the scan's own flag otherwise.
    pub fn sync(&mut self, suspend: bool) {
        let mut last_schedule_time = None;
        let mut next_schedule_time = None;
        let mut last_finished_time = None;
        let mut last_successful_time = None;
        let mut active = 0usize;
        let mut failed = 0usize;
        let mut complete = 0usize;

        for plugin in self.plugins.values() {
            last_schedule_time = latest(last_schedule_time, plugin.last_schedule_time);
            next_schedule_time = soonest(next_schedule_time, plugin.next_schedule_time);
            last_finished_time = latest(last_finished_time, plugin.last_finished_time);
            last_successful_time = latest(last_successful_time, plugin.last_successful_time);

            if plugin.last_status == Some(ScanStatus::Active) {
                active += 1;
            }
            match plugin.last_finished_status {
                Some(ScanStatus::Failed) => failed += 1,
                Some(ScanStatus::Complete) => complete += 1,
                _ => {}
            }
        }

        let last_finished_status = if failed > 0 {
            Some(ScanStatus::Failed)
        } else if complete > 0 {
            Some(ScanStatus::Complete)
        } else {
            None
        };

        self.last_schedule_time = last_schedule_time;
        self.next_schedule_time = next_schedule_time;
        self.last_finished_time = last_finished_time;
        self.last_successful_time = last_successful_time;
        self.last_finished_status = last_finished_status;
        self.last_status = if active > 0 {
            Some(ScanStatus::Active)
        } else {
            last_finished_status
        };
        // BTreeMap keys are already sorted
        self.plugin_names = self
            .plugins
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.suspend = suspend;
    }

    /// Scan IDs of the last successful run of every plugin
    pub fn last_successful_scan_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .plugins
            .values()
            .filter_map(|p| p.last_successful_scan_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Set per-plugin and total issue counts from issues labelled with scan IDs.
    ///
    /// Plugins without issues have their count unset, and so does the total
    /// when no plugin has any.
    pub fn count_issues(&mut self, issues: &[ClusterIssue]) {
        let mut by_scan: HashMap<&str, i64> = HashMap::new();
        for issue in issues {
            if let Some(scan_id) = issue.labels().get(LABEL_SCAN_ID) {
                *by_scan.entry(scan_id.as_str()).or_default() += 1;
            }
        }

        let mut total = 0;
        for plugin in self.plugins.values_mut() {
            let count = plugin
                .last_successful_scan_id
                .as_deref()
                .and_then(|id| by_scan.get(id))
                .copied()
                .unwrap_or(0);
            plugin.issue_count = (count > 0).then_some(count);
            total += count;
        }
        self.total_issues = (total > 0).then_some(total);
    }

    /// Set the Ready condition, returning whether its status changed
    pub fn set_ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let generation = self.observed_generation;
        self.conditions
            .set(READY, ready, reason, message, generation, now)
    }
}
