//! Kubernetes-style status conditions
//!
//! Conditions are kept in an ordered map keyed by condition type. On the wire
//! they are still a plain list, so the CRD schema looks like every other
//! `status.conditions` field.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type reporting overall readiness
pub const READY: &str = "Ready";

/// Tri-state condition status, serialized as "True", "False" or "Unknown"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single observation about a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    pub last_transition_time: DateTime<Utc>,
    /// CamelCase reason code
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Conditions keyed by type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions(BTreeMap<String, Condition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.get(type_)
    }

    /// True only when the condition exists and its status is `True`
    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.values()
    }

    /// Set a condition, returning whether its status changed.
    ///
    /// A new condition counts as changed. The transition time only moves when
    /// the status does; reason, message and generation are always refreshed.
    pub fn set(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> bool {
        let status = ConditionStatus::from(status);
        match self.0.get_mut(type_) {
            Some(existing) => {
                let changed = existing.status != status;
                if changed {
                    existing.status = status;
                    existing.last_transition_time = now;
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.observed_generation = observed_generation;
                changed
            }
            None => {
                self.0.insert(
                    type_.to_string(),
                    Condition {
                        type_: type_.to_string(),
                        status,
                        observed_generation,
                        last_transition_time: now,
                        reason: reason.to_string(),
                        message: message.to_string(),
                    },
                );
                true
            }
        }
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        Conditions(list.into_iter().map(|c| (c.type_.clone(), c)).collect())
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.0.into_values().collect()
    }
}
