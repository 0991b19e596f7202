//! scan-pilot-core: scan scheduling and status aggregation logic
//!
//! Everything in this crate is free of I/O. The controller crate feeds it
//! objects fetched from the API server and persists what it returns.

pub mod conditions;
pub mod crd;
pub mod errparse;
pub mod error;
pub mod job;
pub mod plugins;
pub mod scan;
pub mod schedule;
pub mod status;

pub use conditions::{Condition, ConditionStatus, Conditions, READY};
pub use crd::{Cluster, ClusterIssue, ClusterIssueSpec, ClusterSpec, ClusterStatus, EnvVar, Plugin, PluginSpec};
pub use error::{ErrParseError, ScheduleError};
pub use job::{JobOutcome, classify, latest_job};
pub use plugins::DefaultPlugins;
pub use scan::{ClusterReference, ClusterScan, ClusterScanSpec, PluginReference, cronjob_name};
pub use status::{ClusterScanStatus, PluginScanStatus, ScanStatus};
