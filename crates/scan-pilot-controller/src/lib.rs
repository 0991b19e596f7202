//! scan-pilot-controller: Kubernetes side of scan-pilot
//!
//! Watches ClusterScans and keeps one CronJob per scanner plugin in sync
//! with them, reporting run outcomes and issue counts back in the status.

pub mod client;
pub mod config;
pub mod controller;
pub mod cronjob;
pub mod error;
pub mod kubeconfig;
pub mod rbac;
pub mod reconcile;
pub mod scheduler;

pub use client::{KubeClient, KubeClientImpl};
pub use config::{ConfigError, ControllerConfig};
pub use controller::run;
pub use error::{Error, Result};
pub use reconcile::{CleanupHook, Context, FINALIZER};
