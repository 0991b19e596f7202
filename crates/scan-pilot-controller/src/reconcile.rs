//! ClusterScan reconciliation
//!
//! One pass: finalizer bookkeeping, cluster lookup, RBAC, one CronJob per
//! plugin, issue counting and a single status write at the end.

use crate::client::{EventSeverity, KubeClient};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::kubeconfig::resolve_kubeconfig;
use crate::rbac::ensure_rbac;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use scan_pilot_core::crd::LABEL_CLUSTER;
use scan_pilot_core::{Cluster, ClusterScan, ClusterScanStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Finalizer held on every ClusterScan until its cleanup ran
pub const FINALIZER: &str = "scanpilot.io/finalizer";

/// Requeue delay after losing a status write race
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue delay while the referenced Cluster is missing or not ready
const CLUSTER_UNAVAILABLE_REQUEUE: Duration = Duration::from_secs(60);

/// Extra work done when a ClusterScan is deleted
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn cleanup(&self, scan: &ClusterScan) -> Result<()>;
}

/// Shared state of the reconciler
pub struct Context {
    pub kube: Arc<dyn KubeClient>,
    pub config: ControllerConfig,
    pub cleanup: Option<Arc<dyn CleanupHook>>,
}

impl Context {
    pub fn new(kube: Arc<dyn KubeClient>, config: ControllerConfig) -> Self {
        Self {
            kube,
            config,
            cleanup: None,
        }
    }
}

fn has_finalizer(scan: &ClusterScan) -> bool {
    scan.finalizers().iter().any(|f| f == FINALIZER)
}

fn is_linked(scan: &ClusterScan, cluster: &Cluster) -> bool {
    let owned = cluster
        .meta()
        .uid
        .as_deref()
        .is_some_and(|uid| scan.owner_references().iter().any(|o| o.uid == uid));
    owned && scan.labels().get(LABEL_CLUSTER) == Some(&cluster.name_any())
}

/// Reconcile a ClusterScan
#[instrument(skip(scan, ctx), fields(scan = %scan.name_any(), namespace = %scan.namespace().unwrap_or_default()))]
pub async fn reconcile(scan: Arc<ClusterScan>, ctx: Arc<Context>) -> Result<Action> {
    let kube = ctx.kube.as_ref();

    if scan.meta().deletion_timestamp.is_some() {
        if has_finalizer(&scan) {
            info!("ClusterScan is being deleted");
            if let Some(hook) = &ctx.cleanup {
                if let Err(e) = hook.cleanup(&scan).await {
                    warn!(error = %e, "Cleanup failed");
                }
            }
            kube.remove_finalizer(&scan, FINALIZER).await?;
        }
        return Ok(Action::await_change());
    }

    let mut scan = if has_finalizer(&scan) {
        (*scan).clone()
    } else {
        debug!("Adding finalizer");
        kube.add_finalizer(&scan, FINALIZER).await?
    };

    let mut status = scan.status.clone().unwrap_or_default();
    status.observed_generation = scan.meta().generation;
    let now = Utc::now();

    let mut cluster_problem = None;
    let aborted = run_pass(kube, &ctx.config, &mut scan, &mut status, &mut cluster_problem, now)
        .await
        .err();
    // The aggregate follows the plugin map even when the pass stopped early
    status.sync(cluster_problem.is_some() || scan.spec.is_suspended());

    // The cluster is checked first, so its problem wins over a later abort
    let failure = match (cluster_problem, aborted) {
        (Some(problem), Some(abort)) => {
            warn!(error = %abort, "Pass aborted after cluster problem");
            Some(problem)
        }
        (problem, abort) => problem.or(abort),
    };

    let (ready, reason, message) = match &failure {
        None => (
            true,
            "ClusterScanReconciled".to_string(),
            format!("Scanning plugins: {}", status.plugin_names),
        ),
        Some(e) => (false, e.reason().to_string(), e.to_string()),
    };
    if status.set_ready(ready, &reason, &message, now) {
        let severity = if ready {
            EventSeverity::Normal
        } else {
            EventSeverity::Warning
        };
        if let Err(e) = kube.publish_event(&scan, severity, &reason, &message).await {
            warn!(error = %e, "Failed to publish event");
        }
    }

    scan.status = Some(status);
    if let Err(e) = kube.replace_status(&scan).await {
        if e.is_conflict() {
            debug!("Status changed underneath us, retrying");
            return Ok(Action::requeue(CONFLICT_REQUEUE));
        }
        return match failure {
            Some(failure) => {
                warn!(error = %e, "Failed to persist status");
                Err(failure)
            }
            None => Err(e),
        };
    }

    match failure {
        None => {
            info!(%message, "Reconciled");
            Ok(Action::requeue(ctx.config.requeue_interval))
        }
        Some(failure) => Err(failure),
    }
}

/// Everything between the finalizer and the status write.
///
/// A missing or unready cluster does not abort: it is stored in
/// `cluster_problem` and the CronJobs are applied suspended.
async fn run_pass(
    kube: &dyn KubeClient,
    config: &ControllerConfig,
    scan: &mut ClusterScan,
    status: &mut ClusterScanStatus,
    cluster_problem: &mut Option<Error>,
    now: DateTime<Utc>,
) -> Result<()> {
    let namespace = scan
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let cluster_name = scan.spec.cluster_ref.name.clone();

    let kubeconfig = match kube.get_cluster(&namespace, &cluster_name).await? {
        None => {
            warn!(cluster = %cluster_name, "Cluster not found");
            *cluster_problem = Some(Error::ClusterNotFound(cluster_name.clone()));
            None
        }
        Some(cluster) => {
            if !cluster.is_ready() {
                let (reason, message) = cluster.readiness_detail();
                warn!(cluster = %cluster_name, %reason, "Cluster not ready");
                *cluster_problem = Some(Error::ClusterNotReady {
                    name: cluster_name.clone(),
                    reason,
                    message,
                });
            }
            let kubeconfig = resolve_kubeconfig(kube, &cluster).await?;
            if !is_linked(scan, &cluster) {
                debug!(cluster = %cluster_name, "Linking ClusterScan to Cluster");
                let updated = kube.link_to_cluster(scan, &cluster).await?;
                *scan = updated;
            }
            kubeconfig
        }
    };
    let cluster_ready = cluster_problem.is_none();

    ensure_rbac(kube, config, &namespace).await?;

    let plugins = config.default_plugins.resolve(&scan.spec.plugins);
    let scheduler = Scheduler {
        kube,
        config,
        scan,
        cluster_name: &cluster_name,
        cluster_ready,
        kubeconfig: kubeconfig.as_ref(),
    };
    for reference in &plugins {
        scheduler.schedule(reference, status, now).await?;
    }
    scheduler.cleanup_stale(&plugins, status).await;

    let issues = kube
        .list_issues(&namespace, &status.last_successful_scan_ids())
        .await?;
    status.count_issues(&issues);

    Ok(())
}

/// Requeue policy for failed passes
pub fn error_policy(scan: Arc<ClusterScan>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(scan = %scan.name_any(), reason = error.reason(), error = %error, "Reconciliation failed");
    if error.is_cluster_unavailable() {
        Action::requeue(CLUSTER_UNAVAILABLE_REQUEUE)
    } else {
        Action::requeue(ctx.config.requeue_interval)
    }
}
