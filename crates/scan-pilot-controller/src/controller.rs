//! Controller wiring: watches, work queue and the reconcile loop

use crate::client::KubeClientImpl;
use crate::config::ControllerConfig;
use crate::reconcile::{Context, error_policy, reconcile};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::CronJob;
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use scan_pilot_core::{Cluster, ClusterScan};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// ClusterScans in the Cluster's namespace that reference it
fn scans_for_cluster(scans: &[Arc<ClusterScan>], cluster: &Cluster) -> Vec<ObjectRef<ClusterScan>> {
    let namespace = cluster.namespace();
    let name = cluster.name_any();
    scans
        .iter()
        .filter(|scan| scan.namespace() == namespace && scan.spec.cluster_ref.name == name)
        .map(|scan| ObjectRef::from_obj(scan.as_ref()))
        .collect()
}

/// Run the ClusterScan controller until a shutdown signal arrives
pub async fn run(client: Client, config: ControllerConfig) {
    let scans: Api<ClusterScan> = Api::all(client.clone());
    let cronjobs: Api<CronJob> = Api::all(client.clone());
    let clusters: Api<Cluster> = Api::all(client.clone());

    let ctx = Arc::new(Context::new(
        Arc::new(KubeClientImpl::new(client)),
        config,
    ));

    let controller = Controller::new(scans, WatcherConfig::default());
    let store = controller.store();

    info!("Starting ClusterScan controller");
    controller
        .owns(cronjobs, WatcherConfig::default())
        .watches(clusters, WatcherConfig::default(), move |cluster| {
            scans_for_cluster(&store.state(), &cluster)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(scan = %obj.name, ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconciliation failed"),
            }
        })
        .await;
    info!("ClusterScan controller stopped");
}
