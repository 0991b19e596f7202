//! Kubernetes API access for the ClusterScan controller
//!
//! Every call the reconciler makes goes through [`KubeClient`], so tests can
//! swap the API server for a mock.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use scan_pilot_core::crd::{LABEL_CLUSTER, LABEL_SCAN_ID};
use scan_pilot_core::{Cluster, ClusterIssue, ClusterScan, Plugin};
use std::collections::BTreeMap;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Field manager used for server-side apply and the event reporter
pub const MANAGER: &str = "scan-pilot";

/// Label put on every object the controller creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Severity of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Operations the reconciler needs from the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Cluster, `None` if it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Get a Plugin, `None` if it does not exist
    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<Plugin>>;

    /// Add a finalizer to a ClusterScan, returning the updated object
    async fn add_finalizer(&self, scan: &ClusterScan, finalizer: &str) -> Result<ClusterScan>;

    /// Remove a finalizer from a ClusterScan
    async fn remove_finalizer(&self, scan: &ClusterScan, finalizer: &str) -> Result<()>;

    /// Make the Cluster an owner of the ClusterScan and label the scan with it,
    /// returning the updated object
    async fn link_to_cluster(&self, scan: &ClusterScan, cluster: &Cluster)
        -> Result<ClusterScan>;

    /// Create or update a ServiceAccount
    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()>;

    /// Get a ClusterRoleBinding, `None` if it does not exist
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;

    /// Create a ClusterRoleBinding
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Replace a ClusterRoleBinding; fails with a conflict if it changed since read
    async fn replace_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Create or update a CronJob, returning the stored object
    async fn apply_cronjob(&self, cronjob: &CronJob) -> Result<CronJob>;

    /// Delete a CronJob and its Jobs; a missing CronJob is not an error
    async fn delete_cronjob(&self, namespace: &str, name: &str) -> Result<()>;

    /// Jobs whose owner reference points at `owner_uid`
    async fn list_owned_jobs(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Job>>;

    /// Logs of `container` in the most recent pod of a Job
    async fn job_logs(&self, namespace: &str, job_name: &str, container: &str)
        -> Result<Vec<u8>>;

    /// ClusterIssues labelled with any of the given scan IDs
    async fn list_issues(&self, namespace: &str, scan_ids: &[String])
        -> Result<Vec<ClusterIssue>>;

    /// Replace the status of a ClusterScan, guarded by its resourceVersion
    async fn replace_status(&self, scan: &ClusterScan) -> Result<()>;

    /// Publish an event about a ClusterScan
    async fn publish_event(
        &self,
        scan: &ClusterScan,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`KubeClient`] backed by a real API server
pub struct KubeClientImpl {
    client: Client,
    recorder: Recorder,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    fn scans(&self, namespace: &str) -> Api<ClusterScan> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scan_namespace(scan: &ClusterScan) -> Result<String> {
        scan.namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<Plugin>> {
        let api: Api<Plugin> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn add_finalizer(&self, scan: &ClusterScan, finalizer: &str) -> Result<ClusterScan> {
        let mut finalizers = scan.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(scan.clone());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        let patched = self
            .scans(&Self::scan_namespace(scan)?)
            .patch(&scan.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(patched)
    }

    async fn remove_finalizer(&self, scan: &ClusterScan, finalizer: &str) -> Result<()> {
        let finalizers: Vec<&String> = scan
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        match self
            .scans(&Self::scan_namespace(scan)?)
            .patch(&scan.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // already gone
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn link_to_cluster(&self, scan: &ClusterScan, cluster: &Cluster) -> Result<ClusterScan> {
        let owner = cluster
            .owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        let mut owners = scan.owner_references().to_vec();
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner);
        }

        let labels = BTreeMap::from([(LABEL_CLUSTER.to_string(), cluster.name_any())]);

        let patch = serde_json::json!({
            "metadata": {
                "ownerReferences": owners,
                "labels": labels,
            }
        });
        let patched = self
            .scans(&Self::scan_namespace(scan)?)
            .patch(&scan.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(patched)
    }

    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()> {
        let namespace = account
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &account.name_any(),
            &PatchParams::apply(MANAGER).force(),
            &Patch::Apply(account),
        )
        .await?;
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn replace_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.replace(&binding.name_any(), &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn apply_cronjob(&self, cronjob: &CronJob) -> Result<CronJob> {
        let namespace = cronjob
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &namespace);
        let applied = api
            .patch(
                &cronjob.name_any(),
                &PatchParams::apply(MANAGER).force(),
                &Patch::Apply(cronjob),
            )
            .await?;
        Ok(applied)
    }

    async fn delete_cronjob(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(cronjob = %name, "CronJob already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_owned_jobs(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGER));
        let jobs = api.list(&params).await?;

        Ok(jobs
            .items
            .into_iter()
            .filter(|job| job.owner_references().iter().any(|o| o.uid == owner_uid))
            .collect())
    }

    async fn job_logs(
        &self,
        namespace: &str,
        job_name: &str,
        container: &str,
    ) -> Result<Vec<u8>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&format!("job-name={}", job_name)))
            .await?;

        let pod = pods
            .items
            .iter()
            .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .ok_or(Error::MissingObjectKey("pod of the Job"))?;

        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        let logs = api.logs(&pod.name_any(), &params).await?;
        Ok(logs.into_bytes())
    }

    async fn list_issues(
        &self,
        namespace: &str,
        scan_ids: &[String],
    ) -> Result<Vec<ClusterIssue>> {
        if scan_ids.is_empty() {
            return Ok(Vec::new());
        }
        let api: Api<ClusterIssue> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{} in ({})", LABEL_SCAN_ID, scan_ids.join(","));
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn replace_status(&self, scan: &ClusterScan) -> Result<()> {
        self.scans(&Self::scan_namespace(scan)?)
            .replace_status(
                &scan.name_any(),
                &PostParams::default(),
                serde_json::to_vec(scan)?,
            )
            .await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        scan: &ClusterScan,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        self.recorder.publish(&event, &scan.object_ref(&())).await?;
        Ok(())
    }
}
