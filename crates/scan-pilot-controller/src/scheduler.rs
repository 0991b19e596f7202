//! Per-plugin CronJob management and run tracking

use crate::client::KubeClient;
use crate::config::ControllerConfig;
use crate::cronjob::PluginCronJob;
use crate::error::{Error, Result};
use crate::kubeconfig::KubeconfigSource;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::ResourceExt;
use scan_pilot_core::{
    ClusterScan, ClusterScanStatus, JobOutcome, PluginReference, PluginScanStatus, ScanStatus,
    classify, cronjob_name, errparse, latest_job, schedule,
};
use tracing::{debug, info, warn};

/// Schedules the plugins of one ClusterScan during a reconciliation pass
pub struct Scheduler<'a> {
    pub kube: &'a dyn KubeClient,
    pub config: &'a ControllerConfig,
    pub scan: &'a ClusterScan,
    pub cluster_name: &'a str,
    pub cluster_ready: bool,
    pub kubeconfig: Option<&'a KubeconfigSource>,
}

impl Scheduler<'_> {
    fn namespace(&self) -> Result<String> {
        self.scan
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))
    }

    /// Apply the CronJob of a plugin and record what its latest Job did
    pub async fn schedule(
        &self,
        reference: &PluginReference,
        status: &mut ClusterScanStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let scan_namespace = self.namespace()?;
        let (plugin_namespace, plugin_name) = reference.namespaced_key(&scan_namespace);
        let plugin = self
            .kube
            .get_plugin(plugin_namespace, plugin_name)
            .await
            .map_err(|e| Error::PluginFetch {
                namespace: plugin_namespace.to_string(),
                name: plugin_name.to_string(),
                message: e.to_string(),
            })?
            .ok_or_else(|| Error::PluginFetch {
                namespace: plugin_namespace.to_string(),
                name: plugin_name.to_string(),
                message: "not found".to_string(),
            })?;

        let desired = PluginCronJob {
            scan: self.scan,
            reference,
            plugin: &plugin,
            cluster_name: self.cluster_name,
            kubeconfig: self.kubeconfig,
            suspend: !self.cluster_ready || self.scan.spec.plugin_suspended(reference),
            config: self.config,
        };
        let name = desired.name();
        let cronjob = self
            .kube
            .apply_cronjob(&desired.build()?)
            .await
            .map_err(|e| Error::CronJobApply {
                name: name.clone(),
                source: Box::new(e),
            })?;
        debug!(cronjob = %name, "Applied CronJob");

        let latest = self.latest_run(&cronjob).await?;
        let entry = status.plugin_mut(&reference.name);
        record_cronjob(entry, &cronjob, now);

        let Some((job, outcome)) = latest else {
            return Ok(());
        };
        let failed_before = entry.last_scan_id == job.metadata.uid
            && entry.last_finished_status == Some(ScanStatus::Failed)
            && entry.last_error_msg.is_some();
        record_outcome(entry, &job, outcome);

        if outcome.status != Some(ScanStatus::Failed) || failed_before {
            return Ok(());
        }
        if !errparse::is_known_plugin(&reference.name) {
            debug!(plugin = %reference.name, "No error patterns for plugin, skipping log extraction");
            return Ok(());
        }
        match self.extract_error(&reference.name, &job).await {
            Ok(message) => {
                info!(plugin = %reference.name, job = %job.name_any(), %message, "Plugin run failed");
                entry.last_error_msg = Some(message);
            }
            Err(e) => {
                warn!(plugin = %reference.name, job = %job.name_any(), error = %e, "Could not extract plugin error");
            }
        }
        Ok(())
    }

    /// Latest Job of a CronJob that has been scheduled at least once
    async fn latest_run(&self, cronjob: &CronJob) -> Result<Option<(Job, JobOutcome)>> {
        let Some(cron_status) = &cronjob.status else {
            return Ok(None);
        };
        if cron_status.last_schedule_time.is_none() {
            return Ok(None);
        }
        let uid = cronjob
            .metadata
            .uid
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        let jobs = self.kube.list_owned_jobs(&self.namespace()?, uid).await?;
        let cronjob_active = cron_status.active.as_ref().is_some_and(|a| !a.is_empty());
        Ok(latest_job(&jobs).map(|job| (job.clone(), classify(job, cronjob_active))))
    }

    async fn extract_error(&self, plugin: &str, job: &Job) -> Result<String> {
        let logs = self
            .kube
            .job_logs(&self.namespace()?, &job.name_any(), plugin)
            .await?;
        Ok(errparse::parse(plugin, logs.as_slice())?)
    }

    /// Delete the CronJobs of plugins no longer referenced by the scan.
    ///
    /// Entries whose CronJob could not be deleted stay for the next pass.
    pub async fn cleanup_stale(&self, resolved: &[PluginReference], status: &mut ClusterScanStatus) {
        let stale: Vec<String> = status
            .plugins
            .keys()
            .filter(|name| !resolved.iter().any(|r| &r.name == *name))
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        let namespace = match self.namespace() {
            Ok(ns) => ns,
            Err(e) => {
                warn!(error = %e, "Cannot clean up stale plugins");
                return;
            }
        };

        for plugin in stale {
            let name = cronjob_name(&self.scan.name_any(), &plugin);
            match self.kube.delete_cronjob(&namespace, &name).await {
                Ok(()) => {
                    info!(%plugin, cronjob = %name, "Removed stale plugin");
                    status.plugins.remove(&plugin);
                }
                Err(e) => {
                    warn!(%plugin, cronjob = %name, error = %e, "Failed to delete stale CronJob");
                }
            }
        }
    }
}

fn record_cronjob(entry: &mut PluginScanStatus, cronjob: &CronJob, now: DateTime<Utc>) {
    if let Some(spec) = &cronjob.spec {
        entry.suspend = spec.suspend.unwrap_or(false);
        entry.schedule = spec.schedule.clone();
    }
    entry.next_schedule_time = match schedule::next_run(&entry.schedule, now) {
        Ok(next) => Some(next),
        Err(e) => {
            warn!(schedule = %entry.schedule, error = %e, "Cannot compute next run");
            None
        }
    };
    if let Some(last) = cronjob
        .status
        .as_ref()
        .and_then(|s| s.last_schedule_time.as_ref())
    {
        entry.last_schedule_time = Some(last.0);
    }
}

fn record_outcome(entry: &mut PluginScanStatus, job: &Job, outcome: JobOutcome) {
    entry.last_scan_id = job.metadata.uid.clone();
    entry.last_status = outcome.status;
    if !outcome.finished {
        return;
    }
    entry.last_finished_status = outcome.status;
    entry.last_finished_time = outcome.finished_at;
    if outcome.status == Some(ScanStatus::Complete) {
        entry.last_successful_scan_id = job.metadata.uid.clone();
        entry.last_successful_time = outcome.finished_at;
        entry.last_error_msg = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::error::api_error;
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::{CronJobStatus, JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use scan_pilot_core::{ClusterReference, ClusterScanSpec, Plugin, PluginSpec};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn scan() -> ClusterScan {
        let mut scan = ClusterScan::new(
            "nightly",
            ClusterScanSpec {
                cluster_ref: ClusterReference {
                    name: "prod".to_string(),
                },
                schedule: "0 * * * *".to_string(),
                ..Default::default()
            },
        );
        scan.metadata.namespace = Some("scans".to_string());
        scan.metadata.uid = Some("scan-uid".to_string());
        scan
    }

    fn plugin(name: &str) -> Plugin {
        Plugin::new(
            name,
            PluginSpec {
                image: format!("example/{}:latest", name),
                ..Default::default()
            },
        )
    }

    fn job(uid: &str, started: i64, condition: Option<(&str, i64)>) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(format!("job-{}", uid));
        job.metadata.uid = Some(uid.to_string());
        job.status = Some(JobStatus {
            start_time: Some(Time(at(started))),
            conditions: condition.map(|(type_, finished)| {
                vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    last_transition_time: Some(Time(at(finished))),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        });
        job
    }

    /// Mock that stores the CronJob as scheduled once
    fn scheduled_mock(jobs: Vec<Job>) -> MockKubeClient {
        let mut mock = MockKubeClient::new();
        mock.expect_get_plugin()
            .returning(|_, name| Ok(Some(plugin(name))));
        mock.expect_apply_cronjob().returning(|cj| {
            let mut stored = cj.clone();
            stored.metadata.uid = Some("cronjob-uid".to_string());
            stored.status = Some(CronJobStatus {
                last_schedule_time: Some(Time(at(0))),
                ..Default::default()
            });
            Ok(stored)
        });
        mock.expect_list_owned_jobs()
            .withf(|ns, uid| ns == "scans" && uid == "cronjob-uid")
            .returning(move |_, _| Ok(jobs.clone()));
        mock
    }

    fn scheduler<'a>(
        kube: &'a MockKubeClient,
        config: &'a ControllerConfig,
        scan: &'a ClusterScan,
        cluster_ready: bool,
    ) -> Scheduler<'a> {
        Scheduler {
            kube,
            config,
            scan,
            cluster_name: "prod",
            cluster_ready,
            kubeconfig: None,
        }
    }

    #[tokio::test]
    async fn records_latest_complete_run() {
        let mock = scheduled_mock(vec![
            job("old", 0, Some(("Failed", 30))),
            job("new", 100, Some(("Complete", 160))),
        ]);
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();
        status.plugin_mut("popeye").last_error_msg = Some("boom".to_string());

        scheduler(&mock, &config, &scan, true)
            .schedule(&PluginReference::new("popeye", None), &mut status, at(200))
            .await
            .unwrap();

        let entry = &status.plugins["popeye"];
        assert_eq!(entry.last_scan_id.as_deref(), Some("new"));
        assert_eq!(entry.last_successful_scan_id.as_deref(), Some("new"));
        assert_eq!(entry.last_status, Some(ScanStatus::Complete));
        assert_eq!(entry.last_finished_time, Some(at(160)));
        assert_eq!(entry.last_schedule_time, Some(at(0)));
        assert_eq!(entry.schedule, "0 * * * *");
        assert!(entry.next_schedule_time.is_some());
        assert_eq!(entry.last_error_msg, None);
    }

    #[tokio::test]
    async fn failed_run_extracts_error_from_logs() {
        let mut mock = scheduled_mock(vec![job("run-1", 0, Some(("Failed", 60)))]);
        mock.expect_job_logs()
            .withf(|ns, job, container| ns == "scans" && job == "job-run-1" && container == "popeye")
            .times(1)
            .returning(|_, _, _| Ok(b"panic: the server could not find the requested resource\n".to_vec()));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();

        scheduler(&mock, &config, &scan, true)
            .schedule(&PluginReference::new("popeye", None), &mut status, at(100))
            .await
            .unwrap();

        let entry = &status.plugins["popeye"];
        assert_eq!(entry.last_finished_status, Some(ScanStatus::Failed));
        assert_eq!(entry.last_successful_scan_id, None);
        assert_eq!(
            entry.last_error_msg.as_deref(),
            Some("the server could not find the requested resource")
        );
    }

    #[tokio::test]
    async fn log_failure_keeps_prior_message() {
        let mut mock = scheduled_mock(vec![job("run-2", 0, Some(("Failed", 60)))]);
        mock.expect_job_logs()
            .returning(|_, _, _| Err(Error::MissingObjectKey("pod of the Job")));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();
        status.plugin_mut("popeye").last_error_msg = Some("earlier failure".to_string());

        scheduler(&mock, &config, &scan, true)
            .schedule(&PluginReference::new("popeye", None), &mut status, at(100))
            .await
            .unwrap();

        assert_eq!(
            status.plugins["popeye"].last_error_msg.as_deref(),
            Some("earlier failure")
        );
    }

    #[tokio::test]
    async fn pending_run_clears_previous_status() {
        let mock = scheduled_mock(vec![
            job("done", 0, Some(("Complete", 60))),
            job("pending", 3600, None),
        ]);
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();
        {
            let entry = status.plugin_mut("popeye");
            entry.last_scan_id = Some("done".to_string());
            entry.last_status = Some(ScanStatus::Complete);
            entry.last_finished_status = Some(ScanStatus::Complete);
            entry.last_successful_scan_id = Some("done".to_string());
        }

        scheduler(&mock, &config, &scan, true)
            .schedule(&PluginReference::new("popeye", None), &mut status, at(3700))
            .await
            .unwrap();

        let entry = &status.plugins["popeye"];
        assert_eq!(entry.last_scan_id.as_deref(), Some("pending"));
        assert_eq!(entry.last_status, None);
        assert_eq!(entry.last_finished_status, Some(ScanStatus::Complete));
        assert_eq!(entry.last_successful_scan_id.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn invalid_schedule_is_not_fatal() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_plugin()
            .returning(|_, name| Ok(Some(plugin(name))));
        mock.expect_apply_cronjob()
            .withf(|cj| cj.spec.as_ref().is_some_and(|s| s.schedule == "every tuesday"))
            .times(1)
            .returning(|cj| Ok(cj.clone()));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();
        status.plugin_mut("popeye").next_schedule_time = Some(at(3600));

        let mut reference = PluginReference::new("popeye", None);
        reference.schedule = Some("every tuesday".to_string());
        scheduler(&mock, &config, &scan, true)
            .schedule(&reference, &mut status, at(0))
            .await
            .unwrap();

        let entry = &status.plugins["popeye"];
        assert_eq!(entry.schedule, "every tuesday");
        assert_eq!(entry.next_schedule_time, None);
    }

    #[tokio::test]
    async fn unready_cluster_suspends_cronjob() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_plugin()
            .returning(|_, name| Ok(Some(plugin(name))));
        mock.expect_apply_cronjob()
            .withf(|cj| cj.spec.as_ref().and_then(|s| s.suspend) == Some(true))
            .times(1)
            .returning(|cj| Ok(cj.clone()));
        mock.expect_list_owned_jobs().never();
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();

        scheduler(&mock, &config, &scan, false)
            .schedule(&PluginReference::new("marvin", None), &mut status, at(0))
            .await
            .unwrap();

        let entry = &status.plugins["marvin"];
        assert!(entry.suspend);
        assert_eq!(entry.last_status, None);
    }

    #[tokio::test]
    async fn missing_plugin_aborts() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_plugin()
            .withf(|ns, name| ns == "scans" && name == "trivy")
            .returning(|_, _| Ok(None));
        mock.expect_apply_cronjob().never();
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();

        let err = scheduler(&mock, &config, &scan, true)
            .schedule(&PluginReference::new("trivy", None), &mut status, at(0))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "PluginFetchError");
        assert!(status.plugins.is_empty());
    }

    #[tokio::test]
    async fn explicit_plugin_namespace_is_used() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_plugin()
            .withf(|ns, name| ns == "scan-pilot-system" && name == "popeye")
            .times(1)
            .returning(|_, name| Ok(Some(plugin(name))));
        mock.expect_apply_cronjob().returning(|cj| Ok(cj.clone()));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();

        let reference = PluginReference::new("popeye", Some("scan-pilot-system".to_string()));
        scheduler(&mock, &config, &scan, true)
            .schedule(&reference, &mut status, at(0))
            .await
            .unwrap();
        assert!(status.plugins.contains_key("popeye"));
    }

    #[tokio::test]
    async fn apply_failure_is_wrapped() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_plugin()
            .returning(|_, name| Ok(Some(plugin(name))));
        mock.expect_apply_cronjob()
            .returning(|_| Err(api_error(422, "Invalid")));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();

        let err = scheduler(&mock, &config, &scan, true)
            .schedule(&PluginReference::new("popeye", None), &mut status, at(0))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "CronJobApplyError");
    }

    #[tokio::test]
    async fn stale_plugins_are_removed() {
        let mut mock = MockKubeClient::new();
        mock.expect_delete_cronjob()
            .withf(|ns, name| ns == "scans" && name == "nightly-kubescape")
            .times(1)
            .returning(|_, _| Ok(()));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();
        status.plugin_mut("popeye");
        status.plugin_mut("kubescape");

        scheduler(&mock, &config, &scan, true)
            .cleanup_stale(&[PluginReference::new("popeye", None)], &mut status)
            .await;

        assert_eq!(status.plugins.keys().collect::<Vec<_>>(), vec!["popeye"]);
    }

    #[tokio::test]
    async fn failed_stale_delete_keeps_entry() {
        let mut mock = MockKubeClient::new();
        mock.expect_delete_cronjob()
            .returning(|_, _| Err(api_error(500, "InternalError")));
        let config = ControllerConfig::default();
        let scan = scan();
        let mut status = ClusterScanStatus::default();
        status.plugin_mut("popeye");
        status.plugin_mut("kubescape");

        scheduler(&mock, &config, &scan, true)
            .cleanup_stale(&[PluginReference::new("popeye", None)], &mut status)
            .await;

        assert!(status.plugins.contains_key("kubescape"));
    }
}
