//! CronJob rendering for plugin runs
//!
//! Each plugin of a ClusterScan runs as one CronJob. Its pod has two
//! containers sharing a results volume: the plugin itself, and a worker that
//! waits for the done file and turns the results into ClusterIssues labelled
//! with the Job UID (the scan ID).

use crate::client::{MANAGED_BY_LABEL, MANAGER};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::kubeconfig::KubeconfigSource;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use scan_pilot_core::crd::{LABEL_CLUSTER, LABEL_CLUSTER_SCAN, LABEL_PLUGIN};
use scan_pilot_core::{ClusterScan, EnvVar, Plugin, PluginReference, cronjob_name};
use std::collections::BTreeMap;

/// Name of the worker sidecar container
pub const WORKER_CONTAINER: &str = "worker";

const RESULTS_VOLUME: &str = "results";
const RESULTS_DIR: &str = "/tmp/scan-pilot/results";
const KUBECONFIG_VOLUME: &str = "kubeconfig";
const KUBECONFIG_DIR: &str = "/etc/scan-pilot";
const KUBECONFIG_FILE: &str = "kubeconfig.yml";

/// Everything needed to render the CronJob of one plugin
pub struct PluginCronJob<'a> {
    pub scan: &'a ClusterScan,
    pub reference: &'a PluginReference,
    pub plugin: &'a Plugin,
    pub cluster_name: &'a str,
    pub kubeconfig: Option<&'a KubeconfigSource>,
    /// Effective suspend flag, already forced when the cluster is not ready
    pub suspend: bool,
    pub config: &'a ControllerConfig,
}

impl PluginCronJob<'_> {
    pub fn name(&self) -> String {
        cronjob_name(&self.scan.name_any(), &self.reference.name)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
            (LABEL_CLUSTER.to_string(), self.cluster_name.to_string()),
            (LABEL_CLUSTER_SCAN.to_string(), self.scan.name_any()),
            (LABEL_PLUGIN.to_string(), self.reference.name.clone()),
        ])
    }

    /// Render the CronJob
    pub fn build(&self) -> Result<CronJob> {
        let namespace = self
            .scan
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let owner = self
            .scan
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        let labels = self.labels();

        let mut volumes = vec![corev1::Volume {
            name: RESULTS_VOLUME.to_string(),
            empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
            ..Default::default()
        }];
        if let Some(kubeconfig) = self.kubeconfig {
            volumes.push(corev1::Volume {
                name: KUBECONFIG_VOLUME.to_string(),
                secret: Some(corev1::SecretVolumeSource {
                    secret_name: Some(kubeconfig.secret_name.clone()),
                    items: Some(vec![corev1::KeyToPath {
                        key: kubeconfig.key.clone(),
                        path: KUBECONFIG_FILE.to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let pod = corev1::PodSpec {
            containers: vec![self.plugin_container(), self.worker_container()],
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(self.config.service_account_name.clone()),
            volumes: Some(volumes),
            ..Default::default()
        };

        Ok(CronJob {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: Some(namespace),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(CronJobSpec {
                schedule: self.scan.spec.plugin_schedule(self.reference).to_string(),
                suspend: Some(self.suspend),
                concurrency_policy: Some("Forbid".to_string()),
                successful_jobs_history_limit: Some(self.scan.spec.successful_history_limit()),
                failed_jobs_history_limit: Some(self.scan.spec.failed_history_limit()),
                job_template: JobTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(JobSpec {
                        backoff_limit: Some(0),
                        template: corev1::PodTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: Some(labels),
                                ..Default::default()
                            }),
                            spec: Some(pod),
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn common_env(&self) -> Vec<EnvVar> {
        vec![
            EnvVar::new("CLUSTER_NAME", self.cluster_name),
            EnvVar::new(
                "CLUSTER_NAMESPACE",
                self.scan.namespace().unwrap_or_default(),
            ),
            EnvVar::new("RESULTS_DIR", RESULTS_DIR),
            EnvVar::new("DONE_FILE", format!("{}/done", RESULTS_DIR)),
        ]
    }

    fn plugin_container(&self) -> corev1::Container {
        let mut env = self.common_env();
        if self.kubeconfig.is_some() {
            env.push(EnvVar::new(
                "KUBECONFIG",
                format!("{}/{}", KUBECONFIG_DIR, KUBECONFIG_FILE),
            ));
        }
        let env = merge_env(&merge_env(&env, &self.plugin.spec.env), &self.reference.env);

        let mut mounts = vec![corev1::VolumeMount {
            name: RESULTS_VOLUME.to_string(),
            mount_path: RESULTS_DIR.to_string(),
            ..Default::default()
        }];
        if self.kubeconfig.is_some() {
            mounts.push(corev1::VolumeMount {
                name: KUBECONFIG_VOLUME.to_string(),
                mount_path: KUBECONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let spec = &self.plugin.spec;
        corev1::Container {
            name: self.reference.name.clone(),
            image: Some(spec.image.clone()),
            command: (!spec.command.is_empty()).then(|| spec.command.clone()),
            args: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: Some(env.into_iter().map(to_k8s_env).collect()),
            volume_mounts: Some(mounts),
            ..Default::default()
        }
    }

    fn worker_container(&self) -> corev1::Container {
        let mut env: Vec<corev1::EnvVar> = self.common_env().into_iter().map(to_k8s_env).collect();
        env.extend([
            to_k8s_env(EnvVar::new("PLUGIN_NAME", self.reference.name.clone())),
            to_k8s_env(EnvVar::new(
                "PLUGIN_TYPE",
                self.plugin.spec.plugin_type.as_str(),
            )),
            to_k8s_env(EnvVar::new("CLUSTER_SCAN", self.scan.name_any())),
            field_env("JOB_NAME", "metadata.labels['job-name']"),
            field_env("JOB_UID", "metadata.labels['controller-uid']"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]);

        corev1::Container {
            name: WORKER_CONTAINER.to_string(),
            image: Some(self.config.worker_image.clone()),
            env: Some(env),
            volume_mounts: Some(vec![corev1::VolumeMount {
                name: RESULTS_VOLUME.to_string(),
                mount_path: RESULTS_DIR.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

/// Later variables replace earlier ones with the same name, keeping position
fn merge_env(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged = base.to_vec();
    for var in overrides {
        match merged.iter_mut().find(|v| v.name == var.name) {
            Some(existing) => existing.value = var.value.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

fn to_k8s_env(var: EnvVar) -> corev1::EnvVar {
    corev1::EnvVar {
        name: var.name,
        value: Some(var.value),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value_from: Some(corev1::EnvVarSource {
            field_ref: Some(corev1::ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_pilot_core::crd::PluginSpec;
    use scan_pilot_core::{ClusterReference, ClusterScanSpec};

    fn scan() -> ClusterScan {
        let mut scan = ClusterScan::new(
            "prod-scan",
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

    fn plugin() -> Plugin {
        Plugin::new(
            "popeye",
            PluginSpec {
                image: "derailed/popeye:v0.21".to_string(),
                command: vec!["/bin/sh".to_string(), "-c".to_string()],
                args: vec!["popeye -o json > $RESULTS_DIR/out.json".to_string()],
                env: vec![EnvVar::new("POPEYE_LEVEL", "warn")],
                ..Default::default()
            },
        )
    }

    fn container<'a>(cronjob: &'a CronJob, name: &str) -> &'a corev1::Container {
        cronjob
            .spec
            .as_ref()
            .unwrap()
            .job_template
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    fn env_value(container: &corev1::Container, name: &str) -> Option<String> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.clone())
    }

    #[test]
    fn renders_plugin_and_worker() {
        let scan = scan();
        let plugin = plugin();
        let mut reference = PluginReference::new("popeye", None);
        reference.env = vec![EnvVar::new("POPEYE_LEVEL", "error")];
        let kubeconfig = KubeconfigSource {
            secret_name: "prod-kubeconfig".to_string(),
            key: "value".to_string(),
        };
        let config = ControllerConfig::default();

        let cronjob = PluginCronJob {
            scan: &scan,
            reference: &reference,
            plugin: &plugin,
            cluster_name: "prod",
            kubeconfig: Some(&kubeconfig),
            suspend: false,
            config: &config,
        }
        .build()
        .unwrap();

        assert_eq!(cronjob.metadata.name.as_deref(), Some("prod-scan-popeye"));
        assert_eq!(cronjob.metadata.namespace.as_deref(), Some("scans"));
        let owner = &cronjob.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "scan-uid");
        assert_eq!(owner.controller, Some(true));

        let spec = cronjob.spec.as_ref().unwrap();
        assert_eq!(spec.schedule, "0 * * * *");
        assert_eq!(spec.suspend, Some(false));
        assert_eq!(spec.successful_jobs_history_limit, Some(3));
        assert_eq!(spec.failed_jobs_history_limit, Some(1));

        let popeye = container(&cronjob, "popeye");
        assert_eq!(popeye.image.as_deref(), Some("derailed/popeye:v0.21"));
        assert_eq!(env_value(popeye, "POPEYE_LEVEL").as_deref(), Some("error"));
        assert_eq!(
            env_value(popeye, "KUBECONFIG").as_deref(),
            Some("/etc/scan-pilot/kubeconfig.yml")
        );
        assert_eq!(env_value(popeye, "CLUSTER_NAME").as_deref(), Some("prod"));

        let worker = container(&cronjob, WORKER_CONTAINER);
        assert_eq!(worker.image.as_deref(), Some(config.worker_image.as_str()));
        assert_eq!(env_value(worker, "PLUGIN_NAME").as_deref(), Some("popeye"));
        assert!(
            worker
                .env
                .as_ref()
                .unwrap()
                .iter()
                .any(|e| e.name == "JOB_UID" && e.value_from.is_some())
        );
    }

    #[test]
    fn per_plugin_overrides_and_in_cluster_mode() {
        let scan = scan();
        let plugin = plugin();
        let mut reference = PluginReference::new("popeye", None);
        reference.schedule = Some("*/30 * * * *".to_string());
        let config = ControllerConfig::default();

        let cronjob = PluginCronJob {
            scan: &scan,
            reference: &reference,
            plugin: &plugin,
            cluster_name: "prod",
            kubeconfig: None,
            suspend: true,
            config: &config,
        }
        .build()
        .unwrap();

        let spec = cronjob.spec.as_ref().unwrap();
        assert_eq!(spec.schedule, "*/30 * * * *");
        assert_eq!(spec.suspend, Some(true));

        let popeye = container(&cronjob, "popeye");
        assert_eq!(env_value(popeye, "KUBECONFIG"), None);
        assert_eq!(popeye.volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn scan_without_uid_cannot_own_cronjobs() {
        let mut scan = scan();
        scan.metadata.uid = None;
        let plugin = plugin();
        let reference = PluginReference::new("popeye", None);
        let config = ControllerConfig::default();

        let result = PluginCronJob {
            scan: &scan,
            reference: &reference,
            plugin: &plugin,
            cluster_name: "prod",
            kubeconfig: None,
            suspend: false,
            config: &config,
        }
        .build();
        assert!(matches!(result, Err(Error::MissingObjectKey(_))));
    }

    #[test]
    fn merge_env_keeps_order() {
        let merged = merge_env(
            &[EnvVar::new("A", "1"), EnvVar::new("B", "2")],
            &[EnvVar::new("B", "3"), EnvVar::new("C", "4")],
        );
        assert_eq!(
            merged,
            vec![
                EnvVar::new("A", "1"),
                EnvVar::new("B", "3"),
                EnvVar::new("C", "4")
            ]
        );
    }
}
