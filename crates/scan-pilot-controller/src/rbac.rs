//! ServiceAccount and ClusterRoleBinding for plugin Jobs
//!
//! Plugin pods run as one ServiceAccount per scan namespace. A single
//! cluster-wide binding grants all of them the plugin ClusterRole, so each
//! new namespace appends a subject to it.

use crate::client::{KubeClient, MANAGED_BY_LABEL, MANAGER};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info};

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGER.to_string())])
}

fn subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// ServiceAccount the plugin Jobs of `namespace` run as
pub fn service_account(config: &ControllerConfig, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(config.service_account_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Fresh binding with a single subject
fn new_binding(config: &ControllerConfig, namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(config.cluster_role_binding_name.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: config.cluster_role_name.clone(),
        },
        subjects: Some(vec![subject(&config.service_account_name, namespace)]),
    }
}

/// Append the ServiceAccount subject to `binding`, returning whether it changed
pub fn ensure_subject(binding: &mut ClusterRoleBinding, account: &str, namespace: &str) -> bool {
    let subjects = binding.subjects.get_or_insert_with(Vec::new);
    let present = subjects.iter().any(|s| {
        s.kind == "ServiceAccount" && s.name == account && s.namespace.as_deref() == Some(namespace)
    });
    if present {
        return false;
    }
    subjects.push(subject(account, namespace));
    true
}

/// Make sure plugin Jobs in `namespace` have a ServiceAccount bound to the plugin role
pub async fn ensure_rbac(
    kube: &dyn KubeClient,
    config: &ControllerConfig,
    namespace: &str,
) -> Result<()> {
    kube.apply_service_account(&service_account(config, namespace))
        .await
        .map_err(|e| Error::Rbac(format!("ServiceAccount: {}", e)))?;

    let name = &config.cluster_role_binding_name;
    let existing = kube
        .get_cluster_role_binding(name)
        .await
        .map_err(|e| Error::Rbac(format!("get ClusterRoleBinding {}: {}", name, e)))?;

    match existing {
        None => {
            info!(binding = %name, namespace, "Creating ClusterRoleBinding");
            kube.create_cluster_role_binding(&new_binding(config, namespace))
                .await
                .map_err(|e| Error::Rbac(format!("create ClusterRoleBinding {}: {}", name, e)))
        }
        Some(mut binding) => {
            if !ensure_subject(&mut binding, &config.service_account_name, namespace) {
                debug!(binding = %name, namespace, "ClusterRoleBinding already has subject");
                return Ok(());
            }
            info!(binding = %name, namespace, "Adding subject to ClusterRoleBinding");
            kube.replace_cluster_role_binding(&binding)
                .await
                .map_err(|e| Error::Rbac(format!("update ClusterRoleBinding {}: {}", name, e)))
        }
    }
}
