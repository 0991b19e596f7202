//! Kubeconfig resolution for target clusters
//!
//! Plugins reach their cluster through a kubeconfig mounted from a Secret.
//! The Secret is checked here so a broken reference stops the pass before
//! any CronJob is written.

use crate::client::KubeClient;
use crate::error::{Error, Result};
use kube::ResourceExt;
use scan_pilot_core::Cluster;

/// Secret key holding a cluster's kubeconfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeconfigSource {
    pub secret_name: String,
    pub key: String,
}

/// Resolve the kubeconfig Secret of a Cluster.
///
/// Returns `None` for clusters scanned with the in-cluster service account.
pub async fn resolve_kubeconfig(
    kube: &dyn KubeClient,
    cluster: &Cluster,
) -> Result<Option<KubeconfigSource>> {
    let Some(reference) = &cluster.spec.kubeconfig_ref else {
        return Ok(None);
    };
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let secret = kube
        .get_secret(&namespace, &reference.name)
        .await?
        .ok_or_else(|| {
            Error::KubeconfigFetch(format!("secret {}/{} not found", namespace, reference.name))
        })?;

    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&reference.key))
        .ok_or_else(|| {
            Error::KubeconfigFetch(format!(
                "secret {}/{} has no key {:?}",
                namespace, reference.name, reference.key
            ))
        })?;

    validate(&raw.0)?;

    Ok(Some(KubeconfigSource {
        secret_name: reference.name.clone(),
        key: reference.key.clone(),
    }))
}

/// Check that the bytes are a kubeconfig pointing at some cluster
fn validate(raw: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::KubeconfigFetch(format!("kubeconfig is not UTF-8: {}", e)))?;

    let kubeconfig: kube::config::Kubeconfig = serde_yaml::from_str(text)
        .map_err(|e| Error::KubeconfigFetch(format!("failed to parse kubeconfig: {}", e)))?;

    if kubeconfig.clusters.is_empty() {
        return Err(Error::KubeconfigFetch(
            "kubeconfig defines no clusters".to_string(),
        ));
    }
    Ok(())
}
