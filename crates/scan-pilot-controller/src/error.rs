//! Error types for the ClusterScan controller

use scan_pilot_core::ErrParseError;
use thiserror::Error;

/// Errors that abort a reconciliation pass
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Referenced Cluster does not exist
    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    /// Referenced Cluster is not ready
    #[error("cluster {name} is not ready: {message}")]
    ClusterNotReady {
        name: String,
        reason: String,
        message: String,
    },

    /// Kubeconfig of the Cluster cannot be resolved
    #[error("failed to fetch kubeconfig: {0}")]
    KubeconfigFetch(String),

    /// Referenced Plugin cannot be fetched
    #[error("failed to fetch plugin {namespace}/{name}: {message}")]
    PluginFetch {
        namespace: String,
        name: String,
        message: String,
    },

    /// CronJob create/update failed
    #[error("failed to apply CronJob {name}: {source}")]
    CronJobApply {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// ServiceAccount or ClusterRoleBinding could not be applied
    #[error("failed to apply RBAC: {0}")]
    Rbac(String),

    /// Error message of a failed run could not be extracted from its logs
    #[error("failed to extract plugin error: {0}")]
    ErrParse(#[from] ErrParseError),

    /// Object is missing a field the API server always sets
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Reason code reported on the Ready condition
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_)
            | Error::Serialization(_)
            | Error::ErrParse(_)
            | Error::MissingObjectKey(_) => "ReconcileError",
            Error::ClusterNotFound(_) => "ClusterNotFound",
            Error::ClusterNotReady { .. } => "ClusterNotReady",
            Error::KubeconfigFetch(_) => "KubeconfigFetchError",
            Error::PluginFetch { .. } => "PluginFetchError",
            Error::CronJobApply { .. } => "CronJobApplyError",
            Error::Rbac(_) => "RBACApplyError",
        }
    }

    /// Whether the error is a 409 from the API server
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Whether the error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Cluster errors the loop should retry sooner than the normal cadence
    pub fn is_cluster_unavailable(&self) -> bool {
        matches!(
            self,
            Error::ClusterNotFound(_) | Error::ClusterNotReady { .. }
        )
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(response)) => Some(response.code),
            Error::CronJobApply { source, .. } => source.api_code(),
            _ => None,
        }
    }
}

/// Result type for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} from test", reason),
        reason: reason.to_string(),
        code,
    }))
}
