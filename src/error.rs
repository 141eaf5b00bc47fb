//! Error types for the Astarte operator
//!
//! Every fallible operation in the crate returns [`Result`]. The controller's
//! `error_policy` relies on [`Error::is_retriable`] and [`Error::requeue_after`]
//! to pick a backoff for the failed invocation.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error (CRD generation)
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Operator configuration or environment problem
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The Astarte spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Requested Astarte version cannot be parsed
    #[error("Invalid Astarte version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },

    /// Version recovery from a live workload failed during status bootstrap
    #[error("Cannot recover Astarte version from image {image:?}: tag must be in the form name:version")]
    ImageTagError { image: String },

    /// Upgrade gate refused the version transition
    #[error("Upgrade refused: {0}")]
    UpgradeRefused(String),

    /// Priority class values are not strictly ordered high > mid > low
    #[error("Incoherent priority classes: {0}")]
    PriorityOrderError(String),

    /// A required field is missing from an object returned by the API server
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Key material generation failed
    #[error("Key generation failed: {0}")]
    KeyGenerationError(#[from] rcgen::Error),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error is an API not-found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// Whether a quick requeue is likely to succeed without human intervention
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => {
                e.code == 409 || e.code == 429 || e.code >= 500
            }
            Error::KubeError(_) => true,
            Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::InvalidVersion { .. }
            | Error::ImageTagError { .. }
            | Error::UpgradeRefused(_)
            | Error::PriorityOrderError(_)
            | Error::MissingField(_)
            | Error::KeyGenerationError(_) => false,
        }
    }

    /// Recommended requeue delay for a failed reconciliation
    pub fn requeue_after(&self) -> Duration {
        if self.is_retriable() {
            Duration::from_secs(15)
        } else {
            Duration::from_secs(60)
        }
    }

    /// Short, stable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::InvalidVersion { .. } => "invalid_version",
            Error::ImageTagError { .. } => "image_tag",
            Error::UpgradeRefused(_) => "upgrade_refused",
            Error::PriorityOrderError(_) => "priority_order",
            Error::MissingField(_) => "missing_field",
            Error::KeyGenerationError(_) => "key_generation",
        }
    }
}
