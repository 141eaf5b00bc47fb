//! Astarte Custom Resource Definition
//!
//! The Astarte CRD describes one managed Astarte platform instance: the
//! requested version, the infrastructure it connects to and the deployment
//! knobs of every component.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AstarteApiSpec, AstarteCassandraSpec, AstarteCfsslSpec, AstarteComponentsSpec,
    AstarteFeatures, AstarteRabbitMqSpec, AstarteVerneMqSpec, ClusterHealth,
    DeploymentStrategyType, ReconciliationPhase,
};

/// Structured validation error for `AstarteSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "api.astarte-platform.org",
    version = "v1alpha1",
    kind = "Astarte",
    namespaced,
    status = "AstarteStatus",
    shortname = "ast",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AstarteSpec {
    /// Requested Astarte version (semver, "X.Y-snapshot" or "snapshot")
    pub version: String,

    /// Freeze reconciliation; only status is recomputed
    #[serde(default)]
    pub manual_maintenance_mode: bool,

    #[serde(default)]
    pub features: AstarteFeatures,

    pub api: AstarteApiSpec,

    #[serde(default)]
    pub rabbitmq: AstarteRabbitMqSpec,

    #[serde(default)]
    pub cassandra: AstarteCassandraSpec,

    pub vernemq: AstarteVerneMqSpec,

    #[serde(default)]
    pub cfssl: AstarteCfsslSpec,

    #[serde(default)]
    pub components: AstarteComponentsSpec,

    /// Cluster-wide update strategy for components that allow one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_strategy: Option<DeploymentStrategyType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Image registry prefix (default "astarte")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_channel: Option<String>,
}

impl AstarteSpec {
    /// Validate the parts of the spec the reconciler depends on
    ///
    /// Field-level admission checks live elsewhere; this only rejects
    /// configurations the reconciler cannot act on safely.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        if self.api.host.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.api.host",
                "api.host must not be empty",
                "Set spec.api.host to the hostname serving the Astarte APIs.",
            ));
        }

        if self.vernemq.host.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.vernemq.host",
                "vernemq.host must not be empty",
                "Set spec.vernemq.host to the public hostname devices connect to.",
            ));
        }

        let replicas = [
            ("housekeeping", &self.components.housekeeping),
            ("housekeepingApi", &self.components.housekeeping_api),
            ("realmManagement", &self.components.realm_management),
            ("realmManagementApi", &self.components.realm_management_api),
            ("pairing", &self.components.pairing),
            ("pairingApi", &self.components.pairing_api),
            ("dataUpdaterPlant", &self.components.data_updater_plant),
            ("triggerEngine", &self.components.trigger_engine),
            ("appengineApi", &self.components.appengine_api),
            ("flow", &self.components.flow),
            ("dashboard", &self.components.dashboard),
            ("vernemq", &self.vernemq.component),
            ("cfssl", &self.cfssl.component),
        ];
        for (field, component) in replicas {
            if component.replicas.is_some_and(|r| r < 0) {
                errors.push(SpecValidationError::new(
                    format!("spec.components.{field}.replicas"),
                    "replicas must not be negative",
                    "Set replicas to 0 or greater.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Image registry prefix
    pub fn distribution_channel(&self) -> &str {
        self.distribution_channel.as_deref().unwrap_or("astarte")
    }
}

/// Status subresource of an Astarte instance
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteStatus {
    #[serde(default)]
    pub phase: ReconciliationPhase,

    /// Version the platform was last reconciled to
    #[serde(default)]
    pub astarte_version: String,

    /// Version of the operator that wrote this status
    #[serde(default)]
    pub operator_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ClusterHealth>,

    #[serde(default)]
    pub base_api_url: String,

    #[serde(default)]
    pub broker_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Astarte {
    /// Version recorded by the last successful reconcile ("" before the first)
    pub fn recorded_version(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.astarte_version.as_str())
            .unwrap_or("")
    }

    /// Health recorded by the last successful reconcile
    pub fn recorded_health(&self) -> Option<ClusterHealth> {
        self.status.as_ref().and_then(|s| s.health)
    }
}
