//! Shared types for the Astarte specification
//!
//! These types are used across the CRD definition and controller logic.
//! They describe the per-component deployment knobs, the connection specs
//! of the infrastructure Astarte depends on and the values persisted in status.
//!
//! # Type Hierarchy
//!
//! - [`AstarteComponentSpec`] - deploy flag, replicas, resources, probes and placement of one component
//! - [`AstarteComponentsSpec`] - the component map plus the system-wide resource budget
//! - Infrastructure: [`AstarteApiSpec`], [`AstarteRabbitMqSpec`], [`AstarteCassandraSpec`],
//!   [`AstarteVerneMqSpec`], [`AstarteCfsslSpec`]
//! - Status values: [`ReconciliationPhase`], [`ClusterHealth`]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, EnvVar, Probe, ResourceRequirements};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state persisted in `status.phase`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ReconciliationPhase {
    /// Never reconciled
    #[default]
    Unknown,
    /// Fresh installation in progress
    Reconciling,
    /// Version transition in progress
    Upgrading,
    /// Live state matches the spec
    Reconciled,
    /// Reconciliation frozen by `spec.manualMaintenanceMode`
    ManualMaintenanceMode,
    /// Reserved; unrecoverable errors keep the last successful phase
    Failed,
}

impl std::fmt::Display for ReconciliationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationPhase::Unknown => write!(f, "Unknown"),
            ReconciliationPhase::Reconciling => write!(f, "Reconciling"),
            ReconciliationPhase::Upgrading => write!(f, "Upgrading"),
            ReconciliationPhase::Reconciled => write!(f, "Reconciled"),
            ReconciliationPhase::ManualMaintenanceMode => write!(f, "ManualMaintenanceMode"),
            ReconciliationPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Aggregate health signal derived from the readiness of managed workloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Red,
    Yellow,
    Green,
}

impl ClusterHealth {
    /// Map a count of unhealthy workloads onto the three-level signal
    pub fn from_unhealthy_count(unhealthy: usize) -> Self {
        match unhealthy {
            0 => ClusterHealth::Green,
            1 => ClusterHealth::Yellow,
            _ => ClusterHealth::Red,
        }
    }

    /// Numeric severity used by the health gauge (0 green, 1 yellow, 2 red)
    pub fn severity(&self) -> i64 {
        match self {
            ClusterHealth::Green => 0,
            ClusterHealth::Yellow => 1,
            ClusterHealth::Red => 2,
        }
    }
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Red => write!(f, "red"),
            ClusterHealth::Yellow => write!(f, "yellow"),
            ClusterHealth::Green => write!(f, "green"),
        }
    }
}

/// Workload update strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DeploymentStrategyType {
    RollingUpdate,
    Recreate,
}

impl DeploymentStrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategyType::RollingUpdate => "RollingUpdate",
            DeploymentStrategyType::Recreate => "Recreate",
        }
    }
}

/// Priority tier a component's pods are scheduled with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    High,
    Mid,
    Low,
}

/// Deployment knobs shared by every Astarte component
///
/// Every field is optional; unset fields fall back to cluster-wide settings
/// and then to the per-kind built-in defaults.
///
/// # Examples
///
/// ```rust,no_run
/// use astarte_k8s::crd::{AstarteComponentSpec, PriorityTier};
///
/// let dup = AstarteComponentSpec {
///     replicas: Some(3),
///     priority_class: Some(PriorityTier::High),
///     autoscaler: Some("dup-hpa".to_string()),
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteComponentSpec {
    /// Whether the component is deployed; unset uses the per-kind default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<bool>,

    /// Static replica count (default 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Explicit resources; when set the allocation calculator is bypassed
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub resources: Option<ResourceRequirements>,

    /// Full image reference override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Version override for this component's image tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Required pod anti-affinity on the component label (default true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_affinity: Option<bool>,

    /// Custom affinity; always wins over `antiAffinity`
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub custom_affinity: Option<Affinity>,

    /// Update strategy override for this component
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_strategy: Option<DeploymentStrategyType>,

    /// Priority tier, applied only when pod priorities are enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<PriorityTier>,

    /// Name of a HorizontalPodAutoscaler driving this component's replicas
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<String>,

    /// Extra environment variables appended to the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub additional_env: Vec<EnvVar>,

    /// Extra pod labels; reserved keys are ignored
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub readiness_probe: Option<Probe>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub liveness_probe: Option<Probe>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub startup_probe: Option<Probe>,
}

/// Component map plus the system-wide resource budget
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteComponentsSpec {
    /// Global budget shared among deployed components
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub housekeeping: AstarteComponentSpec,
    #[serde(default)]
    pub housekeeping_api: AstarteComponentSpec,
    #[serde(default)]
    pub realm_management: AstarteComponentSpec,
    #[serde(default)]
    pub realm_management_api: AstarteComponentSpec,
    #[serde(default)]
    pub pairing: AstarteComponentSpec,
    #[serde(default)]
    pub pairing_api: AstarteComponentSpec,
    #[serde(default)]
    pub data_updater_plant: AstarteComponentSpec,
    #[serde(default)]
    pub trigger_engine: AstarteComponentSpec,
    #[serde(default)]
    pub appengine_api: AstarteComponentSpec,
    #[serde(default)]
    pub flow: AstarteComponentSpec,
    #[serde(default)]
    pub dashboard: AstarteComponentSpec,
}

/// Public API exposure
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteApiSpec {
    /// Host serving the Astarte APIs (e.g. "api.astarte.example.com")
    pub host: String,
    /// Whether the API is served over TLS (default true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
}

impl AstarteApiSpec {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl.unwrap_or(true) {
            "https"
        } else {
            "http"
        };
        format!("{scheme}://{}", self.host)
    }
}

/// Connection to the external message queue
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMqConnectionSpec {
    pub host: String,
    #[serde(default = "default_rabbitmq_port")]
    pub port: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    /// Secret holding `username` and `password`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

impl Default for RabbitMqConnectionSpec {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_rabbitmq_port(),
            virtual_host: default_virtual_host(),
            credentials_secret: None,
        }
    }
}

fn default_rabbitmq_port() -> u16 {
    5672
}

fn default_virtual_host() -> String {
    "/".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteRabbitMqSpec {
    #[serde(default)]
    pub connection: RabbitMqConnectionSpec,
}

/// Connection to the external database cluster
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteCassandraSpec {
    /// Comma separated `host:port` list
    pub nodes: String,
}

/// Persistent storage request for a stateful component
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Size of the volume (e.g. "4Gi")
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Broker (VerneMQ) configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteVerneMqSpec {
    #[serde(flatten)]
    pub component: AstarteComponentSpec,
    /// Public host devices connect to
    pub host: String,
    /// Public MQTT over TLS port (default 8883)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
}

impl AstarteVerneMqSpec {
    pub fn broker_url(&self) -> String {
        format!("mqtts://{}:{}/", self.host, self.port.unwrap_or(8883))
    }
}

/// Certificate authority (CFSSL) configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteCfsslSpec {
    #[serde(flatten)]
    pub component: AstarteComponentSpec,
    /// URL of an external CFSSL; when set the CA is not deployed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
    /// Validity of device certificates (default "8760h")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_expiry: Option<String>,
}

/// Cluster-wide pod priority configuration
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPrioritiesSpec {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_high_priority")]
    pub astarte_high_priority: i32,
    #[serde(default = "default_mid_priority")]
    pub astarte_mid_priority: i32,
    #[serde(default = "default_low_priority")]
    pub astarte_low_priority: i32,
}

impl Default for PodPrioritiesSpec {
    fn default() -> Self {
        Self {
            enable: false,
            astarte_high_priority: default_high_priority(),
            astarte_mid_priority: default_mid_priority(),
            astarte_low_priority: default_low_priority(),
        }
    }
}

impl PodPrioritiesSpec {
    pub fn value_for(&self, tier: PriorityTier) -> i32 {
        match tier {
            PriorityTier::High => self.astarte_high_priority,
            PriorityTier::Mid => self.astarte_mid_priority,
            PriorityTier::Low => self.astarte_low_priority,
        }
    }
}

fn default_high_priority() -> i32 {
    1000
}

fn default_mid_priority() -> i32 {
    100
}

fn default_low_priority() -> i32 {
    10
}

/// Feature flags
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AstarteFeatures {
    /// Honor `autoscaler` references on components
    #[serde(default)]
    pub autoscaling: bool,
    /// Allow Housekeeping to delete realms
    #[serde(default)]
    pub realm_deletion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub astarte_pod_priorities: Option<PodPrioritiesSpec>,
}

impl AstarteFeatures {
    /// Priority configuration, only when the feature is enabled
    pub fn enabled_priorities(&self) -> Option<&PodPrioritiesSpec> {
        self.astarte_pod_priorities.as_ref().filter(|p| p.enable)
    }
}
