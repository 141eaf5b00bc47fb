//! Astarte component catalogue
//!
//! Every managed service role is a variant of [`ComponentKind`]. Per-kind
//! behavior (workload type, defaults, image, ports, environment) lives in a
//! single table of [`KindTraits`] so that the fixed reconciliation order and
//! the fixed defaults are defined in one place.

use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaimVolumeSource,
    SecretKeySelector, Volume, VolumeMount,
};
use kube::ResourceExt;

use crate::crd::{Astarte, AstarteComponentSpec, AstarteSpec};

/// Closed catalogue of managed component kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentKind {
    Housekeeping,
    HousekeepingApi,
    RealmManagement,
    RealmManagementApi,
    Pairing,
    PairingApi,
    DataUpdaterPlant,
    TriggerEngine,
    AppengineApi,
    Flow,
    VerneMq,
    Dashboard,
    Cfssl,
}

/// Kind of workload object backing a component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

/// Default health check endpoint of a component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeShape {
    Http { path: &'static str, port: i32 },
    Tcp { port: i32 },
}

/// A named container/service port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub name: &'static str,
    pub port: i32,
}

/// Static description of one component kind
pub struct KindTraits {
    /// Dash separated name used in object names and labels
    pub name: &'static str,
    /// Repository name of the default image
    pub image_name: &'static str,
    /// Tag used instead of the Astarte version, for third party images
    pub fixed_tag: Option<&'static str>,
    pub workload: WorkloadKind,
    /// Deploy decision when `deploy` is unset
    pub default_deploy: bool,
    /// Needs pod discovery RBAC and a clustering cookie
    pub clustered: bool,
    /// Always rolled out with full recreate
    pub always_recreate: bool,
    /// Runs Astarte's Elixir release and shares its environment
    pub astarte_service: bool,
    pub ports: &'static [PortSpec],
    pub probe: ProbeShape,
    /// Kind specific environment variables
    pub env: fn(&Astarte) -> Vec<EnvVar>,
    /// Kind specific volumes and their mounts
    pub volumes: fn(&Astarte) -> Vec<(Volume, VolumeMount)>,
}

const ASTARTE_HTTP: &[PortSpec] = &[PortSpec {
    name: "http",
    port: 4000,
}];

const ASTARTE_PROBE: ProbeShape = ProbeShape::Http {
    path: "/health",
    port: 4000,
};

const HOUSEKEEPING: KindTraits = KindTraits {
    name: "housekeeping",
    image_name: "astarte_housekeeping",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: true,
    always_recreate: true,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: housekeeping_env,
    volumes: no_volumes,
};

const HOUSEKEEPING_API: KindTraits = KindTraits {
    name: "housekeeping-api",
    image_name: "astarte_housekeeping_api",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: housekeeping_api_env,
    volumes: no_volumes,
};

const REALM_MANAGEMENT: KindTraits = KindTraits {
    name: "realm-management",
    image_name: "astarte_realm_management",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: no_env,
    volumes: no_volumes,
};

const REALM_MANAGEMENT_API: KindTraits = KindTraits {
    name: "realm-management-api",
    image_name: "astarte_realm_management_api",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: no_env,
    volumes: no_volumes,
};

const PAIRING: KindTraits = KindTraits {
    name: "pairing",
    image_name: "astarte_pairing",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: pairing_env,
    volumes: no_volumes,
};

const PAIRING_API: KindTraits = KindTraits {
    name: "pairing-api",
    image_name: "astarte_pairing_api",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: no_env,
    volumes: no_volumes,
};

const DATA_UPDATER_PLANT: KindTraits = KindTraits {
    name: "data-updater-plant",
    image_name: "astarte_data_updater_plant",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: true,
    always_recreate: true,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: no_env,
    volumes: no_volumes,
};

const TRIGGER_ENGINE: KindTraits = KindTraits {
    name: "trigger-engine",
    image_name: "astarte_trigger_engine",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: true,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: no_env,
    volumes: no_volumes,
};

const APPENGINE_API: KindTraits = KindTraits {
    name: "appengine-api",
    image_name: "astarte_appengine_api",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: appengine_api_env,
    volumes: no_volumes,
};

const FLOW: KindTraits = KindTraits {
    name: "flow",
    image_name: "astarte_flow",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: false,
    clustered: false,
    always_recreate: false,
    astarte_service: true,
    ports: ASTARTE_HTTP,
    probe: ASTARTE_PROBE,
    env: no_env,
    volumes: no_volumes,
};

const VERNEMQ: KindTraits = KindTraits {
    name: "vernemq",
    image_name: "vernemq",
    fixed_tag: None,
    workload: WorkloadKind::StatefulSet,
    default_deploy: true,
    clustered: true,
    always_recreate: false,
    astarte_service: false,
    ports: &[
        PortSpec {
            name: "mqtt-ssl",
            port: 8883,
        },
        PortSpec {
            name: "mqtt",
            port: 1883,
        },
        PortSpec {
            name: "epmd",
            port: 4369,
        },
        PortSpec {
            name: "vmq-cluster",
            port: 44053,
        },
    ],
    probe: ProbeShape::Tcp { port: 8883 },
    env: vernemq_env,
    volumes: no_volumes,
};

const DASHBOARD: KindTraits = KindTraits {
    name: "dashboard",
    image_name: "astarte-dashboard",
    fixed_tag: None,
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: false,
    ports: &[PortSpec {
        name: "http",
        port: 80,
    }],
    probe: ProbeShape::Http { path: "/", port: 80 },
    env: dashboard_env,
    volumes: no_volumes,
};

const CFSSL: KindTraits = KindTraits {
    name: "cfssl",
    image_name: "cfssl",
    fixed_tag: Some("1.5.0-astarte.3"),
    workload: WorkloadKind::Deployment,
    default_deploy: true,
    clustered: false,
    always_recreate: false,
    astarte_service: false,
    ports: &[PortSpec {
        name: "http",
        port: 8080,
    }],
    probe: ProbeShape::Http {
        path: "/api/v1/cfssl/health",
        port: 8080,
    },
    env: cfssl_env,
    volumes: cfssl_volumes,
};

impl ComponentKind {
    /// Order in which components are reconciled after the prerequisites.
    ///
    /// Identity and bootstrap services come first, then ingestion, then the
    /// broker, then the dashboard. The CA is a prerequisite and not listed.
    pub const RECONCILE_ORDER: [ComponentKind; 12] = [
        ComponentKind::Housekeeping,
        ComponentKind::HousekeepingApi,
        ComponentKind::RealmManagement,
        ComponentKind::RealmManagementApi,
        ComponentKind::Pairing,
        ComponentKind::PairingApi,
        ComponentKind::DataUpdaterPlant,
        ComponentKind::TriggerEngine,
        ComponentKind::AppengineApi,
        ComponentKind::Flow,
        ComponentKind::VerneMq,
        ComponentKind::Dashboard,
    ];

    /// Every kind, including the CA
    pub const ALL: [ComponentKind; 13] = [
        ComponentKind::Housekeeping,
        ComponentKind::HousekeepingApi,
        ComponentKind::RealmManagement,
        ComponentKind::RealmManagementApi,
        ComponentKind::Pairing,
        ComponentKind::PairingApi,
        ComponentKind::DataUpdaterPlant,
        ComponentKind::TriggerEngine,
        ComponentKind::AppengineApi,
        ComponentKind::Flow,
        ComponentKind::VerneMq,
        ComponentKind::Dashboard,
        ComponentKind::Cfssl,
    ];

    pub fn traits(&self) -> &'static KindTraits {
        match self {
            ComponentKind::Housekeeping => &HOUSEKEEPING,
            ComponentKind::HousekeepingApi => &HOUSEKEEPING_API,
            ComponentKind::RealmManagement => &REALM_MANAGEMENT,
            ComponentKind::RealmManagementApi => &REALM_MANAGEMENT_API,
            ComponentKind::Pairing => &PAIRING,
            ComponentKind::PairingApi => &PAIRING_API,
            ComponentKind::DataUpdaterPlant => &DATA_UPDATER_PLANT,
            ComponentKind::TriggerEngine => &TRIGGER_ENGINE,
            ComponentKind::AppengineApi => &APPENGINE_API,
            ComponentKind::Flow => &FLOW,
            ComponentKind::VerneMq => &VERNEMQ,
            ComponentKind::Dashboard => &DASHBOARD,
            ComponentKind::Cfssl => &CFSSL,
        }
    }

    pub fn name(&self) -> &'static str {
        self.traits().name
    }

    /// The component's section of the spec
    pub fn spec<'a>(&self, spec: &'a AstarteSpec) -> &'a AstarteComponentSpec {
        let components = &spec.components;
        match self {
            ComponentKind::Housekeeping => &components.housekeeping,
            ComponentKind::HousekeepingApi => &components.housekeeping_api,
            ComponentKind::RealmManagement => &components.realm_management,
            ComponentKind::RealmManagementApi => &components.realm_management_api,
            ComponentKind::Pairing => &components.pairing,
            ComponentKind::PairingApi => &components.pairing_api,
            ComponentKind::DataUpdaterPlant => &components.data_updater_plant,
            ComponentKind::TriggerEngine => &components.trigger_engine,
            ComponentKind::AppengineApi => &components.appengine_api,
            ComponentKind::Flow => &components.flow,
            ComponentKind::Dashboard => &components.dashboard,
            ComponentKind::VerneMq => &spec.vernemq.component,
            ComponentKind::Cfssl => &spec.cfssl.component,
        }
    }

    /// Name of the workload, Service and RBAC objects of this component
    pub fn resource_name(&self, instance: &str) -> String {
        format!("{instance}-{}", self.name())
    }

    /// Deploy decision: explicit flag wins, then the per-kind default.
    ///
    /// An external CA URL turns the CA default off.
    pub fn is_deployed(&self, spec: &AstarteSpec) -> bool {
        if let Some(deploy) = self.spec(spec).deploy {
            return deploy;
        }
        match self {
            ComponentKind::Cfssl => spec.cfssl.url.is_none(),
            _ => self.traits().default_deploy,
        }
    }

    /// Container image for this component
    pub fn image(&self, spec: &AstarteSpec) -> String {
        let component = self.spec(spec);
        if let Some(image) = &component.image {
            return image.clone();
        }
        let traits = self.traits();
        let tag = component
            .version
            .clone()
            .or_else(|| traits.fixed_tag.map(String::from))
            .unwrap_or_else(|| spec.version.clone());
        format!("{}/{}:{}", spec.distribution_channel(), traits.image_name, tag)
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Internal CA endpoint, or the external one when configured
pub fn cfssl_url(astarte: &Astarte) -> String {
    match &astarte.spec.cfssl.url {
        Some(url) => url.clone(),
        None => format!(
            "http://{}.{}.svc.cluster.local:8080",
            ComponentKind::Cfssl.resource_name(&astarte.name_any()),
            astarte.namespace().unwrap_or_else(|| "default".to_string())
        ),
    }
}

/// Name of the create-once clustering cookie of a clustered kind
pub fn cookie_secret_name(instance: &str, kind: ComponentKind) -> String {
    format!("{}-cookie", kind.resource_name(instance))
}

pub fn housekeeping_private_key_secret(instance: &str) -> String {
    format!("{instance}-housekeeping-private-key")
}

pub fn housekeeping_public_key_secret(instance: &str) -> String {
    format!("{instance}-housekeeping-public-key")
}

pub fn devices_ca_secret(instance: &str) -> String {
    format!("{instance}-devices-ca")
}

pub fn generic_erlang_configuration(instance: &str) -> String {
    format!("{instance}-generic-erlang-configuration")
}

pub fn cfssl_data_claim(instance: &str) -> String {
    format!("{instance}-cfssl-data")
}

pub fn vernemq_data_claim(instance: &str) -> String {
    format!("{instance}-vernemq-data")
}

// ============================================================================
// Environment
// ============================================================================

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment shared by every Astarte Elixir service
pub fn astarte_service_env(astarte: &Astarte, kind: ComponentKind) -> Vec<EnvVar> {
    let instance = astarte.name_any();
    let amqp = &astarte.spec.rabbitmq.connection;
    let mut env = vec![
        plain_env("RELEASE_NAME", kind.name().replace('-', "_")),
        EnvVar {
            name: "MY_POD_IP".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".to_string(),
                    api_version: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        plain_env("RPC_AMQP_CONNECTION_HOST", amqp.host.clone()),
        plain_env("RPC_AMQP_CONNECTION_PORT", amqp.port.to_string()),
        plain_env("RPC_AMQP_CONNECTION_VIRTUAL_HOST", amqp.virtual_host.clone()),
        plain_env("CASSANDRA_NODES", astarte.spec.cassandra.nodes.clone()),
    ];

    if let Some(secret) = &amqp.credentials_secret {
        env.push(secret_env("RPC_AMQP_CONNECTION_USERNAME", secret, "username"));
        env.push(secret_env("RPC_AMQP_CONNECTION_PASSWORD", secret, "password"));
    }

    if kind.traits().clustered {
        env.push(secret_env(
            "RELEASE_COOKIE",
            &cookie_secret_name(&instance, kind),
            "cookie",
        ));
        env.push(plain_env("CLUSTERING_STRATEGY", "kubernetes"));
        env.push(plain_env(
            "CLUSTERING_KUBERNETES_SELECTOR",
            format!("app={}", kind.resource_name(&instance)),
        ));
        env.push(plain_env(
            "CLUSTERING_KUBERNETES_SERVICE_NAME",
            kind.resource_name(&instance),
        ));
    }

    env
}

fn no_env(_: &Astarte) -> Vec<EnvVar> {
    Vec::new()
}

fn housekeeping_env(astarte: &Astarte) -> Vec<EnvVar> {
    vec![plain_env(
        "HOUSEKEEPING_ENABLE_REALM_DELETION",
        astarte.spec.features.realm_deletion.to_string(),
    )]
}

fn housekeeping_api_env(astarte: &Astarte) -> Vec<EnvVar> {
    vec![secret_env(
        "HOUSEKEEPING_API_JWT_PUBLIC_KEY",
        &housekeeping_public_key_secret(&astarte.name_any()),
        "public-key",
    )]
}

fn pairing_env(astarte: &Astarte) -> Vec<EnvVar> {
    vec![
        plain_env("PAIRING_CFSSL_URL", cfssl_url(astarte)),
        plain_env("PAIRING_BROKER_URL", astarte.spec.vernemq.broker_url()),
    ]
}

fn appengine_api_env(astarte: &Astarte) -> Vec<EnvVar> {
    vec![plain_env(
        "APPENGINE_API_MQTT_BROKER_URL",
        astarte.spec.vernemq.broker_url(),
    )]
}

fn vernemq_env(astarte: &Astarte) -> Vec<EnvVar> {
    let instance = astarte.name_any();
    let amqp = &astarte.spec.rabbitmq.connection;
    vec![
        secret_env(
            "DOCKER_VERNEMQ_DISTRIBUTED_COOKIE",
            &cookie_secret_name(&instance, ComponentKind::VerneMq),
            "cookie",
        ),
        plain_env(
            "DOCKER_VERNEMQ_DISCOVERY_KUBERNETES_LABEL_SELECTOR",
            format!("app={}", ComponentKind::VerneMq.resource_name(&instance)),
        ),
        plain_env("DOCKER_VERNEMQ_KUBERNETES_APP_LABEL", ComponentKind::VerneMq.resource_name(&instance)),
        plain_env("DOCKER_VERNEMQ_ASTARTE_VMQ_PLUGIN__AMQP__HOST", amqp.host.clone()),
        plain_env(
            "DOCKER_VERNEMQ_ASTARTE_VMQ_PLUGIN__AMQP__PORT",
            amqp.port.to_string(),
        ),
        plain_env("CFSSL_URL", cfssl_url(astarte)),
    ]
}

fn dashboard_env(astarte: &Astarte) -> Vec<EnvVar> {
    vec![plain_env("ASTARTE_API_URL", astarte.spec.api.base_url())]
}

fn cfssl_env(astarte: &Astarte) -> Vec<EnvVar> {
    let secret = devices_ca_secret(&astarte.name_any());
    vec![
        secret_env("CFSSL_CA_CERTIFICATE", &secret, "tls.crt"),
        secret_env("CFSSL_CA_KEY", &secret, "tls.key"),
        plain_env(
            "CFSSL_CA_EXPIRY",
            astarte
                .spec
                .cfssl
                .ca_expiry
                .clone()
                .unwrap_or_else(|| "8760h".to_string()),
        ),
    ]
}

// ============================================================================
// Volumes
// ============================================================================

fn no_volumes(_: &Astarte) -> Vec<(Volume, VolumeMount)> {
    Vec::new()
}

fn cfssl_volumes(astarte: &Astarte) -> Vec<(Volume, VolumeMount)> {
    if astarte.spec.cfssl.storage.is_none() {
        return Vec::new();
    }
    vec![(
        Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: cfssl_data_claim(&astarte.name_any()),
                read_only: None,
            }),
            ..Default::default()
        },
        VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        },
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_reconcile_order_is_fixed() {
        let names: Vec<&str> = ComponentKind::RECONCILE_ORDER
            .iter()
            .map(|k| k.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "housekeeping",
                "housekeeping-api",
                "realm-management",
                "realm-management-api",
                "pairing",
                "pairing-api",
                "data-updater-plant",
                "trigger-engine",
                "appengine-api",
                "flow",
                "vernemq",
                "dashboard",
            ]
        );
    }

    #[test]
    fn test_order_covers_every_kind_but_the_ca() {
        let ordered: BTreeSet<_> = ComponentKind::RECONCILE_ORDER.iter().copied().collect();
        let all: BTreeSet<_> = ComponentKind::ALL.iter().copied().collect();
        let missing: Vec<_> = all.difference(&ordered).copied().collect();
        assert_eq!(missing, vec![ComponentKind::Cfssl]);
    }

    #[test]
    fn test_exactly_three_deployments_always_recreate() {
        let recreate: Vec<_> = ComponentKind::ALL
            .iter()
            .filter(|k| k.traits().always_recreate)
            .copied()
            .collect();
        assert_eq!(
            recreate,
            vec![
                ComponentKind::Housekeeping,
                ComponentKind::DataUpdaterPlant,
                ComponentKind::TriggerEngine
            ]
        );
    }

    #[test]
    fn test_only_flow_defaults_to_not_deployed() {
        let off: Vec<_> = ComponentKind::ALL
            .iter()
            .filter(|k| !k.traits().default_deploy)
            .copied()
            .collect();
        assert_eq!(off, vec![ComponentKind::Flow]);
    }

    #[test]
    fn test_only_the_broker_is_stateful() {
        for kind in ComponentKind::ALL {
            let expected = if kind == ComponentKind::VerneMq {
                WorkloadKind::StatefulSet
            } else {
                WorkloadKind::Deployment
            };
            assert_eq!(kind.traits().workload, expected, "{kind}");
        }
    }

    fn secret_ref<'a>(env: &'a [EnvVar], name: &str) -> (&'a str, &'a str) {
        let selector = env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value_from.as_ref())
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap_or_else(|| panic!("{name} is not read from a secret"));
        (selector.name.as_deref().unwrap(), selector.key.as_str())
    }

    #[test]
    fn test_credentials_and_cookie_come_from_secrets() {
        let spec: AstarteSpec = serde_json::from_value(serde_json::json!({
            "version": "1.1.0",
            "api": {"host": "api.example.com"},
            "vernemq": {"host": "broker.example.com"},
            "rabbitmq": {"connection": {"host": "rabbitmq", "credentialsSecret": "amqp-creds"}}
        }))
        .unwrap();
        let astarte = Astarte::new("example", spec);

        let env = astarte_service_env(&astarte, ComponentKind::DataUpdaterPlant);
        assert_eq!(
            secret_ref(&env, "RPC_AMQP_CONNECTION_USERNAME"),
            ("amqp-creds", "username")
        );
        assert_eq!(
            secret_ref(&env, "RPC_AMQP_CONNECTION_PASSWORD"),
            ("amqp-creds", "password")
        );
        let cookie = cookie_secret_name("example", ComponentKind::DataUpdaterPlant);
        assert_eq!(secret_ref(&env, "RELEASE_COOKIE"), (cookie.as_str(), "cookie"));

        let pairing = astarte_service_env(&astarte, ComponentKind::Pairing);
        assert!(!pairing.iter().any(|e| e.name == "RELEASE_COOKIE"));
    }
}
