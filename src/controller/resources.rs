//! Kubernetes object builders for Astarte components
//!
//! Pure functions turning an `Astarte` and a component kind into the
//! objects the reconciler submits. Nothing here talks to the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret, Service, ServiceAccount,
    ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

use crate::crd::{Astarte, PriorityTier, StorageSpec};

use super::components::{cookie_secret_name, generic_erlang_configuration, ComponentKind};
use super::policy::priority_class_name;

/// Length of generated clustering cookies
pub const COOKIE_LENGTH: usize = 64;

pub const COMPONENT_LABEL: &str = "component";
pub const ASTARTE_COMPONENT_LABEL: &str = "astarte-component";
pub const INSTANCE_LABEL: &str = "astarte-instance-name";

/// Labels carried by every object of a component; also its pod selector
pub fn standard_labels(astarte: &Astarte, kind: ComponentKind) -> BTreeMap<String, String> {
    let instance = astarte.name_any();
    BTreeMap::from([
        ("app".to_string(), kind.resource_name(&instance)),
        (COMPONENT_LABEL.to_string(), "astarte".to_string()),
        (ASTARTE_COMPONENT_LABEL.to_string(), kind.name().to_string()),
        (INSTANCE_LABEL.to_string(), instance),
    ])
}

/// Label selector matching every workload of an instance
pub fn instance_selector(astarte: &Astarte) -> String {
    format!("{INSTANCE_LABEL}={}", astarte.name_any())
}

fn is_reserved_label(key: &str) -> bool {
    key == "app" || key == COMPONENT_LABEL || key.starts_with("astarte-")
}

/// Standard labels plus the user's pod labels; reserved keys are skipped
pub fn pod_labels(astarte: &Astarte, kind: ComponentKind) -> BTreeMap<String, String> {
    let mut labels = standard_labels(astarte, kind);
    for (key, value) in &kind.spec(&astarte.spec).pod_labels {
        if is_reserved_label(key) {
            warn!(
                "Ignoring reserved pod label {} on component {} of {}",
                key,
                kind,
                astarte.name_any()
            );
            continue;
        }
        labels.insert(key.clone(), value.clone());
    }
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(astarte: &Astarte) -> OwnerReference {
    OwnerReference {
        api_version: Astarte::api_version(&()).to_string(),
        kind: Astarte::kind(&()).to_string(),
        name: astarte.name_any(),
        uid: astarte.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata of an object garbage collected together with the instance
pub fn owned_meta(astarte: &Astarte, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: astarte.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(astarte)]),
        ..Default::default()
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service of a component. Clustered kinds get a headless Service so that
/// peers can resolve each other.
pub fn build_service(astarte: &Astarte, kind: ComponentKind) -> Service {
    let labels = standard_labels(astarte, kind);
    let traits = kind.traits();

    let ports = traits
        .ports
        .iter()
        .map(|p| ServicePort {
            name: Some(p.name.to_string()),
            port: p.port,
            target_port: Some(IntOrString::Int(p.port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: owned_meta(astarte, kind.resource_name(&astarte.name_any()), labels.clone()),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(ports),
            cluster_ip: traits.clustered.then(|| "None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// RBAC for clustered kinds
// ============================================================================

pub fn build_service_account(astarte: &Astarte, kind: ComponentKind) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(
            astarte,
            kind.resource_name(&astarte.name_any()),
            standard_labels(astarte, kind),
        ),
        ..Default::default()
    }
}

/// Read access to pods and endpoints, needed for peer discovery
pub fn build_role(astarte: &Astarte, kind: ComponentKind) -> Role {
    Role {
        metadata: owned_meta(
            astarte,
            kind.resource_name(&astarte.name_any()),
            standard_labels(astarte, kind),
        ),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string(), "endpoints".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
    }
}

pub fn build_role_binding(astarte: &Astarte, kind: ComponentKind) -> RoleBinding {
    let name = kind.resource_name(&astarte.name_any());
    RoleBinding {
        metadata: owned_meta(astarte, name.clone(), standard_labels(astarte, kind)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: astarte.namespace(),
            ..Default::default()
        }]),
    }
}

// ============================================================================
// Secrets and configuration
// ============================================================================

pub fn generate_cookie() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COOKIE_LENGTH)
        .map(char::from)
        .collect()
}

/// Fresh clustering cookie; only ever created, never rewritten
pub fn build_cookie_secret(astarte: &Astarte, kind: ComponentKind) -> Secret {
    let name = cookie_secret_name(&astarte.name_any(), kind);
    Secret {
        metadata: owned_meta(astarte, name, standard_labels(astarte, kind)),
        data: Some(BTreeMap::from([(
            "cookie".to_string(),
            ByteString(generate_cookie().into_bytes()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Single key opaque Secret owned by the instance
pub fn build_owned_secret(
    astarte: &Astarte,
    kind: ComponentKind,
    name: String,
    key: &str,
    value: &str,
) -> Secret {
    Secret {
        metadata: owned_meta(astarte, name, standard_labels(astarte, kind)),
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// TLS Secret holding the devices CA. It is not owned by the instance: the
/// CA must outlive accidental owner deletion and is removed on finalization.
pub fn build_devices_ca_secret(
    astarte: &Astarte,
    name: String,
    cert_pem: &str,
    key_pem: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: astarte.namespace(),
            labels: Some(standard_labels(astarte, ComponentKind::Cfssl)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                "tls.crt".to_string(),
                ByteString(cert_pem.as_bytes().to_vec()),
            ),
            ("tls.key".to_string(), ByteString(key_pem.as_bytes().to_vec())),
        ])),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

/// Erlang VM arguments shared by every Astarte service
pub fn erlang_vm_args() -> String {
    [
        "-name ${RELEASE_NAME}@${MY_POD_IP}",
        "-setcookie ${RELEASE_COOKIE}",
        "-smp auto",
        "+K true",
        "+A 128",
        "+Q 65536",
        "-kernel inet_dist_listen_min 9100",
        "-kernel inet_dist_listen_max 9155",
    ]
    .join("\n")
}

pub fn build_erlang_configuration(astarte: &Astarte) -> ConfigMap {
    let instance = astarte.name_any();
    let labels = BTreeMap::from([
        (COMPONENT_LABEL.to_string(), "astarte".to_string()),
        (INSTANCE_LABEL.to_string(), instance.clone()),
    ]);
    ConfigMap {
        metadata: owned_meta(astarte, generic_erlang_configuration(&instance), labels),
        data: Some(BTreeMap::from([("vm.args".to_string(), erlang_vm_args())])),
        ..Default::default()
    }
}

/// Claim outliving the instance; removed by the finalizer
pub fn build_data_claim(astarte: &Astarte, kind: ComponentKind, name: String, storage: &StorageSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: astarte.namespace(),
            labels: Some(standard_labels(astarte, kind)),
            ..Default::default()
        },
        spec: Some(build_claim_spec(storage)),
        status: None,
    }
}

pub fn build_claim_spec(storage: &StorageSpec) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        storage_class_name: storage.class_name.clone(),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(storage.size.clone()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Priority classes
// ============================================================================

/// Cluster-scoped, so never owner-referenced
pub fn build_priority_class(tier: PriorityTier, value: i32) -> PriorityClass {
    PriorityClass {
        metadata: ObjectMeta {
            name: Some(priority_class_name(tier).to_string()),
            labels: Some(BTreeMap::from([(
                COMPONENT_LABEL.to_string(),
                "astarte".to_string(),
            )])),
            ..Default::default()
        },
        value,
        global_default: Some(false),
        preemption_policy: Some("Never".to_string()),
        description: Some(format!(
            "Astarte {} priority workloads",
            match tier {
                PriorityTier::High => "high",
                PriorityTier::Mid => "mid",
                PriorityTier::Low => "low",
            }
        )),
    }
}
