//! Workload builders
//!
//! Every component runs as a Deployment, except the broker which needs
//! stable identities and storage and runs as a StatefulSet.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PodSpec, PodTemplateSpec,
    ResourceRequirements, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::Astarte;

use super::components::{astarte_service_env, vernemq_data_claim, ComponentKind};
use super::config::OperatorConfig;
use super::policy;
use super::resources::{build_claim_spec, erlang_vm_args, owned_meta, pod_labels, standard_labels};

/// Pod annotation rolling Astarte services when the shared Erlang config changes
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "astarte-platform.org/erlang-config-checksum";

/// Inputs resolved by the component reconciler before building a workload
#[derive(Clone, Debug, Default)]
pub struct WorkloadInputs {
    pub replicas: i32,
    pub resources: Option<ResourceRequirements>,
}

pub fn config_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn build_container(astarte: &Astarte, kind: ComponentKind, inputs: &WorkloadInputs) -> Container {
    let spec = &astarte.spec;
    let traits = kind.traits();

    let mut env = if traits.astarte_service {
        astarte_service_env(astarte, kind)
    } else {
        Vec::new()
    };
    env.extend((traits.env)(astarte));
    env.extend(kind.spec(spec).additional_env.iter().cloned());

    let mounts: Vec<VolumeMount> = (traits.volumes)(astarte)
        .into_iter()
        .map(|(_, mount)| mount)
        .collect();

    Container {
        name: kind.name().to_string(),
        image: Some(kind.image(spec)),
        image_pull_policy: spec.image_pull_policy.clone(),
        ports: Some(
            traits
                .ports
                .iter()
                .map(|p| ContainerPort {
                    name: Some(p.name.to_string()),
                    container_port: p.port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        env: (!env.is_empty()).then_some(env),
        resources: inputs.resources.clone(),
        readiness_probe: Some(policy::readiness_probe(kind, spec)),
        liveness_probe: Some(policy::liveness_probe(kind, spec)),
        startup_probe: policy::startup_probe(kind, spec),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    }
}

fn build_pod_template(
    astarte: &Astarte,
    kind: ComponentKind,
    inputs: &WorkloadInputs,
    config: &OperatorConfig,
) -> PodTemplateSpec {
    let traits = kind.traits();
    let selector = standard_labels(astarte, kind);

    let volumes: Vec<_> = (traits.volumes)(astarte)
        .into_iter()
        .map(|(volume, _)| volume)
        .collect();

    let annotations = traits.astarte_service.then(|| {
        BTreeMap::from([(
            CONFIG_CHECKSUM_ANNOTATION.to_string(),
            config_checksum(&erlang_vm_args()),
        )])
    });

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels(astarte, kind)),
            annotations,
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![build_container(astarte, kind, inputs)],
            volumes: (!volumes.is_empty()).then_some(volumes),
            service_account_name: traits
                .clustered
                .then(|| kind.resource_name(&astarte.name_any())),
            affinity: policy::affinity(kind, &astarte.spec, &selector),
            priority_class_name: policy::priority_class(kind, &astarte.spec, config),
            ..Default::default()
        }),
    }
}

pub fn build_deployment(
    astarte: &Astarte,
    kind: ComponentKind,
    inputs: &WorkloadInputs,
    config: &OperatorConfig,
) -> Deployment {
    let labels = standard_labels(astarte, kind);
    let strategy = policy::deployment_strategy(kind, &astarte.spec);

    Deployment {
        metadata: owned_meta(astarte, kind.resource_name(&astarte.name_any()), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(inputs.replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some(strategy.as_str().to_string()),
                rolling_update: None,
            }),
            template: build_pod_template(astarte, kind, inputs, config),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_statefulset(
    astarte: &Astarte,
    kind: ComponentKind,
    inputs: &WorkloadInputs,
    config: &OperatorConfig,
) -> StatefulSet {
    let instance = astarte.name_any();
    let labels = standard_labels(astarte, kind);
    let name = kind.resource_name(&instance);

    let mut template = build_pod_template(astarte, kind, inputs, config);
    let claims = kind_storage(astarte, kind).map(|storage| {
        let claim_name = vernemq_data_claim(&instance);
        if let Some(container) = template
            .spec
            .as_mut()
            .and_then(|pod| pod.containers.first_mut())
        {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: claim_name.clone(),
                    mount_path: "/opt/vernemq/data".to_string(),
                    ..Default::default()
                });
        }
        vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(claim_name),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(build_claim_spec(storage)),
            status: None,
        }]
    });

    StatefulSet {
        metadata: owned_meta(astarte, name.clone(), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(inputs.replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            service_name: name,
            pod_management_policy: Some("Parallel".to_string()),
            template,
            volume_claim_templates: claims,
            ..Default::default()
        }),
        status: None,
    }
}

fn kind_storage(astarte: &Astarte, kind: ComponentKind) -> Option<&crate::crd::StorageSpec> {
    match kind {
        ComponentKind::VerneMq => astarte.spec.vernemq.storage.as_ref(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AstarteSpec, StorageSpec};

    fn astarte() -> Astarte {
        let spec: AstarteSpec = serde_json::from_value(serde_json::json!({
            "version": "1.1.0",
            "api": {"host": "api.example.com"},
            "vernemq": {"host": "broker.example.com"},
            "rabbitmq": {"connection": {"host": "rabbitmq", "credentialsSecret": "rmq"}},
            "cassandra": {"nodes": "cassandra:9042"}
        }))
        .unwrap();
        let mut astarte = Astarte::new("example", spec);
        astarte.metadata.namespace = Some("astarte".to_string());
        astarte
    }

    fn env_names(container: &Container) -> Vec<String> {
        container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn test_deployment_carries_policy_decisions() {
        let inputs = WorkloadInputs {
            replicas: 2,
            resources: None,
        };
        let dep = build_deployment(
            &astarte(),
            ComponentKind::TriggerEngine,
            &inputs,
            &OperatorConfig::default(),
        );
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.strategy.unwrap().type_.as_deref(),
            Some("Recreate")
        );
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("astarte/astarte_trigger_engine:1.1.0")
        );
        assert!(pod.affinity.is_some());
        assert!(pod.service_account_name.is_none());
        assert!(pod.priority_class_name.is_none());
    }

    #[test]
    fn test_clustered_service_gets_cookie_and_account() {
        let dep = build_deployment(
            &astarte(),
            ComponentKind::DataUpdaterPlant,
            &WorkloadInputs::default(),
            &OperatorConfig::default(),
        );
        let pod = dep.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.service_account_name.as_deref(),
            Some("example-data-updater-plant")
        );
        let names = env_names(&pod.containers[0]);
        assert!(names.contains(&"RELEASE_COOKIE".to_string()));
        assert!(names.contains(&"RPC_AMQP_CONNECTION_PASSWORD".to_string()));
    }

    #[test]
    fn test_additional_env_is_appended_last() {
        let mut a = astarte();
        a.spec.components.pairing.additional_env = vec![k8s_openapi::api::core::v1::EnvVar {
            name: "EXTRA".to_string(),
            value: Some("1".to_string()),
            ..Default::default()
        }];
        let dep = build_deployment(
            &a,
            ComponentKind::Pairing,
            &WorkloadInputs::default(),
            &OperatorConfig::default(),
        );
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let names = env_names(&pod.containers[0]);
        assert_eq!(names.last().map(String::as_str), Some("EXTRA"));
        assert!(names.contains(&"PAIRING_CFSSL_URL".to_string()));
    }

    #[test]
    fn test_broker_statefulset_claims_storage() {
        let mut a = astarte();
        a.spec.vernemq.storage = Some(StorageSpec {
            size: "4Gi".to_string(),
            class_name: None,
        });
        let sts = build_statefulset(
            &a,
            ComponentKind::VerneMq,
            &WorkloadInputs {
                replicas: 3,
                resources: None,
            },
            &OperatorConfig::default(),
        );
        let spec = sts.spec.unwrap();
        assert_eq!(spec.service_name, "example-vernemq");
        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims[0].metadata.name.as_deref(), Some("example-vernemq-data"));
        let mounts = spec.template.spec.unwrap().containers[0]
            .volume_mounts
            .clone()
            .unwrap();
        assert_eq!(mounts[0].mount_path, "/opt/vernemq/data");
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(config_checksum("a"), config_checksum("a"));
        assert_ne!(config_checksum("a"), config_checksum("b"));
        assert_eq!(config_checksum("a").len(), 64);
    }
}
