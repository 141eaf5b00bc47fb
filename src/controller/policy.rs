//! Probe and placement policy
//!
//! Resolves health checks, anti-affinity, scheduling priority and rollout
//! strategy for a component. Every decision honors, in order: the
//! component's own override, the cluster-wide setting, the kind default.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, HTTPGetAction, PodAffinityTerm, PodAntiAffinity, Probe, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{AstarteSpec, DeploymentStrategyType, PriorityTier};

use super::components::{ComponentKind, ProbeShape};
use super::config::OperatorConfig;

pub const HIGH_PRIORITY_CLASS: &str = "astarte-high-priority";
pub const MID_PRIORITY_CLASS: &str = "astarte-mid-priority";
pub const LOW_PRIORITY_CLASS: &str = "astarte-low-priority";

/// Name of the cluster-scoped priority class backing a tier
pub fn priority_class_name(tier: PriorityTier) -> &'static str {
    match tier {
        PriorityTier::High => HIGH_PRIORITY_CLASS,
        PriorityTier::Mid => MID_PRIORITY_CLASS,
        PriorityTier::Low => LOW_PRIORITY_CLASS,
    }
}

fn default_probe(kind: ComponentKind, initial_delay: i32, period: i32) -> Probe {
    let mut probe = Probe {
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(5),
        ..Default::default()
    };
    match kind.traits().probe {
        ProbeShape::Http { path, port } => {
            probe.http_get = Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(port),
                ..Default::default()
            });
        }
        ProbeShape::Tcp { port } => {
            probe.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(port),
                host: None,
            });
        }
    }
    probe
}

pub fn readiness_probe(kind: ComponentKind, spec: &AstarteSpec) -> Probe {
    kind.spec(spec)
        .readiness_probe
        .clone()
        .unwrap_or_else(|| default_probe(kind, 10, 20))
}

pub fn liveness_probe(kind: ComponentKind, spec: &AstarteSpec) -> Probe {
    kind.spec(spec)
        .liveness_probe
        .clone()
        .unwrap_or_else(|| default_probe(kind, 60, 20))
}

/// Startup probes are opt-in only
pub fn startup_probe(kind: ComponentKind, spec: &AstarteSpec) -> Option<Probe> {
    kind.spec(spec).startup_probe.clone()
}

/// Custom affinity wins; otherwise a required anti-affinity spreading the
/// component's pods across nodes, unless explicitly disabled.
pub fn affinity(
    kind: ComponentKind,
    spec: &AstarteSpec,
    selector_labels: &BTreeMap<String, String>,
) -> Option<Affinity> {
    let component = kind.spec(spec);
    if let Some(custom) = &component.custom_affinity {
        return Some(custom.clone());
    }
    if !component.anti_affinity.unwrap_or(true) {
        return None;
    }
    Some(Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn deployment_strategy(kind: ComponentKind, spec: &AstarteSpec) -> DeploymentStrategyType {
    if kind.traits().always_recreate {
        return DeploymentStrategyType::Recreate;
    }
    kind.spec(spec)
        .deployment_strategy
        .or(spec.deployment_strategy)
        .unwrap_or(DeploymentStrategyType::RollingUpdate)
}

/// Priority class for the component's pods, only when pod priorities are on
pub fn priority_class(
    kind: ComponentKind,
    spec: &AstarteSpec,
    config: &OperatorConfig,
) -> Option<String> {
    spec.features.enabled_priorities()?;
    let tier = kind
        .spec(spec)
        .priority_class
        .unwrap_or_else(|| config.default_priority(kind));
    Some(priority_class_name(tier).to_string())
}
