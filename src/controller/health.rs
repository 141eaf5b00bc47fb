//! Health and status aggregation
//!
//! Health is a reduction over the managed workloads: a workload is unhealthy
//! when it wants replicas but has none ready. Zero unhealthy workloads is
//! green, one is yellow, more is red.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::{Astarte, AstarteStatus, ClusterHealth, ReconciliationPhase};
use crate::error::{Error, Result};

use super::client::{record_event, ClusterClient, EventSeverity};
use super::components::ComponentKind;
use super::config::OperatorConfig;
use super::resources::{instance_selector, ASTARTE_COMPONENT_LABEL};
use super::status::update_status;

/// Wants replicas but has none ready
pub fn is_unhealthy(desired: i32, ready: i32) -> bool {
    desired > 0 && ready == 0
}

fn deployment_unhealthy(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    is_unhealthy(desired, ready)
}

fn statefulset_unhealthy(statefulset: &StatefulSet) -> bool {
    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = statefulset
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    is_unhealthy(desired, ready)
}

/// Count unhealthy workloads of the instance and reduce to a health signal
pub async fn compute_health<C: ClusterClient>(client: &C, astarte: &Astarte) -> Result<ClusterHealth> {
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
    let instance = astarte.name_any();

    let deployments: Vec<Deployment> = client.list(&namespace, &instance_selector(astarte)).await?;
    let mut unhealthy: usize = deployments
        .iter()
        // The CA is checked on its own below
        .filter(|d| {
            d.labels().get(ASTARTE_COMPONENT_LABEL).map(String::as_str)
                != Some(ComponentKind::Cfssl.name())
        })
        .filter(|d| deployment_unhealthy(d))
        .count();

    if ComponentKind::VerneMq.is_deployed(&astarte.spec) {
        let name = ComponentKind::VerneMq.resource_name(&instance);
        let healthy = match client.get::<StatefulSet>(&namespace, &name).await {
            Ok(Some(sts)) => !statefulset_unhealthy(&sts),
            Ok(None) => false,
            Err(e) => {
                warn!("Cannot read broker {}: {}", name, e);
                false
            }
        };
        if !healthy {
            unhealthy += 1;
        }
    }

    if ComponentKind::Cfssl.is_deployed(&astarte.spec) {
        let name = ComponentKind::Cfssl.resource_name(&instance);
        let healthy = match client.get::<Deployment>(&namespace, &name).await {
            Ok(Some(dep)) => !deployment_unhealthy(&dep),
            Ok(None) => false,
            Err(e) => {
                warn!("Cannot read CA {}: {}", name, e);
                false
            }
        };
        if !healthy {
            unhealthy += 1;
        }
    }

    let health = ClusterHealth::from_unhealthy_count(unhealthy);
    debug!("{} unhealthy workloads, health {}", unhealthy, health);
    Ok(health)
}

/// Status describing the instance as reconciled with the given health.
///
/// In maintenance mode nothing was reconciled, so the recorded version is
/// kept.
pub fn compute_status(astarte: &Astarte, health: ClusterHealth, config: &OperatorConfig) -> AstarteStatus {
    let (phase, version) = if astarte.spec.manual_maintenance_mode {
        (
            ReconciliationPhase::ManualMaintenanceMode,
            astarte.recorded_version().to_string(),
        )
    } else {
        (ReconciliationPhase::Reconciled, astarte.spec.version.clone())
    };

    AstarteStatus {
        phase,
        astarte_version: version,
        operator_version: config.operator_version.clone(),
        health: Some(health),
        base_api_url: astarte.spec.api.base_url(),
        broker_url: astarte.spec.vernemq.broker_url(),
        observed_generation: astarte.metadata.generation,
    }
}

/// Publish an event when the health signal changes
pub async fn record_health_transition<C: ClusterClient>(
    client: &C,
    astarte: &Astarte,
    current: ClusterHealth,
) {
    let previous = astarte.recorded_health();
    if previous == Some(current) {
        return;
    }
    let severity = if previous == Some(ClusterHealth::Green) {
        EventSeverity::Warning
    } else {
        EventSeverity::Normal
    };
    let message = match previous {
        Some(previous) => format!("Cluster health changed from {previous} to {current}"),
        None => format!("Cluster health is {current}"),
    };
    record_event(client, astarte, severity, "HealthChanged", &message).await;
}

/// Version encoded in an image reference of the form `name:version`
pub fn version_from_image(image: &str) -> Result<String> {
    let parts: Vec<&str> = image.split(':').collect();
    match parts.as_slice() {
        [_, tag] if !tag.is_empty() => Ok(tag.to_string()),
        _ => Err(Error::ImageTagError {
            image: image.to_string(),
        }),
    }
}

/// Recover a lost status from the live Housekeeping workload.
///
/// Nothing to do when a version is recorded or when Housekeeping does not
/// exist yet (fresh install). On success `astarte` is replaced by the
/// instance carrying the recovered status.
pub async fn ensure_status_coherency<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    astarte: &mut Astarte,
) -> Result<()> {
    if !astarte.recorded_version().is_empty() {
        return Ok(());
    }
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
    let instance = astarte.name_any();
    let housekeeping = ComponentKind::Housekeeping.resource_name(&instance);

    let Some(deployment) = client.get::<Deployment>(&namespace, &housekeeping).await? else {
        debug!("No status and no {}, treating as a fresh install", housekeeping);
        return Ok(());
    };

    let image = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.clone())
        .ok_or_else(|| Error::MissingField(format!("{housekeeping} container image")))?;

    let version = match version_from_image(&image) {
        Ok(version) => version,
        Err(e) => {
            record_event(
                client,
                astarte,
                EventSeverity::Warning,
                "StatusRecoveryFailed",
                &e.to_string(),
            )
            .await;
            return Err(e);
        }
    };

    let recovered = update_status(client, &config.status_retry, &namespace, &instance, |fresh| {
        let mut status = fresh.status.clone().unwrap_or_default();
        status.astarte_version = version.clone();
        status
    })
    .await?;

    if let Some(recovered) = recovered {
        info!("Recovered Astarte version {} from {}", version, housekeeping);
        record_event(
            client,
            &recovered,
            EventSeverity::Normal,
            "StatusRecovered",
            &format!("Recovered version {version} from the running cluster"),
        )
        .await;
        *astarte = recovered;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reduction_over_replica_combinations() {
        let workloads: Vec<(i32, i32)> = (0..3)
            .flat_map(|desired| (0..3).map(move |ready| (desired, ready)))
            .collect();
        // Every combination of up to three workloads
        for a in &workloads {
            for b in &workloads {
                for c in &workloads {
                    let unhealthy = [a, b, c]
                        .iter()
                        .filter(|(desired, ready)| is_unhealthy(*desired, *ready))
                        .count();
                    let expected = match unhealthy {
                        0 => ClusterHealth::Green,
                        1 => ClusterHealth::Yellow,
                        _ => ClusterHealth::Red,
                    };
                    assert_eq!(ClusterHealth::from_unhealthy_count(unhealthy), expected);
                }
            }
        }
    }

    #[test]
    fn test_scaled_down_workload_is_not_unhealthy() {
        assert!(!is_unhealthy(0, 0));
        assert!(is_unhealthy(2, 0));
        assert!(!is_unhealthy(2, 1));
    }

    #[test]
    fn test_version_from_image() {
        assert_eq!(
            version_from_image("astarte/astarte_housekeeping:1.1.0").unwrap(),
            "1.1.0"
        );
        assert!(matches!(
            version_from_image("astarte/astarte_housekeeping"),
            Err(Error::ImageTagError { .. })
        ));
        assert!(matches!(
            version_from_image("registry:5000/astarte/astarte_housekeeping:1.1.0"),
            Err(Error::ImageTagError { .. })
        ));
    }
}
