//! Generic component reconciler
//!
//! One routine drives every component kind: it removes the workload of a
//! component that is switched off, and otherwise ensures the clustering
//! secret, the discovery RBAC, the Service and the workload. Errors are
//! returned unchanged; retrying is left to the controller.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::crd::Astarte;
use crate::error::Result;

use super::allocation;
use super::client::{ClusterClient, NamespacedObject};
use super::components::{cookie_secret_name, ComponentKind, WorkloadKind};
use super::config::OperatorConfig;
use super::resources::{
    build_cookie_secret, build_role, build_role_binding, build_service, build_service_account,
};
use super::workloads::{build_deployment, build_statefulset, WorkloadInputs};

/// Create `obj` unless an object with its name exists. Returns whether it
/// was created. Existing objects are never touched.
pub async fn ensure_created<C, K>(client: &C, namespace: &str, obj: &K) -> Result<bool>
where
    C: ClusterClient,
    K: NamespacedObject,
{
    let name = obj.name_any();
    if client.get::<K>(namespace, &name).await?.is_some() {
        return Ok(false);
    }
    match client.create(namespace, obj).await {
        Ok(_) => Ok(true),
        // Created concurrently
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

#[instrument(skip(client, config, astarte), fields(name = %astarte.name_any(), namespace = astarte.namespace(), component = %kind))]
pub async fn ensure_component<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    astarte: &Astarte,
    kind: ComponentKind,
) -> Result<()> {
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
    let instance = astarte.name_any();
    let traits = kind.traits();

    if !kind.is_deployed(&astarte.spec) {
        remove_workload(client, &namespace, &kind.resource_name(&instance), kind).await;
        return Ok(());
    }

    if traits.clustered {
        if ensure_created(client, &namespace, &build_cookie_secret(astarte, kind)).await? {
            info!(
                "Generated clustering cookie {}",
                cookie_secret_name(&instance, kind)
            );
        }
        client
            .apply(&namespace, &build_service_account(astarte, kind))
            .await?;
        client.apply(&namespace, &build_role(astarte, kind)).await?;
        client
            .apply(&namespace, &build_role_binding(astarte, kind))
            .await?;
    }

    client
        .apply(&namespace, &build_service(astarte, kind))
        .await?;

    let inputs = WorkloadInputs {
        replicas: resolve_replicas(client, &namespace, astarte, kind).await,
        resources: allocation::allocate(&config.allocation, &astarte.spec, kind)?,
    };

    match traits.workload {
        WorkloadKind::Deployment => {
            client
                .apply(&namespace, &build_deployment(astarte, kind, &inputs, config))
                .await?;
        }
        WorkloadKind::StatefulSet => {
            client
                .apply(&namespace, &build_statefulset(astarte, kind, &inputs, config))
                .await?;
        }
    }

    debug!("Component {} ensured with {} replicas", kind, inputs.replicas);
    Ok(())
}

/// Best-effort removal of a switched off component's workload. Service,
/// RBAC and secrets are kept so that switching it back on is cheap.
async fn remove_workload<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    kind: ComponentKind,
) {
    let result = match kind.traits().workload {
        WorkloadKind::Deployment => client.delete::<Deployment>(namespace, name).await,
        WorkloadKind::StatefulSet => client.delete::<StatefulSet>(namespace, name).await,
    };
    match result {
        Ok(true) => info!("Removed workload {} of disabled component {}", name, kind),
        Ok(false) => debug!("Component {} not deployed", kind),
        Err(e) => warn!("Failed to remove workload {}: {}", name, e),
    }
}

/// Replica count for the workload.
///
/// With autoscaling on and an autoscaler configured, its desired count wins,
/// except zero, which is taken as a transient reading. An unreachable or
/// missing autoscaler falls back to the static count.
pub async fn resolve_replicas<C: ClusterClient>(
    client: &C,
    namespace: &str,
    astarte: &Astarte,
    kind: ComponentKind,
) -> i32 {
    let component = kind.spec(&astarte.spec);
    let fixed = component.replicas.unwrap_or(1);

    let Some(autoscaler) = component
        .autoscaler
        .as_deref()
        .filter(|_| astarte.spec.features.autoscaling)
    else {
        return fixed;
    };

    match client
        .get::<HorizontalPodAutoscaler>(namespace, autoscaler)
        .await
    {
        Ok(Some(hpa)) => match hpa.status.map(|s| s.desired_replicas) {
            Some(desired) if desired > 0 => desired,
            _ => {
                debug!(
                    "Autoscaler {} reports no desired replicas, keeping {}",
                    autoscaler, fixed
                );
                fixed
            }
        },
        Ok(None) => {
            warn!("Autoscaler {} not found, using {} replicas", autoscaler, fixed);
            fixed
        }
        Err(e) => {
            warn!(
                "Cannot read autoscaler {}: {}, using {} replicas",
                autoscaler, e, fixed
            );
            fixed
        }
    }
}

