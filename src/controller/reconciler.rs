//! Main reconciler for Astarte resources
//!
//! Implements the controller pattern using kube-rs runtime. The runtime glue
//! ([`run_controller`], `reconcile`, `error_policy`) is thin; the actual
//! work happens in [`reconcile_astarte`], which only talks to the cluster
//! through a [`ClusterClient`].

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Astarte, ReconciliationPhase};
use crate::error::{Error, Result};

use super::client::{record_event, ClusterClient, EventSeverity, KubeClusterClient};
use super::component::ensure_component;
use super::components::ComponentKind;
use super::config::OperatorConfig;
use super::finalizers::{add_finalizer, finalize, has_finalizer, remove_finalizer};
use super::health::{
    compute_health, compute_status, ensure_status_coherency, record_health_transition,
};
use super::prerequisites::reconcile_prerequisites;
use super::status::update_status;
use super::upgrade::{
    check_upgrade, check_version_transition, parse_version, upgrade_necessity, UpgradeNecessity,
};

#[cfg(feature = "metrics")]
use super::metrics;

#[cfg(feature = "metrics")]
const CONTROLLER_NAME: &str = "astarte";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
}

/// Main entry point to start the controller
///
/// Watches Astarte objects in `namespace`, or in every namespace when
/// `None`, plus the objects they own.
pub async fn run_controller(state: Arc<ControllerState>, namespace: Option<String>) -> Result<()> {
    let client = state.client.clone();
    let astartes: Api<Astarte> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!("Starting Astarte controller");

    // Verify CRD exists
    match astartes.list(&Default::default()).await {
        Ok(_) => info!("Astarte CRD is available"),
        Err(e) => {
            error!("Astarte CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Astarte CRD not installed".to_string()));
        }
    }

    fn owned<K>(client: &Client, namespace: &Option<String>) -> Api<K>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    Controller::new(astartes, Config::default())
        // Watch owned resources for changes
        .owns::<Deployment>(owned(&client, &namespace), Config::default())
        .owns::<StatefulSet>(owned(&client, &namespace), Config::default())
        .owns::<Service>(owned(&client, &namespace), Config::default())
        .owns::<Secret>(owned(&client, &namespace), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Called by the runtime whenever an Astarte, or an object it owns, changes
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Astarte>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let client = KubeClusterClient::new(ctx.client.clone());
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    let result = Box::pin(reconcile_astarte(&client, &ctx.config, &namespace, &obj.name_any())).await;

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        started.elapsed().as_secs_f64(),
    );
    #[cfg(not(feature = "metrics"))]
    debug!("Reconcile took {:?}", started.elapsed());

    result
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(astarte: Arc<Astarte>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", astarte.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    Action::requeue(error.requeue_after())
}

/// Reconcile one Astarte instance against the cluster.
///
/// Components are reconciled in [`ComponentKind::RECONCILE_ORDER`] after the
/// prerequisites; status is persisted last. Every step is idempotent, so a
/// failed invocation is simply run again.
#[instrument(skip(client, config))]
pub async fn reconcile_astarte<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let Some(mut astarte) = client.get::<Astarte>(namespace, name).await? else {
        debug!("Astarte {}/{} not found, nothing to do", namespace, name);
        return Ok(Action::await_change());
    };

    if astarte.spec.manual_maintenance_mode {
        info!("Astarte {}/{} is in manual maintenance mode, only refreshing status", namespace, name);
        let health = Box::pin(compute_health(client, &astarte)).await?;
        let desired = compute_status(&astarte, health, config);
        Box::pin(update_status(client, &config.status_retry, namespace, name, |_| desired.clone())).await?;
        return Ok(Action::await_change());
    }

    if let Err(e) = parse_version(&astarte.spec.version) {
        warn!("Astarte {}/{}: {}", namespace, name, e);
        record_event(client, &astarte, EventSeverity::Warning, "InvalidVersion", &e.to_string()).await;
        return Ok(Action::requeue(config.invalid_version_requeue));
    }

    if astarte.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&astarte) {
            info!("Finalizing Astarte {}/{}", namespace, name);
            Box::pin(finalize(client, name, namespace)).await?;
            remove_finalizer(client, &astarte).await?;
        }
        return Ok(Action::await_change());
    }

    if let Err(errors) = astarte.spec.validate() {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        record_event(client, &astarte, EventSeverity::Warning, "InvalidSpec", &message).await;
        return Err(Error::ValidationError(message));
    }

    Box::pin(ensure_status_coherency(client, config, &mut astarte)).await?;
    add_finalizer(client, &astarte).await?;

    match upgrade_necessity(astarte.recorded_version(), &astarte.spec.version) {
        UpgradeNecessity::FreshInstall => {
            info!("Installing Astarte {} for {}/{}", astarte.spec.version, namespace, name);
            Box::pin(set_phase(client, config, namespace, name, ReconciliationPhase::Reconciling)).await?;
        }
        UpgradeNecessity::Snapshot => {
            debug!("Recorded version is a snapshot, skipping upgrade checks");
        }
        UpgradeNecessity::UpToDate => {}
        UpgradeNecessity::Upgrade { from, to } => {
            let computed = Box::pin(compute_health(client, &astarte)).await?;
            let gate = check_upgrade(astarte.recorded_health(), computed)
                .and_then(|_| check_version_transition(&from, &to));
            if let Err(e) = gate {
                record_event(client, &astarte, EventSeverity::Warning, "UpgradeRefused", &e.to_string()).await;
                return Err(e);
            }
            info!("Upgrading Astarte {}/{} from {} to {}", namespace, name, from, to);
            record_event(
                client,
                &astarte,
                EventSeverity::Normal,
                "Upgrading",
                &format!("Upgrading from {from} to {to}"),
            )
            .await;
            Box::pin(set_phase(client, config, namespace, name, ReconciliationPhase::Upgrading)).await?;
        }
    }

    if let Err(e) = Box::pin(reconcile_prerequisites(client, config, &astarte)).await {
        if matches!(e, Error::PriorityOrderError(_)) {
            record_event(client, &astarte, EventSeverity::Warning, "InvalidPriorities", &e.to_string()).await;
        }
        return Err(e);
    }

    for kind in ComponentKind::RECONCILE_ORDER {
        Box::pin(ensure_component(client, config, &astarte, kind)).await?;
    }

    let health = Box::pin(compute_health(client, &astarte)).await?;
    record_health_transition(client, &astarte, health).await;
    let desired = compute_status(&astarte, health, config);
    Box::pin(update_status(client, &config.status_retry, namespace, name, |_| desired.clone())).await?;

    #[cfg(feature = "metrics")]
    {
        metrics::set_cluster_health(namespace, name, health);
        metrics::set_deployed_components(
            namespace,
            name,
            ComponentKind::ALL
                .iter()
                .filter(|k| k.is_deployed(&astarte.spec))
                .count(),
        );
    }

    info!("Astarte {}/{} reconciled, health {}", namespace, name, health);
    Ok(Action::await_change())
}

async fn set_phase<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
    phase: ReconciliationPhase,
) -> Result<()> {
    update_status(client, &config.status_retry, namespace, name, |fresh| {
        let mut status = fresh.status.clone().unwrap_or_default();
        status.phase = phase;
        status
    })
    .await?;
    Ok(())
}
