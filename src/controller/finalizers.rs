//! Finalizer handling for Astarte cleanup
//!
//! Objects owned by the instance are garbage collected by Kubernetes and
//! never appear here. The finalizer only removes what owner references
//! cannot reach:
//! 1. The devices CA secret, deliberately left unowned
//! 2. Persistent volume claims holding component data
//! 3. The cluster-scoped priority classes

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::crd::Astarte;
use crate::error::Result;

use super::client::ClusterClient;
use super::components::{cfssl_data_claim, devices_ca_secret, vernemq_data_claim};
use super::policy::{HIGH_PRIORITY_CLASS, LOW_PRIORITY_CLASS, MID_PRIORITY_CLASS};

/// Finalizer name used to protect Astarte resources
///
/// Added on the first reconcile; deletion of the instance waits until
/// [`finalize`] has run and the finalizer is removed.
pub const ASTARTE_FINALIZER: &str = "astarte.astarte-platform.org/finalizer";

/// Check if the instance has our finalizer
pub fn has_finalizer(astarte: &Astarte) -> bool {
    astarte.finalizers().iter().any(|f| f == ASTARTE_FINALIZER)
}

/// Add finalizer to an Astarte if not present
pub async fn add_finalizer<C: ClusterClient>(client: &C, astarte: &Astarte) -> Result<()> {
    if has_finalizer(astarte) {
        return Ok(());
    }
    let mut finalizers: Vec<String> = astarte.finalizers().to_vec();
    finalizers.push(ASTARTE_FINALIZER.to_string());
    client.set_finalizers(astarte, finalizers).await?;
    info!("Added finalizer to Astarte: {}", astarte.name_any());
    Ok(())
}

/// Remove finalizer after cleanup is complete
pub async fn remove_finalizer<C: ClusterClient>(client: &C, astarte: &Astarte) -> Result<()> {
    if !has_finalizer(astarte) {
        return Ok(());
    }
    let finalizers: Vec<String> = astarte
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != ASTARTE_FINALIZER)
        .cloned()
        .collect();
    client.set_finalizers(astarte, finalizers).await?;
    info!("Removed finalizer from Astarte: {}", astarte.name_any());
    Ok(())
}

/// Name prefixes of claims holding data of an instance
pub fn data_claim_prefixes(instance: &str) -> [String; 4] {
    [
        vernemq_data_claim(instance),
        format!("{instance}-rabbitmq-data"),
        cfssl_data_claim(instance),
        format!("{instance}-cassandra-data"),
    ]
}

/// Release everything the instance holds outside of owner references.
///
/// Safe to run again after a partial run: every step tolerates objects
/// that are already gone.
#[instrument(skip(client))]
pub async fn finalize<C: ClusterClient>(client: &C, name: &str, namespace: &str) -> Result<()> {
    let ca = devices_ca_secret(name);
    match client.delete::<Secret>(namespace, &ca).await {
        Ok(true) => info!("Deleted devices CA {}", ca),
        Ok(false) => {}
        Err(e) => warn!("Failed to delete devices CA {}: {}", ca, e),
    }

    let prefixes = data_claim_prefixes(name);
    let claims: Vec<PersistentVolumeClaim> = client.list(namespace, "").await?;
    for claim in claims {
        let claim_name = claim.name_any();
        if prefixes.iter().any(|p| claim_name.starts_with(p.as_str()))
            && client
                .delete::<PersistentVolumeClaim>(namespace, &claim_name)
                .await?
        {
            info!("Deleted volume claim {}", claim_name);
        }
    }

    for class in [HIGH_PRIORITY_CLASS, MID_PRIORITY_CLASS, LOW_PRIORITY_CLASS] {
        if client.delete_priority_class(class).await? {
            info!("Deleted priority class {}", class);
        }
    }

    Ok(())
}
