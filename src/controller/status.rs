//! Status persistence
//!
//! Status is rewritten from a fresh read of the instance on every attempt,
//! so a conflict with a concurrent writer is resolved by simply retrying.
//! Unchanged status is never written.

use kube::ResourceExt;
use tracing::debug;

use crate::crd::{Astarte, AstarteStatus};
use crate::error::{Error, Result};

use super::client::ClusterClient;
use super::retry::{with_retry, RetryPolicy};

/// Compute status from the latest instance and write it if it changed.
///
/// Returns the up to date instance, or `None` when it no longer exists.
pub async fn update_status<C, F>(
    client: &C,
    policy: &RetryPolicy,
    namespace: &str,
    name: &str,
    desired: F,
) -> Result<Option<Astarte>>
where
    C: ClusterClient,
    F: Fn(&Astarte) -> AstarteStatus,
{
    let desired = &desired;
    with_retry(policy, Error::is_conflict, move || async move {
        let Some(mut fresh) = client.get::<Astarte>(namespace, name).await? else {
            debug!("Astarte {}/{} is gone, skipping status write", namespace, name);
            return Ok(None);
        };
        let status = desired(&fresh);
        if fresh.status.as_ref() == Some(&status) {
            return Ok(Some(fresh));
        }
        fresh.status = Some(status);
        let updated = client.update_status(&fresh).await?;
        debug!(
            "Wrote status of {} at resourceVersion {:?}",
            updated.name_any(),
            updated.resource_version()
        );
        Ok(Some(updated))
    })
    .await
}
