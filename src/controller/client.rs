//! Cluster access used by the reconciler
//!
//! The reconciler talks to the API server only through [`ClusterClient`] so
//! that the reconciliation logic can be exercised against an in-memory
//! cluster in tests while production uses [`KubeClusterClient`].

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::crd::Astarte;
use crate::error::{Error, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "astarte-operator";

/// Namespaced Kubernetes object the reconciler manages
pub trait NamespacedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Event type as understood by the events API
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Normal => "Normal",
            EventSeverity::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects matching an equality label selector ("k=v,k2=v2")
    async fn list<K: NamespacedObject>(&self, namespace: &str, selector: &str) -> Result<Vec<K>>;

    /// Create an object; fails with 409 when it already exists
    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Create, or replace the live object with `obj` wholesale. The live
    /// resourceVersion guards the replace, so a concurrent writer yields 409.
    async fn apply<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete an object; returns whether it existed
    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Priority classes are cluster scoped
    async fn apply_priority_class(&self, class: &PriorityClass) -> Result<()>;

    async fn delete_priority_class(&self, name: &str) -> Result<bool>;

    /// Write `astarte.status`, guarded by its resourceVersion (409 when stale)
    async fn update_status(&self, astarte: &Astarte) -> Result<Astarte>;

    /// Overwrite the finalizer list
    async fn set_finalizers(&self, astarte: &Astarte, finalizers: Vec<String>) -> Result<()>;

    async fn publish_event(
        &self,
        astarte: &Astarte,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// Emit an event, logging instead of failing: events are advisory
pub async fn record_event<C: ClusterClient>(
    client: &C,
    astarte: &Astarte,
    severity: EventSeverity,
    reason: &str,
    message: &str,
) {
    if let Err(e) = client
        .publish_event(astarte, severity, reason, message)
        .await
    {
        warn!(
            "Failed to publish {} event for {}: {}",
            reason,
            astarte.name_any(),
            e
        );
    }
}

/// [`ClusterClient`] backed by the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list<K: NamespacedObject>(&self, namespace: &str, selector: &str) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn apply<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = obj.name_any();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let Some(live) = api.get_opt(&name).await? else {
            return Ok(api.create(&params, obj).await?);
        };
        // Replace rather than merge: fields added by other managers are dropped
        let mut desired = obj.clone();
        desired.meta_mut().resource_version = live.meta().resource_version.clone();
        Ok(api.replace(&name, &params, &desired).await?)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await.map_err(Error::from) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!("{} already gone", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_priority_class(&self, class: &PriorityClass) -> Result<()> {
        let api: Api<PriorityClass> = Api::all(self.client.clone());
        api.patch(
            &class.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(class),
        )
        .await?;
        Ok(())
    }

    async fn delete_priority_class(&self, name: &str) -> Result<bool> {
        let api: Api<PriorityClass> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await.map_err(Error::from) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update_status(&self, astarte: &Astarte) -> Result<Astarte> {
        let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Astarte> = Api::namespaced(self.client.clone(), &namespace);

        let resource_version = astarte
            .resource_version()
            .ok_or_else(|| Error::MissingField("metadata.resourceVersion".to_string()))?;
        // A merge patch carrying resourceVersion is rejected with 409 when stale
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": astarte.status,
        });

        Ok(api
            .patch_status(
                &astarte.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    async fn set_finalizers(&self, astarte: &Astarte, finalizers: Vec<String>) -> Result<()> {
        let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Astarte> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": { "finalizers": finalizers }
        });
        api.patch(
            &astarte.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        astarte: &Astarte,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-", astarte.name_any())),
                ..Default::default()
            },
            type_: Some(severity.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: astarte.object_ref(&()),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
