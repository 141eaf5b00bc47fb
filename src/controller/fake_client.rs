//! In-memory cluster for reconciler tests
//!
//! Objects are stored as JSON keyed by (kind, namespace, name). Every write
//! that changes an object is appended to a mutation log, which lets tests
//! assert ordering and idempotence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::crd::Astarte;
use crate::error::{Error, Result};

use super::client::{ClusterClient, EventSeverity, NamespacedObject};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct Store {
    objects: BTreeMap<Key, Value>,
    priority_classes: BTreeMap<String, Value>,
    mutations: Vec<Mutation>,
    events: Vec<RecordedEvent>,
    next_version: u64,
    status_conflicts: u32,
    status_attempts: u32,
    failing_gets: BTreeSet<(String, String)>,
}

impl Store {
    fn bump(&mut self, value: &mut Value) {
        self.next_version += 1;
        value["metadata"]["resourceVersion"] = Value::String(self.next_version.to_string());
    }

    fn log(&mut self, verb: &'static str, kind: &str, name: &str) {
        self.mutations.push(Mutation {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (fake cluster)"),
        reason: reason.to_string(),
        code,
    }))
}

/// Drop the fields the API server manages before comparing objects
fn comparable(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in [
                "resourceVersion",
                "uid",
                "creationTimestamp",
                "generation",
                "managedFields",
            ] {
                meta.remove(field);
            }
        }
    }
    value
}

fn labels_match(value: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, expected)) => {
                value["metadata"]["labels"][key].as_str() == Some(expected)
            }
            None => false,
        })
}

fn decode<K: DeserializeOwned>(value: &Value) -> Result<K> {
    Ok(serde_json::from_value(value.clone())?)
}

fn key_of<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

#[derive(Default)]
pub struct FakeCluster {
    store: Mutex<Store>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a mutation
    pub fn insert<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut store = self.store.lock().unwrap();
        let mut value = serde_json::to_value(obj).unwrap();
        store.bump(&mut value);
        let key = key_of::<K>(
            &obj.meta().namespace.clone().unwrap_or_default(),
            &obj.meta().name.clone().unwrap_or_default(),
        );
        store.objects.insert(key, value);
    }

    pub fn object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let store = self.store.lock().unwrap();
        store
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Names of stored objects of one kind, sorted
    pub fn names<K: Resource<DynamicType = ()>>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        let store = self.store.lock().unwrap();
        store
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.store.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.store.lock().unwrap().mutations.clear();
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.store.lock().unwrap().events.clone()
    }

    pub fn priority_class_names(&self) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .priority_classes
            .keys()
            .cloned()
            .collect()
    }

    /// The next `count` status writes race with an external status writer
    pub fn inject_status_conflicts(&self, count: u32) {
        self.store.lock().unwrap().status_conflicts = count;
    }

    /// Number of status writes attempted so far
    pub fn status_attempts(&self) -> u32 {
        self.store.lock().unwrap().status_attempts
    }

    /// Reads of this object fail with a server error
    pub fn fail_gets<K: Resource<DynamicType = ()>>(&self, name: &str) {
        self.store
            .lock()
            .unwrap()
            .failing_gets
            .insert((K::kind(&()).to_string(), name.to_string()));
    }

    /// Simulate the kubelet: every Deployment and StatefulSet becomes ready
    pub fn mark_workloads_ready(&self) {
        let mut store = self.store.lock().unwrap();
        for ((kind, _, _), value) in store.objects.iter_mut() {
            if kind == "Deployment" || kind == "StatefulSet" {
                let replicas = value["spec"]["replicas"].as_i64().unwrap_or(1);
                value["status"]["readyReplicas"] = Value::from(replicas);
                value["status"]["replicas"] = Value::from(replicas);
            }
        }
    }

    /// Make every replica of one workload unready
    pub fn mark_unready<K: Resource<DynamicType = ()>>(&self, namespace: &str, name: &str) {
        let mut store = self.store.lock().unwrap();
        if let Some(value) = store.objects.get_mut(&key_of::<K>(namespace, name)) {
            value["status"]["readyReplicas"] = Value::from(0);
        }
    }

    /// Edit a stored object as an external actor would, without logging
    pub fn edit<K, F>(&self, namespace: &str, name: &str, edit: F)
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
        F: FnOnce(&mut K),
    {
        let mut store = self.store.lock().unwrap();
        let key = key_of::<K>(namespace, name);
        let Some(value) = store.objects.get(&key) else {
            return;
        };
        let mut obj: K = serde_json::from_value(value.clone()).unwrap();
        edit(&mut obj);
        let mut value = serde_json::to_value(&obj).unwrap();
        store.bump(&mut value);
        store.objects.insert(key, value);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let store = self.store.lock().unwrap();
        let kind = K::kind(&()).to_string();
        if store.failing_gets.contains(&(kind, name.to_string())) {
            return Err(api_error(500, "InternalError"));
        }
        store
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(decode)
            .transpose()
    }

    async fn list<K: NamespacedObject>(&self, namespace: &str, selector: &str) -> Result<Vec<K>> {
        let store = self.store.lock().unwrap();
        let kind = K::kind(&()).to_string();
        store
            .objects
            .iter()
            .filter(|((k, ns, _), value)| *k == kind && ns == namespace && labels_match(value, selector))
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut store = self.store.lock().unwrap();
        let key = key_of::<K>(namespace, &obj.name_any());
        if store.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut value = serde_json::to_value(obj)?;
        store.bump(&mut value);
        let created = decode(&value)?;
        store.objects.insert(key.clone(), value);
        store.log("create", &key.0, &key.2);
        Ok(created)
    }

    async fn apply<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut store = self.store.lock().unwrap();
        let key = key_of::<K>(namespace, &obj.name_any());
        let mut value = serde_json::to_value(obj)?;

        if let Some(existing) = store.objects.get(&key) {
            if comparable(existing) == comparable(&value) {
                return decode(existing);
            }
            if let Some(status) = existing.get("status") {
                value["status"] = status.clone();
            }
        }

        store.bump(&mut value);
        let applied = decode(&value)?;
        store.objects.insert(key.clone(), value);
        store.log("apply", &key.0, &key.2);
        Ok(applied)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut store = self.store.lock().unwrap();
        let key = key_of::<K>(namespace, name);
        if store.objects.remove(&key).is_some() {
            store.log("delete", &key.0, &key.2);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn apply_priority_class(&self, class: &PriorityClass) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let name = class.name_any();
        let value = serde_json::to_value(class)?;
        if store.priority_classes.get(&name) != Some(&value) {
            store.priority_classes.insert(name.clone(), value);
            store.log("apply", "PriorityClass", &name);
        }
        Ok(())
    }

    async fn delete_priority_class(&self, name: &str) -> Result<bool> {
        let mut store = self.store.lock().unwrap();
        if store.priority_classes.remove(name).is_some() {
            store.log("delete", "PriorityClass", name);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn update_status(&self, astarte: &Astarte) -> Result<Astarte> {
        let mut store = self.store.lock().unwrap();
        store.status_attempts += 1;
        let key = key_of::<Astarte>(
            &astarte.namespace().unwrap_or_default(),
            &astarte.name_any(),
        );
        let Some(mut stored) = store.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };

        if store.status_conflicts > 0 {
            store.status_conflicts -= 1;
            // Another writer got there first
            stored["status"]["operatorVersion"] = Value::String("external-writer".to_string());
            store.bump(&mut stored);
            store.objects.insert(key.clone(), stored.clone());
        }

        let stored_version = stored["metadata"]["resourceVersion"].as_str().map(String::from);
        if astarte.resource_version() != stored_version {
            return Err(api_error(409, "Conflict"));
        }

        stored["status"] = serde_json::to_value(&astarte.status)?;
        store.bump(&mut stored);
        let updated = decode(&stored)?;
        store.objects.insert(key.clone(), stored);
        store.log("update_status", &key.0, &key.2);
        Ok(updated)
    }

    async fn set_finalizers(&self, astarte: &Astarte, finalizers: Vec<String>) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let key = key_of::<Astarte>(
            &astarte.namespace().unwrap_or_default(),
            &astarte.name_any(),
        );
        let Some(mut stored) = store.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };

        let deleting = !stored["metadata"]["deletionTimestamp"].is_null();
        if finalizers.is_empty() && deleting {
            store.objects.remove(&key);
            store.log("delete", &key.0, &key.2);
            return Ok(());
        }

        stored["metadata"]["finalizers"] = serde_json::to_value(&finalizers)?;
        store.bump(&mut stored);
        store.objects.insert(key.clone(), stored);
        store.log("set_finalizers", &key.0, &key.2);
        Ok(())
    }

    async fn publish_event(
        &self,
        _astarte: &Astarte,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.store.lock().unwrap().events.push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
