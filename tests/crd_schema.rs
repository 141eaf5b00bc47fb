//! Integration tests for the generated Astarte CRD

use astarte_k8s::crd::{Astarte, AstarteSpec};
use kube::CustomResourceExt;

const SAMPLE: &str = r#"
apiVersion: api.astarte-platform.org/v1alpha1
kind: Astarte
metadata:
  name: example
  namespace: astarte
spec:
  version: 1.1.0
  api:
    host: api.astarte.example.com
  rabbitmq:
    connection:
      host: rabbitmq.astarte.svc
      credentialsSecret: rabbitmq-credentials
  cassandra:
    nodes: cassandra:9042
  vernemq:
    host: broker.astarte.example.com
    storage:
      size: 4Gi
  features:
    autoscaling: true
  components:
    resources:
      requests:
        cpu: "2"
        memory: 4Gi
      limits:
        cpu: "4"
        memory: 8Gi
    flow:
      deploy: true
    dataUpdaterPlant:
      replicas: 3
      autoscaler: dup-hpa
"#;

#[test]
fn crd_identity() {
    let crd = Astarte::crd();
    assert_eq!(
        crd.metadata.name.as_deref(),
        Some("astartes.api.astarte-platform.org")
    );
    assert_eq!(crd.spec.group, "api.astarte-platform.org");
    assert_eq!(crd.spec.names.kind, "Astarte");
    assert_eq!(crd.spec.scope, "Namespaced");
    assert_eq!(
        crd.spec.names.short_names.as_deref(),
        Some(&["ast".to_string()][..])
    );

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version
        .subresources
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .is_some());
}

#[test]
fn crd_schema_requires_hosts() {
    let crd = serde_json::to_value(Astarte::crd()).unwrap();
    let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"];
    let required: Vec<&str> = spec["required"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(required.contains(&"version"));
    assert!(required.contains(&"api"));
    assert!(required.contains(&"vernemq"));
}

#[test]
fn crd_renders_as_yaml() {
    let yaml = serde_yaml::to_string(&Astarte::crd()).unwrap();
    assert!(yaml.contains("kind: CustomResourceDefinition"));
    assert!(yaml.contains("manualMaintenanceMode"));
}

#[test]
fn sample_manifest_parses_and_validates() {
    let astarte: Astarte = serde_yaml::from_str(SAMPLE).unwrap();
    assert_eq!(astarte.metadata.name.as_deref(), Some("example"));
    assert!(astarte.status.is_none());

    let spec: &AstarteSpec = &astarte.spec;
    assert!(spec.validate().is_ok());
    assert_eq!(spec.components.flow.deploy, Some(true));
    assert_eq!(spec.components.data_updater_plant.replicas, Some(3));
    assert_eq!(
        spec.rabbitmq.connection.credentials_secret.as_deref(),
        Some("rabbitmq-credentials")
    );
    assert_eq!(
        spec.vernemq.storage.as_ref().map(|s| s.size.as_str()),
        Some("4Gi")
    );
}
