//! Data transfer objects for the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{Astarte, AstarteStatus, ClusterHealth, ReconciliationPhase};
use kube::ResourceExt;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// One line of the instance list
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AstarteSummary {
    pub name: String,
    pub namespace: String,
    pub requested_version: String,
    pub phase: ReconciliationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ClusterHealth>,
}

impl From<&Astarte> for AstarteSummary {
    fn from(astarte: &Astarte) -> Self {
        Self {
            name: astarte.name_any(),
            namespace: astarte.namespace().unwrap_or_default(),
            requested_version: astarte.spec.version.clone(),
            phase: astarte
                .status
                .as_ref()
                .map(|s| s.phase)
                .unwrap_or_default(),
            health: astarte.recorded_health(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AstarteListResponse {
    pub items: Vec<AstarteSummary>,
    pub total: usize,
}

/// Full view of one instance
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AstarteDetailResponse {
    pub name: String,
    pub namespace: String,
    pub requested_version: String,
    pub manual_maintenance_mode: bool,
    pub status: AstarteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<Astarte> for AstarteDetailResponse {
    fn from(astarte: Astarte) -> Self {
        Self {
            name: astarte.name_any(),
            namespace: astarte.namespace().unwrap_or_default(),
            requested_version: astarte.spec.version.clone(),
            manual_maintenance_mode: astarte.spec.manual_maintenance_mode,
            created_at: astarte
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
            status: astarte.status.unwrap_or_default(),
        }
    }
}

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AstarteSpec;

    #[test]
    fn test_summary_of_unreconciled_instance() {
        let spec: AstarteSpec = serde_json::from_value(serde_json::json!({
            "version": "1.1.0",
            "api": {"host": "api.example.com"},
            "vernemq": {"host": "broker.example.com"}
        }))
        .unwrap();
        let mut astarte = Astarte::new("example", spec);
        astarte.metadata.namespace = Some("astarte".to_string());

        let summary = AstarteSummary::from(&astarte);
        assert_eq!(summary.phase, ReconciliationPhase::Unknown);
        assert_eq!(summary.health, None);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["requestedVersion"], "1.1.0");
        assert!(json.get("health").is_none());
    }
}
