//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::api::Api;
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::Astarte;

use super::dto::{
    AstarteDetailResponse, AstarteListResponse, AstarteSummary, ErrorResponse, HealthResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List all Astarte instances
#[instrument(skip(state))]
pub async fn list_astartes(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<AstarteListResponse>, ApiError> {
    let api: Api<Astarte> = Api::all(state.client.clone());

    match api.list(&Default::default()).await {
        Ok(list) => {
            let items: Vec<AstarteSummary> = list.items.iter().map(AstarteSummary::from).collect();
            let total = items.len();
            Ok(Json(AstarteListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list Astarte instances: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get a specific Astarte instance
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_astarte(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<AstarteDetailResponse>, ApiError> {
    let api: Api<Astarte> = Api::namespaced(state.client.clone(), &namespace);

    match api.get_opt(&name).await {
        Ok(Some(astarte)) => Ok(Json(AstarteDetailResponse::from(astarte))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Astarte {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get Astarte {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}

/// Prometheus text exposition of the operator metrics
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, ApiError> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("encode_failed", &e.to_string())),
        )
    })?;
    Ok(buffer)
}
