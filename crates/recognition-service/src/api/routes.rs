use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use common::recognition::{
    AnalysisListResponse, AnalysisRequest, AnalysisSubmitResponse, AnalysisTask, EnrollRequest,
    EnrollResponse, GalleryListResponse, LiveMatchRequest, LiveMatchResponse,
};
use serde_json::json;

/// Queue a video analysis
pub async fn submit_analysis(
    State(state): State<AppState>,
    Json(request): Json<AnalysisRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks().submit(request).await.map_err(|e| {
        tracing::warn!(error = %e, "rejected analysis submission");
        ApiError::from(e)
    })?;

    let response = AnalysisSubmitResponse {
        task_id: task.task_id,
        status: task.status,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Poll one analysis
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<AnalysisTask>, ApiError> {
    Ok(Json(state.tasks().poll(&task_id).await?))
}

/// Cancel an analysis, returning its snapshot
pub async fn cancel_analysis(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<AnalysisTask>, ApiError> {
    Ok(Json(state.tasks().cancel(&task_id).await?))
}

/// List all analyses, oldest first
pub async fn list_analyses(State(state): State<AppState>) -> Json<AnalysisListResponse> {
    Json(AnalysisListResponse {
        tasks: state.tasks().list().await,
    })
}

/// Match the faces of a single live frame
pub async fn live_match(
    State(state): State<AppState>,
    Json(request): Json<LiveMatchRequest>,
) -> Result<Json<LiveMatchResponse>, ApiError> {
    let response = state
        .match_encoded_frame(&request.image, request.threshold)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "live match failed");
            ApiError::from(e)
        })?;
    Ok(Json(response))
}

/// List enrolled identities
pub async fn list_gallery(
    State(state): State<AppState>,
) -> Result<Json<GalleryListResponse>, ApiError> {
    Ok(Json(GalleryListResponse {
        identities: state.list_gallery().await?,
    }))
}

/// Enroll an identity from an embedding or a face image
pub async fn enroll_identity(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state.enroll(request).await.map_err(|e| {
        tracing::warn!(error = %e, "enrollment rejected");
        ApiError::from(e)
    })?;

    let response = EnrollResponse {
        success: true,
        message: Some(format!("Identity '{}' enrolled", entry.identity_id)),
        identity_id: entry.identity_id,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// Remove an identity from the gallery
pub async fn remove_identity(
    State(state): State<AppState>,
    Path(identity_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.remove_identity(&identity_id).await? {
        return Err(ApiError::not_found(format!(
            "Identity '{}' not found",
            identity_id
        )));
    }

    Ok(Json(json!({
        "success": true,
        "identity_id": identity_id,
    })))
}

/// Health check endpoint
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "recognition-service",
            "node_id": state.node_id(),
        })),
    )
}

/// Readiness check endpoint
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let detector = state.detectors().detector_id();

    if state.ready().await {
        (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "detector": detector,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "detector": detector,
            })),
        )
    }
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics() -> impl IntoResponse {
    match telemetry::metrics::encode_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}
