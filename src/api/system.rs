use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::state::RegistryState;

pub(crate) async fn version(
    State(_registry): State<Arc<RegistryState>>,
) -> Result<Response, ApiError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(
            json!({"version": env!("CARGO_PKG_VERSION")}).to_string(),
        ))?)
}

pub(crate) async fn endpoint(
    State(registry): State<Arc<RegistryState>>,
) -> Result<Response, ApiError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(
            json!({"endpoint": registry.config.url}).to_string(),
        ))?)
}

#[derive(Debug, Deserialize)]
pub struct CronValidation {
    rule: String,
}

/// Surfaced to the UI so a bad cron never reaches a stored rule.
pub(crate) async fn validate_cron(
    State(_registry): State<Arc<RegistryState>>,
    _context: RequestContext,
    Json(CronValidation { rule }): Json<CronValidation>,
) -> Result<Response, ApiError> {
    match crate::cron::validate(&rule) {
        Ok(()) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(json!({"valid": true}).to_string()))?),
        Err(message) => Err(ApiError::BadRequest(message)),
    }
}
