use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::RegistryError;
use crate::state::RegistryState;

use super::get::resolve;

#[derive(Debug, Deserialize)]
pub struct ManifestHeadRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn head(
    Path(ManifestHeadRequest {
        repository,
        reference,
    }): Path<ManifestHeadRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    if !context.validated_token {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.get_pull_challenge(&repository),
        });
    }

    if !context.has_permission(&repository, "pull") {
        return Err(RegistryError::AccessDenied {});
    }

    let Some(artifact) = resolve(&registry, &repository, &reference).await? else {
        return Err(RegistryError::ManifestNotFound {});
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Content-Digest", artifact.digest.to_string())
        .header(header::CONTENT_TYPE, artifact.media_type)
        .header(header::CONTENT_LENGTH, artifact.size)
        .body(Body::empty())?)
}
