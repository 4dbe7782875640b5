use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::registry::utils::body_stream;
use crate::state::RegistryState;
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
pub struct CachePath {
    builder_id: u32,
}

async fn authorize_builder(
    registry: &RegistryState,
    context: &RequestContext,
    builder_id: u32,
    action: &str,
) -> Result<(), ApiError> {
    let Some(builder) = registry.get_builder(builder_id).await? else {
        return Err(ApiError::NotFound);
    };

    if !context.validated_token {
        return Err(ApiError::MustAuthenticate {
            challenge: context.get_push_challenge(&builder.repository),
        });
    }

    if !context.has_permission(&builder.repository, action) {
        return Err(ApiError::AccessDenied);
    }

    Ok(())
}

/// Store the layer cache tarball for a builder. Last writer wins; runners
/// of one builder never overlap.
pub(crate) async fn put(
    Path(CachePath { builder_id }): Path<CachePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    body: Request<Body>,
) -> Result<Response, ApiError> {
    authorize_builder(&registry, &context, builder_id, "push").await?;

    let key = registry.cache_key(builder_id);
    let size = match registry
        .store
        .upload(&key, body_stream(body.into_body().into_data_stream()))
        .await
    {
        Ok(size) => size,
        // Transient backend trouble; the runner retries the round trip
        Err(StorageError::Backend(_)) => return Err(ApiError::Unavailable),
        Err(err) => return Err(err.into()),
    };

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Length", "0")
        .header("Cache-Size", size)
        .body(Body::empty())?)
}

pub(crate) async fn get(
    Path(CachePath { builder_id }): Path<CachePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_builder(&registry, &context, builder_id, "pull").await?;

    let key = registry.cache_key(builder_id);

    let meta = match registry.store.stat(&key).await {
        Ok(meta) => meta,
        Err(StorageError::NotFound) => return Err(ApiError::NotFound),
        Err(err) => return Err(err.into()),
    };

    let reader = registry.store.reader(&key).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/x-tar")
        .header("Content-Length", meta.size)
        .body(Body::from_stream(ReaderStream::new(reader)))?)
}

pub(crate) async fn delete(
    Path(CachePath { builder_id }): Path<CachePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_builder(&registry, &context, builder_id, "push").await?;

    let key = registry.cache_key(builder_id);

    match registry.store.delete(&key).await {
        Ok(()) => {}
        Err(StorageError::NotFound) => return Err(ApiError::NotFound),
        Err(err) => return Err(err.into()),
    }

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())?)
}
