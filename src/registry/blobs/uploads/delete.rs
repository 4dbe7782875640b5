use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::RegistryError;
use crate::state::RegistryState;

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

/// Cancel an upload: abort the native multipart upload and drop the
/// session rows.
pub(crate) async fn delete(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    if !context.validated_token {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.get_push_challenge(&repository),
        });
    }

    if !context.has_permission(&repository, "push") {
        return Err(RegistryError::AccessDenied {});
    }

    let Some(session) = registry.get_upload_session(&upload_id).await? else {
        return Err(RegistryError::UploadNotFound {});
    };

    let lock = registry.lock_upload(&upload_id);
    let guard = lock.lock().await;

    let staging_key = registry.upload_key(&session.file_id);
    registry
        .store
        .abort_multipart(&staging_key, &session.native_id)
        .await?;

    registry.delete_upload_session(&upload_id).await?;

    drop(guard);
    registry.release_upload_lock(&upload_id);

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Content-Length", "0")
        .body(Body::empty())?)
}
