use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use crate::context::RequestContext;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::registry::utils::{body_stream, digest_of_object};
use crate::state::RegistryState;

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BlobUploadPutQuery {
    digest: String,
}

pub(crate) async fn put(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    Query(BlobUploadPutQuery { digest }): Query<BlobUploadPutQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    body: Request<Body>,
) -> Result<Response, RegistryError> {
    if !context.validated_token {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.get_push_challenge(&repository),
        });
    }

    if !context.has_permission(&repository, "push") {
        return Err(RegistryError::AccessDenied {});
    }

    let digest: Digest = digest.parse().map_err(|_| RegistryError::DigestInvalid {})?;

    let Some(session) = registry.get_upload_session(&upload_id).await? else {
        return Err(RegistryError::UploadNotFound {});
    };

    let lock = registry.lock_upload(&upload_id);
    let guard = lock.lock().await;

    let staging_key = registry.upload_key(&session.file_id);

    // A replayed commit converges: the session row outlives transient
    // failures, so skip any stage a previous attempt already finished.
    let already_assembled = matches!(
        registry.store.stat(&staging_key).await,
        Ok(_)
    );

    if !already_assembled && registry.blob_exists(&digest).await? {
        // A prior attempt got through the CAS move; only the session
        // cleanup is left to converge on.
        registry.delete_upload_session(&upload_id).await?;
        drop(guard);
        registry.release_upload_lock(&upload_id);

        return Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header("Location", format!("/v2/{}/blobs/{}", repository, digest))
            .header("Content-Length", "0")
            .header("Docker-Content-Digest", digest.to_string())
            .body(Body::empty())?);
    }

    if !already_assembled {
        // The commit may carry the final chunk
        let part_number = registry.next_part_number(&upload_id).await?;
        let receipt = registry
            .store
            .upload_part(
                &staging_key,
                &session.native_id,
                part_number,
                body_stream(body.into_body().into_data_stream()),
            )
            .await?;

        if receipt.size > 0 {
            registry
                .record_upload_part(&upload_id, part_number, &receipt.etag, receipt.size)
                .await?;
        }

        let parts = registry.upload_parts(&upload_id).await?;
        if parts.is_empty() {
            return Err(RegistryError::UploadInvalid {});
        }

        let etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();

        // Atomic assembly: either the whole staged object exists afterwards
        // or nothing does.
        registry
            .store
            .complete_multipart(&staging_key, &session.native_id, &etags)
            .await?;
    }

    let actual = digest_of_object(registry.store.as_ref(), &staging_key).await?;
    if actual != digest {
        // Fatal and non-retryable: throw the assembled object away
        registry.store.delete(&staging_key).await?;
        registry.delete_upload_session(&upload_id).await?;
        drop(guard);
        registry.release_upload_lock(&upload_id);
        return Err(RegistryError::DigestMismatch {});
    }

    let size = registry.store.stat(&staging_key).await?.size;

    if registry.blob_exists(&digest).await? {
        // Deduplicated: the content is already addressed, skip the move
        registry.store.delete(&staging_key).await?;
    } else {
        registry
            .store
            .rename(&staging_key, &digest.blob_path())
            .await?;
    }

    registry
        .insert_blob(&repository, &digest, size, "application/octet-stream")
        .await?;
    registry.delete_upload_session(&upload_id).await?;

    drop(guard);
    registry.release_upload_lock(&upload_id);

    /*
    201 Created
    Location: /v2/<name>/blobs/<digest>
    Content-Length: 0
    Docker-Content-Digest: <digest>
    */
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Location", format!("/v2/{}/blobs/{}", repository, digest))
        .header("Content-Length", "0")
        .header("Docker-Content-Digest", digest.to_string())
        .body(Body::empty())?)
}
