use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum_extra::TypedHeader;
use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::RegistryError;
use crate::registry::content_range::ContentRange;
use crate::registry::utils::body_stream;
use crate::state::RegistryState;

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
    upload_id: String,
}

pub(crate) async fn patch(
    Path(BlobUploadRequest {
        repository,
        upload_id,
    }): Path<BlobUploadRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    content_range: Option<TypedHeader<ContentRange>>,
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

    let Some(session) = registry.get_upload_session(&upload_id).await? else {
        return Err(RegistryError::UploadNotFound {});
    };

    // Appends to one session are serialised; concurrent PATCHes must not
    // race for the same part number.
    let lock = registry.lock_upload(&upload_id);
    let _guard = lock.lock().await;

    let size = registry.upload_size(&upload_id).await?;

    if let Some(content_range) = content_range {
        let start = content_range.0.first_byte;
        let stop = content_range.0.last_byte;

        if stop < start || start != size {
            return Err(RegistryError::RangeNotSatisfiable {
                repository: repository.clone(),
                upload_id: upload_id.clone(),
                size,
            });
        }
    }

    let staging_key = registry.upload_key(&session.file_id);
    let part_number = registry.next_part_number(&upload_id).await?;

    // A failed part upload leaves the session untouched so the client can
    // retry the same bytes and receive a fresh part number.
    let receipt = match registry
        .store
        .upload_part(
            &staging_key,
            &session.native_id,
            part_number,
            body_stream(body.into_body().into_data_stream()),
        )
        .await
    {
        Ok(receipt) => receipt,
        Err(err) => {
            tracing::warn!("Chunk upload for {upload_id} failed: {err:?}");
            return Err(RegistryError::UploadInvalid {});
        }
    };

    registry
        .record_upload_part(&upload_id, part_number, &receipt.etag, receipt.size)
        .await?;

    let size = size + receipt.size;

    /*
    202 Accepted
    Location: /v2/<name>/blobs/uploads/<uuid>
    Range: 0-<offset, inclusive>
    Content-Length: 0
    Docker-Upload-UUID: <uuid>
    */

    let range_end = if size > 0 { size - 1 } else { 0 };

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(
            "Location",
            format!("/v2/{}/blobs/uploads/{}", repository, upload_id),
        )
        .header("Range", format!("0-{range_end}"))
        .header("Content-Length", "0")
        .header("Docker-Upload-UUID", &upload_id)
        .body(Body::empty())?)
}
