use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::context::RequestContext;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::state::RegistryState;
use crate::state::blobs::BlobError;
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: String,
}

pub(crate) async fn delete(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
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

    let digest: Digest = digest.parse().map_err(|_| RegistryError::DigestInvalid {})?;

    if registry.get_blob(&digest).await?.is_none() {
        return Err(RegistryError::BlobNotFound {});
    }

    if let Err(err) = registry.delete_blob(&digest).await {
        if err.downcast_ref::<BlobError>().is_some() {
            return Err(RegistryError::BlobAssociated {});
        }
        return Err(err.into());
    }

    match registry.store.delete(&digest.blob_path()).await {
        Ok(()) | Err(StorageError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Content-Length", "0")
        .body(Body::empty())?)
}
