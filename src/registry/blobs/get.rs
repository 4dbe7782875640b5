use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::error;

use crate::context::RequestContext;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::state::RegistryState;
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: String,
}

/*
200 OK
Docker-Content-Digest: <digest>
Content-Type: <media type of blob>

...
*/

pub(crate) async fn get(
    Path(BlobRequest { repository, digest }): Path<BlobRequest>,
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

    let digest: Digest = digest.parse().map_err(|_| RegistryError::DigestInvalid {})?;

    if let Some(blob) = registry.get_blob(&digest).await? {
        let reader = match registry.store.reader(&digest.blob_path()).await {
            Ok(reader) => reader,
            Err(StorageError::NotFound) => {
                error!("Blob {digest} indexed but missing from the object store");
                return Err(RegistryError::BlobNotFound {});
            }
            Err(err) => return Err(err.into()),
        };

        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, blob.media_type)
            .header(header::CONTENT_LENGTH, blob.size)
            .header("Docker-Content-Digest", digest.to_string())
            .body(Body::from_stream(ReaderStream::new(reader)))?);
    }

    if let Some(proxy) = &registry.proxy {
        // Upstream trouble is transient for the client: 503, not 500
        let Ok(upstream) = proxy.get_blob(&repository, &digest).await else {
            return Err(RegistryError::Unavailable {});
        };

        if let Some((descriptor, upstream)) = upstream {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, descriptor.media_type)
                .header(header::CONTENT_LENGTH, descriptor.size)
                .header("Docker-Content-Digest", digest.to_string())
                .body(Body::from_stream(upstream.bytes_stream()))?);
        }
    }

    Err(RegistryError::BlobNotFound {})
}
