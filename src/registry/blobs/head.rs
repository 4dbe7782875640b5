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

#[derive(Debug, Deserialize)]
pub struct BlobRequest {
    repository: String,
    digest: String,
}

pub(crate) async fn head(
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
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Length", blob.size)
            .header("Content-Type", blob.media_type)
            .header("Docker-Content-Digest", digest.to_string())
            .body(Body::empty())?);
    }

    // Not present locally; the proxy may know it
    if let Some(proxy) = &registry.proxy {
        let Ok(upstream) = proxy.head_blob(&repository, &digest).await else {
            return Err(RegistryError::Unavailable {});
        };

        if let Some(descriptor) = upstream {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Length", descriptor.size)
                .header("Content-Type", descriptor.media_type)
                .header("Docker-Content-Digest", digest.to_string())
                .body(Body::empty())?);
        }
    }

    Err(RegistryError::BlobNotFound {})
}
