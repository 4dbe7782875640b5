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
use crate::state::artifacts::Artifact;
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
pub struct ManifestGetRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn resolve(
    registry: &RegistryState,
    repository: &str,
    reference: &str,
) -> Result<Option<Artifact>, RegistryError> {
    match reference.parse::<Digest>() {
        Ok(digest) => Ok(registry.get_artifact(repository, &digest).await?),
        Err(_) => Ok(registry.get_tag(repository, reference).await?),
    }
}

pub(crate) async fn get(
    Path(ManifestGetRequest {
        repository,
        reference,
    }): Path<ManifestGetRequest>,
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

    if let Some(artifact) = resolve(&registry, &repository, &reference).await? {
        let reader = match registry.store.reader(&artifact.digest.blob_path()).await {
            Ok(reader) => reader,
            Err(StorageError::NotFound) => {
                error!(
                    "Manifest {} indexed but missing from the object store",
                    artifact.digest
                );
                return Err(RegistryError::ManifestNotFound {});
            }
            Err(err) => return Err(err.into()),
        };

        // Pull accounting only applies to tag fetches
        if reference.parse::<Digest>().is_err() {
            registry.record_pull(&repository, &reference).await?;
        }

        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Docker-Content-Digest", artifact.digest.to_string())
            .header(header::CONTENT_TYPE, artifact.media_type)
            .header(header::CONTENT_LENGTH, artifact.size)
            .body(Body::from_stream(ReaderStream::new(reader)))?);
    }

    // Local miss: delegate to the proxied upstream when configured
    if let Some(proxy) = &registry.proxy {
        let Ok(upstream) = proxy.get_manifest(&repository, &reference).await else {
            return Err(RegistryError::Unavailable {});
        };

        if let Some((bytes, media_type, digest)) = upstream {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Docker-Content-Digest", digest.to_string())
                .header(header::CONTENT_TYPE, media_type)
                .header(header::CONTENT_LENGTH, bytes.len())
                .body(Body::from(bytes))?);
        }
    }

    Err(RegistryError::ManifestNotFound {})
}
