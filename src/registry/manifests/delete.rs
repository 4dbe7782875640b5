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
pub struct ManifestDeleteRequest {
    repository: String,
    reference: String,
}

/// By digest: the artifact goes, and every tag pointing at it. By tag: only
/// the tag row goes; GC reclaims orphaned blobs later.
pub(crate) async fn delete(
    Path(ManifestDeleteRequest {
        repository,
        reference,
    }): Path<ManifestDeleteRequest>,
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

    match reference.parse::<Digest>() {
        Ok(digest) => {
            if registry.get_artifact(&repository, &digest).await?.is_none() {
                return Err(RegistryError::ManifestNotFound {});
            }

            registry.delete_artifact(&repository, &digest).await?;
        }
        Err(_) => {
            if registry.get_tag(&repository, &reference).await?.is_none() {
                return Err(RegistryError::ManifestNotFound {});
            }

            registry.delete_tag(&repository, &reference).await?;
        }
    }

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Content-Length", "0")
        .body(Body::empty())?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use test_log::test;

    use crate::tests::RegistryFixture;

    use super::*;

    async fn push_index(fixture: &RegistryFixture, tag: &str) -> Result<Digest> {
        let payload = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": []
        })
        .to_string();
        let digest = Digest::of_bytes(payload.as_bytes());

        fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/v2/ns/r/manifests/{tag}"))
                    .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                    .body(Body::from(payload))?,
            )
            .await?;

        Ok(digest)
    }

    #[test(tokio::test)]
    pub async fn delete_by_tag_keeps_artifact() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let digest = push_index(&fixture, "latest").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri("/v2/ns/r/manifests/latest")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        // Artifact still addressable by digest
        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/ns/r/manifests/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn delete_by_digest_takes_tags() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let digest = push_index(&fixture, "latest").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/v2/ns/r/manifests/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = fixture
            .request(
                Request::builder()
                    .uri("/v2/ns/r/manifests/latest")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn delete_unknown_manifest() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri("/v2/ns/r/manifests/nope")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }
}
