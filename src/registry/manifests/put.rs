use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::body::Body;
use serde::Deserialize;

use crate::context::RequestContext;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::manifest::parse_manifest;
use crate::queue::TaskPayload;
use crate::registry::utils::validate_name;
use crate::state::RegistryState;
use crate::storage::stream_of;

#[derive(Debug, Deserialize)]
pub struct ManifestPutRequest {
    repository: String,
    reference: String,
}

pub(crate) async fn put(
    Path(ManifestPutRequest {
        repository,
        reference,
    }): Path<ManifestPutRequest>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<Response, RegistryError> {
    if !context.validated_token {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.get_push_challenge(&repository),
        });
    }

    if !context.has_permission(&repository, "push") {
        return Err(RegistryError::AccessDenied {});
    }

    validate_name(&repository)?;

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .ok_or(RegistryError::ManifestInvalid {})?
        .to_string();

    let parsed = match parse_manifest(&payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::info!("Rejected manifest for {repository}: {err}");
            return Err(RegistryError::ManifestInvalid {});
        }
    };

    // Unknown manifest media types are refused outright
    let known_type = content_type.starts_with("application/vnd.docker.distribution.manifest.")
        || content_type.starts_with("application/vnd.oci.image.")
        || content_type == "application/json"
        || content_type.starts_with("application/json;");
    if !known_type {
        return Err(RegistryError::Unsupported {});
    }

    // A declared content type that contradicts the payload is invalid.
    // Legacy v1 clients declare the signed (+prettyjws) flavour, and some
    // send plain JSON.
    let legacy_v1 = parsed.media_type.ends_with("manifest.v1+json")
        && content_type.starts_with("application/vnd.docker.distribution.manifest.v1");
    if content_type != parsed.media_type
        && !legacy_v1
        && content_type != "application/json"
        && !content_type.starts_with("application/json;")
    {
        return Err(RegistryError::ManifestInvalid {});
    }

    // Referential integrity: every referenced blob and child manifest must
    // already be present before the manifest is accepted.
    for descriptor in parsed.blobs() {
        if !registry.blob_exists(&descriptor.digest).await? {
            return Err(RegistryError::ManifestBlobUnknown {});
        }
    }
    for descriptor in &parsed.references {
        if registry
            .get_artifact(&repository, &descriptor.digest)
            .await?
            .is_none()
        {
            return Err(RegistryError::ManifestBlobUnknown {});
        }
    }

    let digest = Digest::of_bytes(&payload);

    // Pushing by digest pins the reference to the content
    let tag = match reference.parse::<Digest>() {
        Ok(by_digest) => {
            if by_digest != digest {
                return Err(RegistryError::DigestInvalid {});
            }
            None
        }
        Err(_) => Some(reference.clone()),
    };

    // Manifests are blobs: the payload lands in the CAS before the index
    registry
        .store
        .upload(&digest.blob_path(), stream_of(payload.clone()))
        .await?;

    let outbox = vec![registry.task_statement(&TaskPayload::ArtifactPushed {
        repository: repository.clone(),
        digest: digest.clone(),
        tag: tag.clone().unwrap_or_default(),
        media_type: parsed.media_type.clone(),
    })?];

    registry
        .insert_artifact(&repository, &digest, &parsed, tag.as_deref(), outbox)
        .await?;

    /*
    201 Created
    Location: <url>
    Content-Length: 0
    Docker-Content-Digest: <digest>
    */
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(
            "Location",
            format!("/v2/{}/manifests/{}", repository, digest),
        )
        .header("Content-Length", "0")
        .header("Docker-Content-Digest", digest.to_string())
        .body(Body::empty())?)
}

#[cfg(test)]
mod test {
    use anyhow::{Context, Result};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use test_log::test;

    use crate::queue::TOPIC_ARTIFACT_PUSHED;
    use crate::tests::RegistryFixture;

    use super::*;

    #[test(tokio::test)]
    pub async fn empty_index_round_trip() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let payload = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": []
        })
        .to_string();
        let digest = Digest::of_bytes(payload.as_bytes());

        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri("/v2/ns/r/manifests/latest")
                    .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                    .body(Body::from(payload.clone()))?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(
            res.headers()
                .get("Docker-Content-Digest")
                .context("Missing digest")?
                .to_str()?,
            digest.to_string()
        );

        let res = fixture
            .request(
                Request::builder()
                    .uri("/v2/ns/r/manifests/latest")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], payload.as_bytes());

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn manifest_with_unknown_blob_is_refused() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let payload = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:24c422e681f1c1bd08286c7aaf5d23a5f088dcdb0b219806b3a9e579244f00c5",
                "size": 100
            },
            "layers": []
        })
        .to_string();

        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri("/v2/ns/r/manifests/latest")
                    .header(
                        "Content-Type",
                        "application/vnd.docker.distribution.manifest.v2+json",
                    )
                    .body(Body::from(payload))?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = res.into_body().collect().await?.to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn garbage_payload_is_invalid() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri("/v2/ns/r/manifests/latest")
                    .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                    .body(Body::from("{not json"))?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn push_by_digest_must_match() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let payload = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": []
        })
        .to_string();

        let wrong = "sha256:24c422e681f1c1bd08286c7aaf5d23a5f088dcdb0b219806b3a9e579244f00c5";
        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/v2/ns/r/manifests/{wrong}"))
                    .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                    .body(Body::from(payload.clone()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let digest = Digest::of_bytes(payload.as_bytes());
        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/v2/ns/r/manifests/{digest}"))
                    .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                    .body(Body::from(payload))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        // Pushed by digest, so no tag was created
        assert!(fixture.state().get_tags("ns/r").await?.is_empty());

        fixture.teardown().await
    }

    /// The accepted manifest and its queue task land in one transaction.
    #[test(tokio::test)]
    pub async fn push_produces_artifact_task() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

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
                    .uri("/v2/ns/r/manifests/latest")
                    .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                    .body(Body::from(payload))?,
            )
            .await?;

        let task = fixture
            .state()
            .claim_task(TOPIC_ARTIFACT_PUSHED, "c1")
            .await?
            .unwrap();
        assert_eq!(
            task.payload,
            TaskPayload::ArtifactPushed {
                repository: "ns/r".into(),
                digest,
                tag: "latest".into(),
                media_type: "application/vnd.oci.image.index.v1+json".into(),
            }
        );

        fixture.teardown().await
    }
}
