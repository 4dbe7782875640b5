use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::registry::utils::{body_stream, digest_of_object, validate_name};
use crate::state::RegistryState;
use crate::state::uploads::generate_file_id;
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
pub struct BlobUploadRequest {
    repository: String,
}

#[derive(Debug, Deserialize)]
pub struct BlobUploadPostQuery {
    mount: Option<String>,
    from: Option<String>,
    digest: Option<String>,
}

pub(crate) async fn post(
    Path(BlobUploadRequest { repository }): Path<BlobUploadRequest>,
    Query(query): Query<BlobUploadPostQuery>,
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

    validate_name(&repository)?;

    // Cross repository mount: the blob is content addressed, so a mount is
    // a metadata-only 201 when the digest is already known.
    if let (Some(mount), Some(from)) = (&query.mount, &query.from) {
        if from == &repository {
            return Err(RegistryError::UploadInvalid {});
        }

        if !context.has_permission(from, "pull") {
            return Err(RegistryError::UploadInvalid {});
        }

        let mount: Digest = mount.parse().map_err(|_| RegistryError::DigestInvalid {})?;

        if registry.blob_exists(&mount).await? {
            /*
            201 Created
            Location: <blob location>
            Content-Length: 0
            Docker-Content-Digest: <digest>
            */
            return Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header("Location", format!("/v2/{}/blobs/{}", repository, mount))
                .header("Range", "0-0")
                .header("Content-Length", "0")
                .header("Docker-Content-Digest", mount.to_string())
                .body(Body::empty())?);
        }
        // Fall through to a regular upload session when the mount missed
    }

    match &query.digest {
        Some(digest) => {
            // Monolithic upload: the whole blob arrives in this request
            let digest: Digest =
                digest.parse().map_err(|_| RegistryError::DigestInvalid {})?;

            let file_id = generate_file_id();
            let staging_key = registry.upload_key(&file_id);

            registry
                .store
                .upload(&staging_key, body_stream(body.into_body().into_data_stream()))
                .await?;

            let actual = digest_of_object(registry.store.as_ref(), &staging_key).await?;
            if actual != digest {
                registry.store.delete(&staging_key).await?;
                return Err(RegistryError::DigestInvalid {});
            }

            let size = registry.store.stat(&staging_key).await?.size;

            if registry.blob_exists(&digest).await? {
                // Already content addressed; drop the duplicate bytes
                registry.store.delete(&staging_key).await?;
            } else {
                registry.store.rename(&staging_key, &digest.blob_path()).await?;
            }

            registry
                .insert_blob(&repository, &digest, size, "application/octet-stream")
                .await?;

            Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header("Location", format!("/v2/{}/blobs/{}", repository, digest))
                .header("Range", "0-0")
                .header("Content-Length", "0")
                .header("Docker-Content-Digest", digest.to_string())
                .body(Body::empty())?)
        }
        None => {
            // Start a resumable session backed by a native multipart upload
            let upload_id = Uuid::new_v4().as_hyphenated().to_string();
            let file_id = generate_file_id();
            let staging_key = registry.upload_key(&file_id);

            let native_id = match registry.store.create_multipart(&staging_key).await {
                Ok(native_id) => native_id,
                Err(StorageError::NotFound) => return Err(RegistryError::UploadInvalid {}),
                Err(err) => {
                    tracing::error!("Object store refused multipart start: {err:?}");
                    return Err(RegistryError::UploadInvalid {});
                }
            };

            registry
                .create_upload_session(&upload_id, &file_id, &native_id, &repository)
                .await?;

            /*
            202 Accepted
            Location: /v2/<name>/blobs/uploads/<uuid>
            Range: 0-0
            Content-Length: 0
            Docker-Upload-UUID: <uuid>
            */
            Ok(Response::builder()
                .status(StatusCode::ACCEPTED)
                .header(
                    "Location",
                    format!("/v2/{}/blobs/uploads/{}", repository, upload_id),
                )
                .header("Range", "0-0")
                .header("Content-Length", "0")
                .header("Docker-Upload-UUID", upload_id)
                .body(Body::empty())?)
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::{Context, Result};
    use axum::http::Request;
    use test_log::test;

    use crate::tests::RegistryFixture;

    use super::*;

    #[test(tokio::test)]
    pub async fn start_session_issues_location_and_uuid() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/v2/ns/r/blobs/uploads/")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let upload_id = res
            .headers()
            .get("Docker-Upload-UUID")
            .context("Missing upload uuid")?
            .to_str()?;
        assert!(!upload_id.contains('/'));

        assert_eq!(
            res.headers().get("Location").context("Missing location")?,
            &format!("/v2/ns/r/blobs/uploads/{upload_id}")
        );
        assert_eq!(res.headers().get("Range").context("Missing range")?, "0-0");

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn names_without_namespace_are_invalid() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/v2/justname/blobs/uploads/")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }

    /// Monolithic push of a 12 byte blob, then HEAD and GET it back.
    #[test(tokio::test)]
    pub async fn monolithic_push_and_pull() -> Result<()> {
        use http_body_util::BodyExt;

        let fixture = RegistryFixture::new().await?;

        let digest = "sha256:7509e5bda0c762d2bac7f90d758b5b2263fa01ccbc542ab5e3df163be08e6ca9";

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v2/library/alpine/blobs/uploads/?digest={digest}"))
                    .body(Body::from("hello world!"))?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(
            res.headers()
                .get("Docker-Content-Digest")
                .context("Missing digest header")?
                .to_str()?,
            digest
        );

        let res = fixture
            .request(
                Request::builder()
                    .method("HEAD")
                    .uri(format!("/v2/library/alpine/blobs/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()
                .get("Content-Length")
                .context("Missing length")?,
            "12"
        );

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!("/v2/library/alpine/blobs/{digest}"))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"hello world!");

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn monolithic_upload_with_wrong_digest() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/v2/ns/r/blobs/uploads/?digest=sha256:24c422e681f1c1bd08286c7aaf5d23a5f088dcdb0b219806b3a9e579244f00c5")
                    .body(Body::from("hello world!"))?,
            )
            .await?;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn mount_unknown_blob_starts_session() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/v2/ns/r/blobs/uploads/?mount=sha256:24c422e681f1c1bd08286c7aaf5d23a5f088dcdb0b219806b3a9e579244f00c5&from=ns/other")
                    .body(Body::empty())?,
            )
            .await?;

        // Mount misses fall back to a fresh upload session
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert!(res.headers().get("Docker-Upload-UUID").is_some());

        fixture.teardown().await
    }
}
