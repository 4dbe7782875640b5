use anyhow::Result;
use hiqlite_macros::params;
use serde::Deserialize;
use thiserror::Error;

use super::RegistryState;
use crate::digest::Digest;
use crate::notify::Notification;

#[derive(Debug, Deserialize)]
struct BlobRow {
    digest: Digest,
    size: u64,
    media_type: String,
    pushed_at: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Blob {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
    pub pushed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob is still referenced by at least one artifact")]
    Associated,
}

impl RegistryState {
    pub async fn get_blob(&self, digest: &Digest) -> Result<Option<Blob>> {
        let res: Option<BlobRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM blobs WHERE digest = $1;",
                params!(digest.to_string()),
            )
            .await?;

        res.map(|row| {
            Ok(Blob {
                digest: row.digest,
                size: row.size,
                media_type: row.media_type,
                pushed_at: super::parse_datetime(&row.pushed_at)?,
            })
        })
        .transpose()
    }

    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.get_blob(digest).await?.is_some())
    }

    /// Insert is idempotent on digest so a replayed commit converges on the
    /// same single row. The owning repository row is created on first push.
    pub async fn insert_blob(
        &self,
        repository: &str,
        digest: &Digest,
        size: u64,
        media_type: &str,
    ) -> Result<()> {
        self.get_or_create_repository(repository).await?;

        self.client
            .execute(
                "INSERT INTO blobs (digest, size, media_type) VALUES ($1, $2, $3)
                 ON CONFLICT(digest) DO NOTHING;",
                params!(digest.to_string(), size as i64, media_type),
            )
            .await?;

        self.client
            .notify(&Notification::BlobAdded {
                node: self.node_id,
                digest: digest.clone(),
                repository: repository.to_string(),
            })
            .await?;

        Ok(())
    }

    /// Remove the metadata row for an unreferenced blob. Only the blob GC
    /// calls this; the object itself is deleted by the caller afterwards.
    pub async fn delete_blob(&self, digest: &Digest) -> Result<(), anyhow::Error> {
        let references: Vec<u32> = self
            .client
            .query_as(
                "SELECT artifact_id FROM blob_artifacts WHERE blob_digest = $1;",
                params!(digest.to_string()),
            )
            .await?;

        if !references.is_empty() {
            return Err(BlobError::Associated.into());
        }

        self.client
            .execute(
                "DELETE FROM blobs WHERE digest = $1
                 AND NOT EXISTS (
                    SELECT 1 FROM blob_artifacts WHERE blob_digest = $1
                 );",
                params!(digest.to_string()),
            )
            .await?;

        Ok(())
    }

    /// Blobs with zero artifact associations whose age exceeds the grace
    /// window. The window covers the gap between a blob commit and the
    /// artifact edge that will reference it.
    pub async fn orphaned_blobs(&self, grace_secs: u64) -> Result<Vec<Blob>> {
        let rows: Vec<BlobRow> = self
            .client
            .query_as(
                "SELECT b.*
                 FROM blobs b
                 LEFT JOIN blob_artifacts ba ON b.digest = ba.blob_digest
                 WHERE ba.blob_digest IS NULL
                 AND b.pushed_at < datetime('now', '-' || $1 || ' seconds');",
                params!(grace_secs as i64),
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Blob {
                    digest: row.digest,
                    size: row.size,
                    media_type: row.media_type,
                    pushed_at: super::parse_datetime(&row.pushed_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::tests::StateFixture;

    use super::*;

    #[test(tokio::test)]
    async fn blob_round_trip() -> Result<()> {
        let registry = StateFixture::new().await?;

        let digest: Digest = "sha256:a9471d8321cedbb75e823ed68a507cd5b203cdb29c56732def856ebcdc5125ea"
            .parse()
            .unwrap();

        assert_eq!(None, registry.get_blob(&digest).await?);

        registry
            .insert_blob("library/nginx", &digest, 55, "application/octet-stream")
            .await?;

        let blob = registry.get_blob(&digest).await?.unwrap();
        assert_eq!(blob.digest, digest);
        assert_eq!(blob.size, 55);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn insert_is_idempotent() -> Result<()> {
        let registry = StateFixture::new().await?;

        let digest: Digest = "sha256:a9471d8321cedbb75e823ed68a507cd5b203cdb29c56732def856ebcdc5125ea"
            .parse()
            .unwrap();

        registry
            .insert_blob("library/nginx", &digest, 55, "application/octet-stream")
            .await?;
        registry
            .insert_blob("library/nginx", &digest, 55, "application/octet-stream")
            .await?;

        let count: Vec<u32> = registry
            .client
            .query_as("SELECT size FROM blobs WHERE digest = $1;", params!(digest.to_string()))
            .await?;
        assert_eq!(count.len(), 1);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn delete_refuses_associated_blob() -> Result<()> {
        let registry = StateFixture::new().await?;

        let digest: Digest = "sha256:a9471d8321cedbb75e823ed68a507cd5b203cdb29c56732def856ebcdc5125ea"
            .parse()
            .unwrap();

        registry
            .insert_blob("library/nginx", &digest, 55, "application/octet-stream")
            .await?;

        registry.client.txn(
            [
                (
                    "INSERT INTO repositories(name, namespace) VALUES ('library/nginx2', 'library') RETURNING id;",
                    vec![],
                ),
                (
                    "INSERT INTO artifacts(repository_id, digest, media_type, size) VALUES ($1, 'sha256:24c422e681f1c1bd08286c7aaf5d23a5f088dcdb0b219806b3a9e579244f00c5', 'foo', 0) RETURNING id;",
                    params!(hiqlite::StmtIndex(0).column("id")),
                ),
                (
                    "INSERT INTO blob_artifacts(blob_digest, artifact_id) VALUES ($1, $2);",
                    params!(digest.to_string(), hiqlite::StmtIndex(1).column("id")),
                ),
            ],
        )
        .await?;

        let err = registry.delete_blob(&digest).await.unwrap_err();
        assert!(err.downcast_ref::<BlobError>().is_some());

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn orphans_respect_grace_window() -> Result<()> {
        let registry = StateFixture::new().await?;

        // Fresh orphan stays inside the grace window
        let fresh: Digest = "sha256:a9471d8321cedbb75e823ed68a507cd5b203cdb29c56732def856ebcdc5125ea"
            .parse()
            .unwrap();
        registry
            .insert_blob("library/nginx", &fresh, 1, "application/octet-stream")
            .await?;

        // Aged orphan is eligible
        registry
            .client
            .execute(
                "INSERT INTO blobs(digest, size, media_type, pushed_at)
                 VALUES ('sha256:b9471d8321cedbb75e823ed68a507cd5b203cdb29c56732def856ebcdc5125ea', 2, 'foo', datetime('now', '-2 days'));",
                vec![],
            )
            .await?;

        let orphans = registry.orphaned_blobs(24 * 60 * 60).await?;
        assert_eq!(orphans.len(), 1);
        assert_eq!(
            orphans[0].digest.to_string(),
            "sha256:b9471d8321cedbb75e823ed68a507cd5b203cdb29c56732def856ebcdc5125ea"
        );

        registry.teardown().await?;

        Ok(())
    }
}
