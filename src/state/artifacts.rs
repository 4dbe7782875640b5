use anyhow::{Context, Result};
use hiqlite::StmtIndex;
use hiqlite_macros::params;
use serde::Deserialize;

use super::RegistryState;
use crate::digest::Digest;
use crate::manifest::ParsedManifest;
use crate::notify::Notification;
use crate::queue::TaskStatement;

#[derive(Debug, Deserialize)]
struct ArtifactRow {
    id: u32,
    digest: Digest,
    media_type: String,
    size: u64,
    repository: String,
    pushed_at: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Artifact {
    pub id: u32,
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub repository: String,
    pub pushed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct TagEntry {
    pub name: String,
    pub pushed_at: String,
}

impl RegistryState {
    pub async fn get_artifact(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<Option<Artifact>> {
        let res: Option<ArtifactRow> = self
            .client
            .query_as_optional(
                "SELECT a.id, a.digest, a.media_type, a.size, a.pushed_at, r.name AS repository
                 FROM artifacts a
                 JOIN repositories r ON a.repository_id = r.id
                 WHERE a.digest = $1 AND r.name = $2;",
                params!(digest.to_string(), repository),
            )
            .await?;

        res.map(row_to_artifact).transpose()
    }

    pub async fn get_tag(&self, repository: &str, tag: &str) -> Result<Option<Artifact>> {
        let res: Option<ArtifactRow> = self
            .client
            .query_as_optional(
                "SELECT a.id, a.digest, a.media_type, a.size, a.pushed_at, r.name AS repository
                 FROM repositories r
                 JOIN tags t ON t.repository_id = r.id
                 JOIN artifacts a ON t.artifact_id = a.id
                 WHERE r.name = $1 AND t.name = $2;",
                params!(repository, tag),
            )
            .await?;

        res.map(row_to_artifact).transpose()
    }

    /// Accept a parsed manifest. One transaction covers the blob row for the
    /// manifest bytes, the artifact row, the reference edges, the optional
    /// tag repoint and any spliced outbox statements, so readers never
    /// observe a torn state.
    pub async fn insert_artifact(
        &self,
        repository: &str,
        digest: &Digest,
        parsed: &ParsedManifest,
        tag: Option<&str>,
        outbox: Vec<TaskStatement>,
    ) -> Result<()> {
        let repository_id = self.get_or_create_repository(repository).await?;

        let config_digest = parsed
            .config
            .as_ref()
            .map(|d| d.digest.to_string())
            .unwrap_or_default();

        let mut sql = vec![
            (
                "INSERT INTO blobs (digest, size, media_type) VALUES ($1, $2, $3)
                 ON CONFLICT(digest) DO NOTHING;",
                params!(digest.to_string(), parsed.size as i64, &parsed.media_type),
            ),
            (
                "INSERT INTO artifacts (repository_id, digest, media_type, size, config_digest)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT(repository_id, digest) DO UPDATE SET media_type = excluded.media_type
                 RETURNING artifacts.id;",
                params!(
                    repository_id,
                    digest.to_string(),
                    &parsed.media_type,
                    parsed.size as i64,
                    config_digest
                ),
            ),
            (
                "INSERT OR IGNORE INTO blob_artifacts(blob_digest, artifact_id) VALUES ($1, $2);",
                params!(digest.to_string(), StmtIndex(1).column("id")),
            ),
        ];

        sql.extend(parsed.blobs().enumerate().map(|(ord, descriptor)| {
            (
                "INSERT OR IGNORE INTO blob_artifacts(blob_digest, artifact_id, ord) VALUES ($1, $2, $3);",
                params!(
                    descriptor.digest.to_string(),
                    StmtIndex(1).column("id"),
                    (ord + 1) as u32
                ),
            )
        }));

        sql.extend(parsed.references.iter().map(|descriptor| {
            (
                "INSERT OR IGNORE INTO artifact_references(parent_id, child_digest, platform) VALUES ($1, $2, $3);",
                params!(
                    StmtIndex(1).column("id"),
                    descriptor.digest.to_string(),
                    descriptor
                        .platform
                        .as_ref()
                        .map(|p| p.to_string_pair())
                        .unwrap_or_default()
                ),
            )
        }));

        if let Some(tag) = tag {
            sql.push((
                "INSERT INTO tags (name, repository_id, artifact_id) VALUES ($1, $2, $3)
                 ON CONFLICT(name, repository_id) DO UPDATE
                 SET artifact_id = excluded.artifact_id, pushed_at = CURRENT_TIMESTAMP;",
                params!(tag, repository_id, StmtIndex(1).column("id")),
            ));
        }

        for statement in outbox {
            sql.push((statement.sql, statement.params));
        }

        self.client.txn(sql).await?;
        self.task_wake.notify_waiters();

        self.client
            .notify(&Notification::ArtifactAdded {
                node: self.node_id,
                digest: digest.clone(),
                repository: repository.to_string(),
            })
            .await?;

        Ok(())
    }

    /// Deleting by digest takes the tags with it; edges go in the same
    /// transaction since foreign keys are not relied on for cascades.
    pub async fn delete_artifact(&self, repository: &str, digest: &Digest) -> Result<()> {
        self.client
            .txn(vec![
                (
                    "DELETE FROM tags WHERE artifact_id IN (
                        SELECT a.id FROM artifacts a
                        JOIN repositories r ON a.repository_id = r.id
                        WHERE a.digest = $1 AND r.name = $2
                     );",
                    params!(digest.to_string(), repository),
                ),
                (
                    "DELETE FROM blob_artifacts WHERE artifact_id IN (
                        SELECT a.id FROM artifacts a
                        JOIN repositories r ON a.repository_id = r.id
                        WHERE a.digest = $1 AND r.name = $2
                     );",
                    params!(digest.to_string(), repository),
                ),
                (
                    "DELETE FROM artifact_references WHERE parent_id IN (
                        SELECT a.id FROM artifacts a
                        JOIN repositories r ON a.repository_id = r.id
                        WHERE a.digest = $1 AND r.name = $2
                     );",
                    params!(digest.to_string(), repository),
                ),
                (
                    "DELETE FROM artifacts WHERE id IN (
                        SELECT a.id FROM artifacts a
                        JOIN repositories r ON a.repository_id = r.id
                        WHERE a.digest = $1 AND r.name = $2
                     );",
                    params!(digest.to_string(), repository),
                ),
            ])
            .await
            .context("Failed to delete artifact")?;

        Ok(())
    }

    pub async fn get_tags(&self, repository: &str) -> Result<Vec<String>> {
        Ok(self
            .client
            .query_as(
                "SELECT tags.name
                 FROM tags
                 JOIN repositories ON tags.repository_id = repositories.id
                 WHERE repositories.name = $1
                 ORDER BY tags.name;",
                params!(repository),
            )
            .await?)
    }

    /// Tags newest-first, the ordering the retention policy is defined over.
    pub async fn tags_by_age(&self, repository: &str) -> Result<Vec<TagEntry>> {
        Ok(self
            .client
            .query_as(
                "SELECT t.name, t.pushed_at
                 FROM tags t
                 JOIN repositories r ON t.repository_id = r.id
                 WHERE r.name = $1
                 ORDER BY t.pushed_at DESC, t.name;",
                params!(repository),
            )
            .await?)
    }

    pub async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        self.client
            .execute(
                "DELETE FROM tags
                 WHERE name = $1
                 AND repository_id = (SELECT id FROM repositories WHERE name = $2);",
                params!(tag, repository),
            )
            .await?;
        Ok(())
    }

    pub async fn record_pull(&self, repository: &str, tag: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE tags
                 SET last_pulled_at = CURRENT_TIMESTAMP, pull_count = pull_count + 1
                 WHERE name = $1
                 AND repository_id = (SELECT id FROM repositories WHERE name = $2);",
                params!(tag, repository),
            )
            .await?;
        Ok(())
    }

    /// Artifacts with zero tags, no index parent, older than the grace
    /// window. Scoped to a namespace for the artifact GC variant.
    pub async fn orphaned_artifacts(
        &self,
        namespace: &str,
        grace_secs: u64,
    ) -> Result<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = self
            .client
            .query_as(
                "SELECT a.id, a.digest, a.media_type, a.size, a.pushed_at, r.name AS repository
                 FROM artifacts a
                 JOIN repositories r ON a.repository_id = r.id
                 LEFT JOIN tags t ON t.artifact_id = a.id
                 WHERE r.namespace = $1
                 AND t.artifact_id IS NULL
                 AND a.digest NOT IN (SELECT child_digest FROM artifact_references)
                 AND a.pushed_at < datetime('now', '-' || $2 || ' seconds');",
                params!(namespace, grace_secs as i64),
            )
            .await?;

        rows.into_iter().map(row_to_artifact).collect()
    }

    /// Repositories in a namespace with no artifacts at all, candidates for
    /// the repository GC variant.
    pub async fn empty_repositories(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .client
            .query_as(
                "SELECT r.name
                 FROM repositories r
                 LEFT JOIN artifacts a ON a.repository_id = r.id
                 WHERE r.namespace = $1 AND a.id IS NULL
                 ORDER BY r.name;",
                params!(namespace),
            )
            .await?)
    }
}

fn row_to_artifact(row: ArtifactRow) -> Result<Artifact> {
    Ok(Artifact {
        id: row.id,
        digest: row.digest,
        media_type: row.media_type,
        size: row.size,
        repository: row.repository,
        pushed_at: super::parse_datetime(&row.pushed_at)?,
    })
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::manifest::parse_manifest;
    use crate::tests::StateFixture;

    use super::*;

    const MANIFEST: &str = r#"
    {
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "size": 7023
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                "size": 32654
            }
        ]
    }
    "#;

    async fn push_fixture_manifest(
        registry: &StateFixture,
        repository: &str,
        tag: Option<&str>,
    ) -> Result<Digest> {
        for layer in [
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        ] {
            registry
                .insert_blob(repository, &layer.parse().unwrap(), 1, "application/octet-stream")
                .await?;
        }

        let parsed = parse_manifest(MANIFEST.as_bytes()).unwrap();
        let digest = Digest::of_bytes(MANIFEST.as_bytes());

        registry
            .insert_artifact(repository, &digest, &parsed, tag, vec![])
            .await?;

        Ok(digest)
    }

    #[test(tokio::test)]
    async fn manifest_round_trip() -> Result<()> {
        let registry = StateFixture::new().await?;

        let digest = push_fixture_manifest(&registry, "library/nginx", Some("latest")).await?;

        let artifact = registry
            .get_artifact("library/nginx", &digest)
            .await?
            .unwrap();
        assert_eq!(artifact.digest, digest);
        assert_eq!(
            artifact.media_type,
            "application/vnd.docker.distribution.manifest.v2+json"
        );

        let by_tag = registry.get_tag("library/nginx", "latest").await?.unwrap();
        assert_eq!(by_tag.digest, digest);

        assert_eq!(registry.get_tags("library/nginx").await?, vec!["latest"]);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn tag_repoint_is_an_upsert() -> Result<()> {
        let registry = StateFixture::new().await?;

        let first = push_fixture_manifest(&registry, "library/nginx", Some("latest")).await?;

        // A second manifest with different bytes repoints the same tag
        let other = MANIFEST.replace("32654", "32655");
        let parsed = parse_manifest(other.as_bytes()).unwrap();
        let second = Digest::of_bytes(other.as_bytes());
        registry
            .insert_artifact("library/nginx", &second, &parsed, Some("latest"), vec![])
            .await?;

        let by_tag = registry.get_tag("library/nginx", "latest").await?.unwrap();
        assert_eq!(by_tag.digest, second);
        assert_ne!(first, second);

        // Still only one tag
        assert_eq!(registry.get_tags("library/nginx").await?.len(), 1);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn delete_tag_keeps_artifact() -> Result<()> {
        let registry = StateFixture::new().await?;

        let digest = push_fixture_manifest(&registry, "library/nginx", Some("latest")).await?;

        registry.delete_tag("library/nginx", "latest").await?;

        assert!(registry.get_tag("library/nginx", "latest").await?.is_none());
        assert!(
            registry
                .get_artifact("library/nginx", &digest)
                .await?
                .is_some()
        );

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn delete_artifact_takes_tags() -> Result<()> {
        let registry = StateFixture::new().await?;

        let digest = push_fixture_manifest(&registry, "library/nginx", Some("latest")).await?;

        registry.delete_artifact("library/nginx", &digest).await?;

        assert!(
            registry
                .get_artifact("library/nginx", &digest)
                .await?
                .is_none()
        );
        assert!(registry.get_tag("library/nginx", "latest").await?.is_none());

        // The layer blobs are now orphaned but still present until blob GC
        assert!(
            registry
                .get_blob(
                    &"sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
                        .parse()
                        .unwrap()
                )
                .await?
                .is_some()
        );

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn pull_accounting() -> Result<()> {
        let registry = StateFixture::new().await?;

        push_fixture_manifest(&registry, "library/nginx", Some("latest")).await?;

        registry.record_pull("library/nginx", "latest").await?;
        registry.record_pull("library/nginx", "latest").await?;

        let counts: Vec<u32> = registry
            .client
            .query_as("SELECT pull_count FROM tags WHERE name = 'latest';", vec![])
            .await?;
        assert_eq!(counts, vec![2]);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn empty_repositories_listed() -> Result<()> {
        let registry = StateFixture::new().await?;

        registry.get_or_create_repository("library/empty").await?;
        push_fixture_manifest(&registry, "library/nginx", Some("latest")).await?;

        assert_eq!(
            registry.empty_repositories("library").await?,
            vec!["library/empty"]
        );

        registry.teardown().await?;

        Ok(())
    }
}
