use anyhow::{Context, Result};
use hiqlite_macros::params;
use rand::Rng;
use serde::Deserialize;

use super::RegistryState;

#[derive(Debug, Deserialize)]
struct SessionRow {
    upload_id: String,
    file_id: String,
    native_id: String,
    repository: String,
}

#[derive(Debug, PartialEq)]
pub struct UploadSession {
    pub upload_id: String,
    pub file_id: String,
    pub native_id: String,
    pub repository: String,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct UploadPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Staging identifiers are 64 chars of `[0-9a-z]`, distinct from the client
/// facing upload id.
pub fn generate_file_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..64)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

impl RegistryState {
    pub async fn create_upload_session(
        &self,
        upload_id: &str,
        file_id: &str,
        native_id: &str,
        repository: &str,
    ) -> Result<()> {
        let repository_id = self.get_or_create_repository(repository).await?;

        self.client
            .execute(
                "INSERT INTO upload_sessions(upload_id, file_id, native_id, repository_id)
                 VALUES ($1, $2, $3, $4);",
                params!(upload_id, file_id, native_id, repository_id),
            )
            .await?;

        Ok(())
    }

    pub async fn get_upload_session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        let res: Option<SessionRow> = self
            .client
            .query_as_optional(
                "SELECT s.upload_id, s.file_id, s.native_id, r.name AS repository
                 FROM upload_sessions s
                 JOIN repositories r ON s.repository_id = r.id
                 WHERE s.upload_id = $1;",
                params!(upload_id),
            )
            .await?;

        Ok(res.map(|row| UploadSession {
            upload_id: row.upload_id,
            file_id: row.file_id,
            native_id: row.native_id,
            repository: row.repository,
        }))
    }

    /// Parts are numbered from 1; the caller holds the per-upload lock so
    /// two appends can never claim the same slot.
    pub async fn next_part_number(&self, upload_id: &str) -> Result<u32> {
        let max: Option<u32> = self
            .client
            .query_as_optional(
                "SELECT COALESCE(MAX(part_number), 0) FROM upload_parts WHERE upload_id = $1;",
                params!(upload_id),
            )
            .await?;

        Ok(max.unwrap_or(0) + 1)
    }

    pub async fn record_upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        etag: &str,
        size: u64,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO upload_parts(upload_id, part_number, etag, size)
                 VALUES ($1, $2, $3, $4);",
                params!(upload_id, part_number, etag, size as i64),
            )
            .await?;

        Ok(())
    }

    /// Every recorded part in part order, as fed to `complete_multipart`.
    pub async fn upload_parts(&self, upload_id: &str) -> Result<Vec<UploadPart>> {
        Ok(self
            .client
            .query_as(
                "SELECT part_number, etag, size FROM upload_parts
                 WHERE upload_id = $1
                 ORDER BY part_number;",
                params!(upload_id),
            )
            .await?)
    }

    /// Total bytes appended so far; drives the inclusive OCI Range header.
    pub async fn upload_size(&self, upload_id: &str) -> Result<u64> {
        let size: Option<u64> = self
            .client
            .query_as_optional(
                "SELECT COALESCE(SUM(size), 0) FROM upload_parts WHERE upload_id = $1;",
                params!(upload_id),
            )
            .await?;

        Ok(size.unwrap_or(0))
    }

    pub async fn delete_upload_session(&self, upload_id: &str) -> Result<()> {
        self.client
            .txn(vec![
                (
                    "DELETE FROM upload_parts WHERE upload_id = $1;",
                    params!(upload_id),
                ),
                (
                    "DELETE FROM upload_sessions WHERE upload_id = $1;",
                    params!(upload_id),
                ),
            ])
            .await
            .context("Failed to delete upload session")?;

        Ok(())
    }

    /// Sessions idle past the TTL, candidates for the background sweep.
    pub async fn stale_upload_sessions(&self, ttl_secs: u64) -> Result<Vec<UploadSession>> {
        let rows: Vec<SessionRow> = self
            .client
            .query_as(
                "SELECT s.upload_id, s.file_id, s.native_id, r.name AS repository
                 FROM upload_sessions s
                 JOIN repositories r ON s.repository_id = r.id
                 WHERE s.started_at < datetime('now', '-' || $1 || ' seconds');",
                params!(ttl_secs as i64),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| UploadSession {
                upload_id: row.upload_id,
                file_id: row.file_id,
                native_id: row.native_id,
                repository: row.repository,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::tests::StateFixture;

    use super::*;

    #[test]
    fn file_ids_are_lowercase_alphanumeric() {
        let file_id = generate_file_id();
        assert_eq!(file_id.len(), 64);
        assert!(
            file_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_ne!(file_id, generate_file_id());
    }

    #[test(tokio::test)]
    async fn session_round_trip() -> Result<()> {
        let registry = StateFixture::new().await?;

        registry
            .create_upload_session("upload-1", "file-1", "native-1", "library/nginx")
            .await?;

        let session = registry.get_upload_session("upload-1").await?.unwrap();
        assert_eq!(session.repository, "library/nginx");
        assert_eq!(session.file_id, "file-1");

        registry.delete_upload_session("upload-1").await?;
        assert_eq!(None, registry.get_upload_session("upload-1").await?);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn parts_are_monotonic_and_summed() -> Result<()> {
        let registry = StateFixture::new().await?;

        registry
            .create_upload_session("upload-1", "file-1", "native-1", "library/nginx")
            .await?;

        assert_eq!(registry.next_part_number("upload-1").await?, 1);
        registry
            .record_upload_part("upload-1", 1, "etag-1", 400_000)
            .await?;

        assert_eq!(registry.next_part_number("upload-1").await?, 2);
        registry
            .record_upload_part("upload-1", 2, "etag-2", 400_000)
            .await?;

        assert_eq!(registry.upload_size("upload-1").await?, 800_000);

        let parts = registry.upload_parts("upload-1").await?;
        assert_eq!(
            parts,
            vec![
                UploadPart {
                    part_number: 1,
                    etag: "etag-1".into(),
                    size: 400_000
                },
                UploadPart {
                    part_number: 2,
                    etag: "etag-2".into(),
                    size: 400_000
                },
            ]
        );

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn stale_sessions_found_by_age() -> Result<()> {
        let registry = StateFixture::new().await?;

        registry
            .create_upload_session("upload-1", "file-1", "native-1", "library/nginx")
            .await?;
        registry
            .client
            .execute(
                "UPDATE upload_sessions SET started_at = datetime('now', '-2 days')
                 WHERE upload_id = 'upload-1';",
                vec![],
            )
            .await?;

        registry
            .create_upload_session("upload-2", "file-2", "native-2", "library/nginx")
            .await?;

        let stale = registry.stale_upload_sessions(24 * 60 * 60).await?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].upload_id, "upload-1");

        registry.teardown().await?;

        Ok(())
    }
}
