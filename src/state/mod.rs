use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{Result, bail};
use hiqlite::Client;
use hiqlite_macros::params;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::{
    builder::logs::LogHub, config::Configuration, proxy::ProxyClient, storage::ObjectStore,
    webhook::WebhookService,
};

pub(crate) mod artifacts;
pub(crate) mod blobs;
pub(crate) mod builders;
pub(crate) mod gc;
pub(crate) mod uploads;

#[derive(Debug, Deserialize)]
struct RepositoryRow {
    id: u32,
    name: String,
    namespace: String,
    visibility: String,
}

#[derive(Debug, PartialEq)]
pub struct Repository {
    pub id: u32,
    pub name: String,
    pub namespace: String,
    pub visibility: String,
}

/// Shared application state: metadata store client, object store handle and
/// the background service handles every request needs.
pub struct RegistryState {
    pub node_id: u64,
    pub config: Configuration,
    pub client: Client,
    pub store: Arc<dyn ObjectStore>,
    pub webhooks: WebhookService,
    pub proxy: Option<ProxyClient>,
    /// Live build log channels, shared between the dispatcher's watchers
    /// and log stream subscribers.
    pub logs: Arc<LogHub>,
    /// Woken whenever a task lands in the work queue so consumers on this
    /// node pick it up without waiting for the next poll.
    pub task_wake: Arc<Notify>,
    upload_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RegistryState {
    pub fn new(
        node_id: u64,
        config: Configuration,
        client: Client,
        store: Arc<dyn ObjectStore>,
        webhooks: WebhookService,
    ) -> Self {
        let proxy = config.proxy.clone().map(ProxyClient::new);

        Self {
            node_id,
            config,
            client,
            store,
            webhooks,
            proxy,
            logs: Arc::new(LogHub::new()),
            task_wake: Arc::new(Notify::new()),
            upload_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Object store key for a staged upload.
    pub fn upload_key(&self, file_id: &str) -> String {
        format!("blob_uploads/{file_id}")
    }

    pub fn cache_key(&self, builder_id: u32) -> String {
        format!("caches/{builder_id}")
    }

    pub fn log_key(&self, runner_id: u32) -> String {
        format!("logs/{runner_id}")
    }

    /// Serialises operations on one upload session. Chunk appends must not
    /// race for part numbers, and the object store calls span the metadata
    /// transaction.
    pub fn lock_upload(&self, upload_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.upload_locks.lock().expect("poisoned upload lock map");
        locks
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn release_upload_lock(&self, upload_id: &str) {
        let mut locks = self.upload_locks.lock().expect("poisoned upload lock map");
        locks.remove(upload_id);
    }

    pub async fn get_repository(&self, repository: &str) -> Result<Option<Repository>> {
        let res: Option<RepositoryRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM repositories WHERE name = $1",
                params!(repository),
            )
            .await?;

        Ok(res.map(|row| Repository {
            id: row.id,
            name: row.name,
            namespace: row.namespace,
            visibility: row.visibility,
        }))
    }

    pub async fn repository_exists(&self, repository: &str) -> Result<bool> {
        Ok(self.get_repository(repository).await?.is_some())
    }

    pub async fn get_or_create_repository(&self, repository: &str) -> Result<u32> {
        let Some((namespace, _)) = repository.split_once('/') else {
            bail!("Repository name is missing its namespace: {repository}");
        };

        self.client
            .execute(
                "INSERT OR IGNORE INTO repositories(name, namespace) VALUES($1, $2);",
                params!(repository, namespace),
            )
            .await?;

        match self.get_repository(repository).await? {
            Some(row) => Ok(row.id),
            None => bail!("Could not find repository"),
        }
    }

    /// Paginated repository listing for the `_catalog` endpoint. Names are
    /// returned in lexical order starting strictly after `last`. Anonymous
    /// callers only see public repositories.
    pub async fn list_repositories(
        &self,
        n: usize,
        last: Option<&str>,
        public_only: bool,
    ) -> Result<Vec<String>> {
        Ok(self
            .client
            .query_as(
                "SELECT name FROM repositories
                 WHERE name > $1
                 AND ($3 = 0 OR visibility = 'public')
                 ORDER BY name
                 LIMIT $2;",
                params!(last.unwrap_or(""), n as u32, public_only as u32),
            )
            .await?)
    }

    pub async fn delete_repository(&self, repository_id: u32) -> Result<()> {
        self.client
            .execute(
                "DELETE FROM repositories WHERE id = $1;",
                params!(repository_id),
            )
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        use anyhow::Context;
        self.client
            .shutdown()
            .await
            .context("Failed to shutdown metadata db")
    }
}

/// Parse a sqlite CURRENT_TIMESTAMP column into a UTC timestamp.
pub(crate) fn parse_datetime(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::tests::StateFixture;

    use super::*;

    #[test(tokio::test)]
    async fn repository_round_trip() -> Result<()> {
        let registry = StateFixture::new().await?;

        assert_eq!(None, registry.get_repository("library/nginx").await?);

        let repository_id = registry.get_or_create_repository("library/nginx").await?;

        let repository = registry.get_repository("library/nginx").await?.unwrap();
        assert_eq!(repository.id, repository_id);
        assert_eq!(repository.namespace, "library");

        // And we shouldn't create duplicates
        assert_eq!(
            repository_id,
            registry.get_or_create_repository("library/nginx").await?
        );

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn repository_requires_namespace() -> Result<()> {
        let registry = StateFixture::new().await?;

        assert!(registry.get_or_create_repository("nginx").await.is_err());

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn catalog_pagination() -> Result<()> {
        let registry = StateFixture::new().await?;

        for name in ["a/one", "a/two", "b/one", "b/two"] {
            registry.get_or_create_repository(name).await?;
        }

        let page = registry.list_repositories(2, None, false).await?;
        assert_eq!(page, vec!["a/one".to_string(), "a/two".to_string()]);

        let page = registry.list_repositories(2, Some("a/two"), false).await?;
        assert_eq!(page, vec!["b/one".to_string(), "b/two".to_string()]);

        // Anonymous callers see nothing until something is public
        assert!(registry.list_repositories(10, None, true).await?.is_empty());

        registry.teardown().await?;

        Ok(())
    }

    #[test]
    fn sqlite_datetime() {
        let parsed = parse_datetime("2026-01-02 03:04:05").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(parse_datetime("not-a-date").is_err());
    }
}
