use anyhow::{Context, Result};
use hiqlite_macros::params;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::RegistryState;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BuilderSource {
    Dockerfile,
    SelfCodeRepository,
    CodeRepository,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScmCredentialType {
    None,
    Ssh,
    Token,
    Username,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Building,
    Failed,
    Success,
    Stopped,
}

impl RunnerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Success | Self::Stopped)
    }
}

/// Everything settable through builder create/update. Exactly one builder
/// exists per repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderSpec {
    pub source: BuilderSource,
    #[serde(default = "default_credential_type")]
    pub scm_credential_type: ScmCredentialType,
    #[serde(default)]
    pub scm_ssh_key: Option<String>,
    #[serde(default)]
    pub scm_token: Option<String>,
    #[serde(default)]
    pub scm_username: Option<String>,
    #[serde(default)]
    pub scm_password: Option<String>,
    #[serde(default)]
    pub scm_repository: Option<String>,
    #[serde(default)]
    pub scm_branch: Option<String>,
    #[serde(default)]
    pub scm_depth: Option<u32>,
    #[serde(default)]
    pub scm_submodule: bool,
    #[serde(default)]
    pub cron_enabled: bool,
    #[serde(default)]
    pub cron_rule: Option<String>,
    #[serde(default)]
    pub cron_tag_template: Option<String>,
    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub webhook_tag_template: Option<String>,
    #[serde(default)]
    pub buildkit_insecure_registries: String,
    #[serde(default = "default_context")]
    pub buildkit_context: String,
    #[serde(default = "default_dockerfile")]
    pub buildkit_dockerfile: String,
    #[serde(default = "default_platforms")]
    pub buildkit_platforms: String,
    #[serde(default)]
    pub buildkit_build_args: String,
    /// Gzip compressed Dockerfile payload, present for the Dockerfile source.
    #[serde(default)]
    pub dockerfile: Option<Vec<u8>>,
}

fn default_credential_type() -> ScmCredentialType {
    ScmCredentialType::None
}

fn default_context() -> String {
    ".".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_platforms() -> String {
    "linux/amd64".to_string()
}

impl BuilderSpec {
    /// Credential fields must match the declared credential type.
    pub fn validate(&self) -> Result<(), String> {
        match self.scm_credential_type {
            ScmCredentialType::None => Ok(()),
            ScmCredentialType::Ssh if self.scm_ssh_key.is_some() => Ok(()),
            ScmCredentialType::Ssh => Err("ssh credentials require scm_ssh_key".into()),
            ScmCredentialType::Token if self.scm_token.is_some() => Ok(()),
            ScmCredentialType::Token => Err("token credentials require scm_token".into()),
            ScmCredentialType::Username
                if self.scm_username.is_some() && self.scm_password.is_some() =>
            {
                Ok(())
            }
            ScmCredentialType::Username => {
                Err("username credentials require scm_username and scm_password".into())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BuilderRow {
    id: u32,
    repository_id: u32,
    repository: String,
    source: String,
    scm_credential_type: String,
    scm_ssh_key: Option<String>,
    scm_token: Option<String>,
    scm_username: Option<String>,
    scm_password: Option<String>,
    scm_repository: Option<String>,
    scm_branch: Option<String>,
    scm_depth: Option<u32>,
    scm_submodule: u32,
    cron_enabled: u32,
    cron_rule: Option<String>,
    cron_tag_template: Option<String>,
    webhook_enabled: u32,
    webhook_tag_template: Option<String>,
    buildkit_insecure_registries: String,
    buildkit_context: String,
    buildkit_dockerfile: String,
    buildkit_platforms: String,
    buildkit_build_args: String,
    dockerfile: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub id: u32,
    pub repository_id: u32,
    pub repository: String,
    pub source: BuilderSource,
    pub spec: BuilderSpec,
}

/// Unset optional columns are stored as empty values; normalise them back
/// to None on the way out.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<BuilderRow> for Builder {
    type Error = anyhow::Error;

    fn try_from(row: BuilderRow) -> Result<Self> {
        let source: BuilderSource = row.source.parse().context("Invalid builder source")?;
        Ok(Builder {
            id: row.id,
            repository_id: row.repository_id,
            repository: row.repository,
            source,
            spec: BuilderSpec {
                source,
                scm_credential_type: row
                    .scm_credential_type
                    .parse()
                    .context("Invalid credential type")?,
                scm_ssh_key: non_empty(row.scm_ssh_key),
                scm_token: non_empty(row.scm_token),
                scm_username: non_empty(row.scm_username),
                scm_password: non_empty(row.scm_password),
                scm_repository: non_empty(row.scm_repository),
                scm_branch: non_empty(row.scm_branch),
                scm_depth: row.scm_depth.filter(|d| *d > 0),
                scm_submodule: row.scm_submodule != 0,
                cron_enabled: row.cron_enabled != 0,
                cron_rule: non_empty(row.cron_rule),
                cron_tag_template: non_empty(row.cron_tag_template),
                webhook_enabled: row.webhook_enabled != 0,
                webhook_tag_template: non_empty(row.webhook_tag_template),
                buildkit_insecure_registries: row.buildkit_insecure_registries,
                buildkit_context: row.buildkit_context,
                buildkit_dockerfile: row.buildkit_dockerfile,
                buildkit_platforms: row.buildkit_platforms,
                buildkit_build_args: row.buildkit_build_args,
                dockerfile: row.dockerfile.filter(|d| !d.is_empty()),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct RunnerRow {
    id: u32,
    builder_id: u32,
    status: String,
    tag: String,
    scm_branch: Option<String>,
    log_ref: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Runner {
    pub id: u32,
    pub builder_id: u32,
    pub status: RunnerStatus,
    pub tag: String,
    pub scm_branch: Option<String>,
    pub log_ref: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<u64>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = anyhow::Error;

    fn try_from(row: RunnerRow) -> Result<Self> {
        Ok(Runner {
            id: row.id,
            builder_id: row.builder_id,
            status: row.status.parse().context("Invalid runner status")?,
            tag: row.tag,
            scm_branch: non_empty(row.scm_branch),
            log_ref: non_empty(row.log_ref),
            started_at: row
                .started_at
                .as_deref()
                .map(super::parse_datetime)
                .transpose()?,
            ended_at: row
                .ended_at
                .as_deref()
                .map(super::parse_datetime)
                .transpose()?,
            duration_ms: row.duration_ms,
        })
    }
}

const BUILDER_COLUMNS: &str = "b.id, b.repository_id, r.name AS repository, b.source,
    b.scm_credential_type, b.scm_ssh_key, b.scm_token, b.scm_username, b.scm_password,
    b.scm_repository, b.scm_branch, b.scm_depth, b.scm_submodule,
    b.cron_enabled, b.cron_rule, b.cron_tag_template,
    b.webhook_enabled, b.webhook_tag_template,
    b.buildkit_insecure_registries, b.buildkit_context, b.buildkit_dockerfile,
    b.buildkit_platforms, b.buildkit_build_args, b.dockerfile";

impl RegistryState {
    /// Fails when the repository already carries a builder; there is exactly
    /// one per repository.
    pub async fn create_builder(
        &self,
        repository: &str,
        spec: &BuilderSpec,
        next_trigger: Option<String>,
    ) -> Result<Option<u32>> {
        let repository_id = self.get_or_create_repository(repository).await?;

        let inserted = self
            .client
            .execute(
                "INSERT INTO builders(
                    repository_id, source, scm_credential_type,
                    scm_ssh_key, scm_token, scm_username, scm_password,
                    scm_repository, scm_branch, scm_depth, scm_submodule,
                    cron_enabled, cron_rule, cron_next_trigger, cron_tag_template,
                    webhook_enabled, webhook_tag_template,
                    buildkit_insecure_registries, buildkit_context, buildkit_dockerfile,
                    buildkit_platforms, buildkit_build_args, dockerfile)
                 SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                        $15, $16, $17, $18, $19, $20, $21, $22, $23
                 WHERE NOT EXISTS (SELECT 1 FROM builders WHERE repository_id = $1);",
                params!(
                    repository_id,
                    spec.source.to_string(),
                    spec.scm_credential_type.to_string(),
                    spec.scm_ssh_key.clone().unwrap_or_default(),
                    spec.scm_token.clone().unwrap_or_default(),
                    spec.scm_username.clone().unwrap_or_default(),
                    spec.scm_password.clone().unwrap_or_default(),
                    spec.scm_repository.clone().unwrap_or_default(),
                    spec.scm_branch.clone().unwrap_or_default(),
                    spec.scm_depth.unwrap_or(0),
                    spec.scm_submodule as u32,
                    spec.cron_enabled as u32,
                    spec.cron_rule.clone().unwrap_or_default(),
                    next_trigger.unwrap_or_default(),
                    spec.cron_tag_template.clone().unwrap_or_default(),
                    spec.webhook_enabled as u32,
                    spec.webhook_tag_template.clone().unwrap_or_default(),
                    &spec.buildkit_insecure_registries,
                    &spec.buildkit_context,
                    &spec.buildkit_dockerfile,
                    &spec.buildkit_platforms,
                    &spec.buildkit_build_args,
                    spec.dockerfile.clone().unwrap_or_default()
                ),
            )
            .await?;

        if inserted == 0 {
            return Ok(None);
        }

        let builder = self.builder_for_repository(repository_id).await?;
        Ok(builder.map(|b| b.id))
    }

    pub async fn get_builder(&self, builder_id: u32) -> Result<Option<Builder>> {
        let row: Option<BuilderRow> = self
            .client
            .query_as_optional(
                format!(
                    "SELECT {BUILDER_COLUMNS} FROM builders b
                     JOIN repositories r ON b.repository_id = r.id
                     WHERE b.id = $1;"
                ),
                params!(builder_id),
            )
            .await?;

        row.map(Builder::try_from).transpose()
    }

    pub async fn builder_for_repository(&self, repository_id: u32) -> Result<Option<Builder>> {
        let row: Option<BuilderRow> = self
            .client
            .query_as_optional(
                format!(
                    "SELECT {BUILDER_COLUMNS} FROM builders b
                     JOIN repositories r ON b.repository_id = r.id
                     WHERE b.repository_id = $1;"
                ),
                params!(repository_id),
            )
            .await?;

        row.map(Builder::try_from).transpose()
    }

    pub async fn update_builder(
        &self,
        builder_id: u32,
        spec: &BuilderSpec,
        next_trigger: Option<String>,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE builders SET
                    source = $2, scm_credential_type = $3,
                    scm_ssh_key = $4, scm_token = $5, scm_username = $6, scm_password = $7,
                    scm_repository = $8, scm_branch = $9, scm_depth = $10, scm_submodule = $11,
                    cron_enabled = $12, cron_rule = $13, cron_next_trigger = $14,
                    cron_tag_template = $15, webhook_enabled = $16, webhook_tag_template = $17,
                    buildkit_insecure_registries = $18, buildkit_context = $19,
                    buildkit_dockerfile = $20, buildkit_platforms = $21,
                    buildkit_build_args = $22, dockerfile = $23,
                    updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1;",
                params!(
                    builder_id,
                    spec.source.to_string(),
                    spec.scm_credential_type.to_string(),
                    spec.scm_ssh_key.clone().unwrap_or_default(),
                    spec.scm_token.clone().unwrap_or_default(),
                    spec.scm_username.clone().unwrap_or_default(),
                    spec.scm_password.clone().unwrap_or_default(),
                    spec.scm_repository.clone().unwrap_or_default(),
                    spec.scm_branch.clone().unwrap_or_default(),
                    spec.scm_depth.unwrap_or(0),
                    spec.scm_submodule as u32,
                    spec.cron_enabled as u32,
                    spec.cron_rule.clone().unwrap_or_default(),
                    next_trigger.unwrap_or_default(),
                    spec.cron_tag_template.clone().unwrap_or_default(),
                    spec.webhook_enabled as u32,
                    spec.webhook_tag_template.clone().unwrap_or_default(),
                    &spec.buildkit_insecure_registries,
                    &spec.buildkit_context,
                    &spec.buildkit_dockerfile,
                    &spec.buildkit_platforms,
                    &spec.buildkit_build_args,
                    spec.dockerfile.clone().unwrap_or_default()
                ),
            )
            .await?;

        Ok(())
    }

    pub async fn delete_builder(&self, builder_id: u32) -> Result<()> {
        self.client
            .txn(vec![
                (
                    "DELETE FROM builder_runners WHERE builder_id = $1;",
                    params!(builder_id),
                ),
                ("DELETE FROM builders WHERE id = $1;", params!(builder_id)),
            ])
            .await
            .context("Failed to delete builder")?;

        Ok(())
    }

    pub async fn set_builder_next_trigger(
        &self,
        builder_id: u32,
        next_trigger: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE builders SET cron_next_trigger = $2 WHERE id = $1;",
                params!(builder_id, next_trigger),
            )
            .await?;
        Ok(())
    }

    /// Builders whose cron trigger has elapsed, oldest first, capped to the
    /// scheduler's per-tick budget.
    pub async fn due_builders(&self, limit: usize) -> Result<Vec<Builder>> {
        let rows: Vec<BuilderRow> = self
            .client
            .query_as(
                format!(
                    "SELECT {BUILDER_COLUMNS} FROM builders b
                     JOIN repositories r ON b.repository_id = r.id
                     WHERE b.cron_enabled = 1
                     AND b.cron_next_trigger != ''
                     AND b.cron_next_trigger <= datetime('now')
                     ORDER BY b.cron_next_trigger
                     LIMIT $1;"
                ),
                params!(limit as u32),
            )
            .await?;

        rows.into_iter().map(Builder::try_from).collect()
    }

    /// Insert a pending runner unless the builder already has one in flight.
    /// Returns the new runner, or None when the at-most-one invariant would
    /// be violated.
    pub async fn create_runner(
        &self,
        builder_id: u32,
        tag: &str,
        scm_branch: Option<&str>,
    ) -> Result<Option<Runner>> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO builder_runners(builder_id, status, tag, scm_branch)
                 SELECT $1, 'pending', $2, $3
                 WHERE NOT EXISTS (
                    SELECT 1 FROM builder_runners
                    WHERE builder_id = $1 AND status IN ('pending', 'building')
                 );",
                params!(builder_id, tag, scm_branch.unwrap_or_default()),
            )
            .await?;

        if inserted == 0 {
            return Ok(None);
        }

        self.pending_runner(builder_id).await
    }

    pub async fn get_runner(&self, runner_id: u32) -> Result<Option<Runner>> {
        let row: Option<RunnerRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM builder_runners WHERE id = $1;",
                params!(runner_id),
            )
            .await?;

        row.map(Runner::try_from).transpose()
    }

    /// The single pending runner of a builder, if any. At most one exists.
    pub async fn pending_runner(&self, builder_id: u32) -> Result<Option<Runner>> {
        let row: Option<RunnerRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM builder_runners
                 WHERE builder_id = $1 AND status = 'pending';",
                params!(builder_id),
            )
            .await?;

        row.map(Runner::try_from).transpose()
    }

    pub async fn list_runners(&self, builder_id: u32) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = self
            .client
            .query_as(
                "SELECT * FROM builder_runners WHERE builder_id = $1 ORDER BY id DESC;",
                params!(builder_id),
            )
            .await?;

        rows.into_iter().map(Runner::try_from).collect()
    }

    /// Pending -> Building. started_at is stamped in the same statement so
    /// it is always set before the status leaves Pending.
    pub async fn runner_building(&self, runner_id: u32) -> Result<bool> {
        let updated = self
            .client
            .execute(
                "UPDATE builder_runners
                 SET status = 'building', started_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND status = 'pending';",
                params!(runner_id),
            )
            .await?;

        Ok(updated == 1)
    }

    /// Terminal transition. ended_at and duration_ms land atomically, and a
    /// runner already stopped stays stopped.
    pub async fn runner_finished(
        &self,
        runner_id: u32,
        status: RunnerStatus,
        log_ref: Option<&str>,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE builder_runners
                 SET status = $2,
                     ended_at = CURRENT_TIMESTAMP,
                     duration_ms = CAST(
                        (julianday(CURRENT_TIMESTAMP) - julianday(started_at)) * 86400000 AS INTEGER
                     ),
                     log_ref = $3
                 WHERE id = $1 AND status IN ('pending', 'building');",
                params!(runner_id, status.to_string(), log_ref.unwrap_or_default()),
            )
            .await?;

        Ok(())
    }

    pub async fn runner_stopped(&self, runner_id: u32) -> Result<()> {
        self.runner_finished(runner_id, RunnerStatus::Stopped, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::tests::StateFixture;

    use super::*;

    fn spec() -> BuilderSpec {
        BuilderSpec {
            source: BuilderSource::Dockerfile,
            scm_credential_type: ScmCredentialType::None,
            scm_ssh_key: None,
            scm_token: None,
            scm_username: None,
            scm_password: None,
            scm_repository: None,
            scm_branch: Some("main".into()),
            scm_depth: Some(1),
            scm_submodule: false,
            cron_enabled: false,
            cron_rule: None,
            cron_tag_template: None,
            webhook_enabled: false,
            webhook_tag_template: None,
            buildkit_insecure_registries: String::new(),
            buildkit_context: ".".into(),
            buildkit_dockerfile: "Dockerfile".into(),
            buildkit_platforms: "linux/amd64".into(),
            buildkit_build_args: String::new(),
            dockerfile: Some(b"FROM alpine".to_vec()),
        }
    }

    #[test]
    fn credential_fields_must_match_type() {
        let mut s = spec();
        assert!(s.validate().is_ok());

        s.scm_credential_type = ScmCredentialType::Ssh;
        assert!(s.validate().is_err());

        s.scm_ssh_key = Some("key".into());
        assert!(s.validate().is_ok());

        s.scm_credential_type = ScmCredentialType::Username;
        assert!(s.validate().is_err());
        s.scm_username = Some("bob".into());
        s.scm_password = Some("secret".into());
        assert!(s.validate().is_ok());
    }

    #[test(tokio::test)]
    async fn one_builder_per_repository() -> Result<()> {
        let registry = StateFixture::new().await?;

        let id = registry
            .create_builder("library/nginx", &spec(), None)
            .await?;
        assert!(id.is_some());

        let second = registry
            .create_builder("library/nginx", &spec(), None)
            .await?;
        assert_eq!(second, None);

        let builder = registry.get_builder(id.unwrap()).await?.unwrap();
        assert_eq!(builder.repository, "library/nginx");
        assert_eq!(builder.source, BuilderSource::Dockerfile);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn at_most_one_active_runner() -> Result<()> {
        let registry = StateFixture::new().await?;

        let builder_id = registry
            .create_builder("library/nginx", &spec(), None)
            .await?
            .unwrap();

        let runner = registry
            .create_runner(builder_id, "v1", Some("main"))
            .await?
            .unwrap();
        assert_eq!(runner.status, RunnerStatus::Pending);

        // Second runner refused while the first is pending
        assert!(
            registry
                .create_runner(builder_id, "v2", Some("main"))
                .await?
                .is_none()
        );

        // Still refused while building
        assert!(registry.runner_building(runner.id).await?);
        assert!(
            registry
                .create_runner(builder_id, "v2", Some("main"))
                .await?
                .is_none()
        );

        // Allowed after the runner completes
        registry
            .runner_finished(runner.id, RunnerStatus::Success, Some("logs/1"))
            .await?;
        assert!(
            registry
                .create_runner(builder_id, "v2", Some("main"))
                .await?
                .is_some()
        );

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn runner_lifecycle_stamps_times() -> Result<()> {
        let registry = StateFixture::new().await?;

        let builder_id = registry
            .create_builder("library/nginx", &spec(), None)
            .await?
            .unwrap();

        let runner = registry
            .create_runner(builder_id, "v1", None)
            .await?
            .unwrap();
        assert!(runner.started_at.is_none());

        registry.runner_building(runner.id).await?;
        let building = registry.get_runner(runner.id).await?.unwrap();
        assert_eq!(building.status, RunnerStatus::Building);
        assert!(building.started_at.is_some());

        // Double transition is a no-op
        assert!(!registry.runner_building(runner.id).await?);

        registry
            .runner_finished(runner.id, RunnerStatus::Success, Some("logs/1"))
            .await?;
        let done = registry.get_runner(runner.id).await?.unwrap();
        assert_eq!(done.status, RunnerStatus::Success);
        assert!(done.ended_at.is_some());
        assert!(done.duration_ms.is_some());
        assert_eq!(done.log_ref.as_deref(), Some("logs/1"));

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn due_builders_respect_trigger() -> Result<()> {
        let registry = StateFixture::new().await?;

        registry
            .create_builder(
                "library/due",
                &BuilderSpec {
                    cron_enabled: true,
                    cron_rule: Some("* * * * *".into()),
                    ..spec()
                },
                Some("2000-01-01 00:00:00".into()),
            )
            .await?;

        registry
            .create_builder(
                "library/future",
                &BuilderSpec {
                    cron_enabled: true,
                    cron_rule: Some("* * * * *".into()),
                    ..spec()
                },
                Some("2999-01-01 00:00:00".into()),
            )
            .await?;

        let due = registry.due_builders(100).await?;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].repository, "library/due");

        registry.teardown().await?;

        Ok(())
    }
}
