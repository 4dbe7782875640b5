//! Garbage collection.
//!
//! Four variants share one lifecycle: a rule is claimed, a runner walks its
//! scope deleting what the policy allows, and every deleted item leaves an
//! audit record. A single failed deletion marks that record failed and the
//! run continues; the runner ends Failed iff any record failed.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::queue::{TaskHandler, TaskPayload};
use crate::state::RegistryState;
use crate::state::gc::{GcRule, GcVariant, retention_victims};
use crate::storage::StorageError;

pub(crate) struct GcHandler {
    state: Arc<RegistryState>,
}

impl GcHandler {
    pub fn new(state: Arc<RegistryState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

#[async_trait]
impl TaskHandler for Arc<GcHandler> {
    async fn handle(&self, payload: TaskPayload) -> Result<()> {
        match payload {
            TaskPayload::GcRun { rule_id } => run_rule(&self.state, rule_id).await,
            other => {
                warn!("GC handler got unexpected payload {other:?}");
                Ok(())
            }
        }
    }
}

/// Execute the pending runner of a rule. The runner row and the rule's
/// running flag were claimed by whoever produced the task.
pub async fn run_rule(state: &Arc<RegistryState>, rule_id: u32) -> Result<()> {
    let Some(rule) = state.get_gc_rule_by_id(rule_id).await? else {
        warn!("GC task for unknown rule {rule_id}; dropping");
        return Ok(());
    };

    let Some(runner_id) = state.pending_gc_runner(rule_id).await? else {
        warn!("GC rule {rule_id} has no pending runner; dropping");
        return Ok(());
    };

    state.gc_runner_doing(runner_id).await?;

    info!(
        rule = rule.id,
        runner = runner_id,
        variant = %rule.variant,
        namespace = %rule.namespace,
        "Garbage collection started"
    );

    let failed = match rule.variant {
        GcVariant::Tag => collect_tags(state, &rule, runner_id).await?,
        GcVariant::Artifact => collect_artifacts(state, &rule, runner_id).await?,
        GcVariant::Blob => collect_blobs(state, runner_id).await?,
        GcVariant::Repository => collect_repositories(state, &rule, runner_id).await?,
    };

    state.gc_runner_finished(runner_id, failed).await?;

    info!(
        rule = rule.id,
        runner = runner_id,
        failed,
        "Garbage collection finished"
    );

    Ok(())
}

/// Delete tags falling outside the retention policy, one record per tag.
async fn collect_tags(
    state: &Arc<RegistryState>,
    rule: &GcRule,
    runner_id: u32,
) -> Result<bool> {
    let mut any_failed = false;

    for repository in state.repositories_in_namespace(&rule.namespace).await? {
        let tags = state.tags_by_age(&repository).await?;

        let victims = retention_victims(
            &tags,
            &rule.retention_pattern,
            rule.retention_rule_type,
            rule.retention_rule_amount,
            Utc::now(),
        );

        for tag in victims {
            let resource = format!("{repository}:{tag}");

            match state.delete_tag(&repository, &tag).await {
                Ok(()) => state.gc_record(runner_id, &resource, false, None).await?,
                Err(err) => {
                    warn!("Failed to delete tag {resource}: {err:?}");
                    state
                        .gc_record(runner_id, &resource, true, Some(&err.to_string()))
                        .await?;
                    any_failed = true;
                }
            }
        }
    }

    Ok(any_failed)
}

/// Delete untagged artifacts past the grace window. Their blobs stay until
/// the blob variant finds them unreferenced.
async fn collect_artifacts(
    state: &Arc<RegistryState>,
    rule: &GcRule,
    runner_id: u32,
) -> Result<bool> {
    let grace = state.config.gc.grace_window.as_secs();
    let mut any_failed = false;

    for artifact in state.orphaned_artifacts(&rule.namespace, grace).await? {
        let resource = format!("{}@{}", artifact.repository, artifact.digest);

        match state
            .delete_artifact(&artifact.repository, &artifact.digest)
            .await
        {
            Ok(()) => state.gc_record(runner_id, &resource, false, None).await?,
            Err(err) => {
                warn!("Failed to delete artifact {resource}: {err:?}");
                state
                    .gc_record(runner_id, &resource, true, Some(&err.to_string()))
                    .await?;
                any_failed = true;
            }
        }
    }

    Ok(any_failed)
}

/// Global sweep of blobs with no artifact association, older than the grace
/// window. The object goes first, then the metadata row.
async fn collect_blobs(state: &Arc<RegistryState>, runner_id: u32) -> Result<bool> {
    let grace = state.config.gc.grace_window.as_secs();
    let mut any_failed = false;

    for blob in state.orphaned_blobs(grace).await? {
        let resource = blob.digest.to_string();

        let removal = match state.store.delete(&blob.digest.blob_path()).await {
            Ok(()) | Err(StorageError::NotFound) => state.delete_blob(&blob.digest).await,
            Err(err) => Err(err.into()),
        };

        match removal {
            Ok(()) => state.gc_record(runner_id, &resource, false, None).await?,
            Err(err) => {
                warn!("Failed to delete blob {resource}: {err:?}");
                state
                    .gc_record(runner_id, &resource, true, Some(&err.to_string()))
                    .await?;
                any_failed = true;
            }
        }
    }

    Ok(any_failed)
}

/// Remove repositories with no artifacts left. Repositories still carrying
/// a builder are left alone.
async fn collect_repositories(
    state: &Arc<RegistryState>,
    rule: &GcRule,
    runner_id: u32,
) -> Result<bool> {
    let mut any_failed = false;

    for repository in state.empty_repositories(&rule.namespace).await? {
        let Some(row) = state.get_repository(&repository).await? else {
            continue;
        };

        if state.builder_for_repository(row.id).await?.is_some() {
            continue;
        }

        match state.delete_repository(row.id).await {
            Ok(()) => state.gc_record(runner_id, &repository, false, None).await?,
            Err(err) => {
                warn!("Failed to delete repository {repository}: {err:?}");
                state
                    .gc_record(runner_id, &repository, true, Some(&err.to_string()))
                    .await?;
                any_failed = true;
            }
        }
    }

    Ok(any_failed)
}
