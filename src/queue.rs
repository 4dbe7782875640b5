//! Work queue for daemon tasks.
//!
//! Tasks live in the metadata store so a produce can join the caller's
//! transaction (outbox: the task exists iff the owning row landed). Delivery
//! is at-least-once with per-(topic, partition) FIFO; failed handlers back
//! off exponentially until the attempt cap dead-letters the task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hiqlite_macros::params;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::digest::Digest;
use crate::shutdown::Broadcast;
use crate::state::RegistryState;

pub const TOPIC_GC: &str = "gc";
pub const TOPIC_BUILDER: &str = "builder";
pub const TOPIC_ARTIFACT_PUSHED: &str = "artifact_pushed";

/// Closed set of queue payloads. The wire format is the serde tag plus the
/// typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    GcRun {
        rule_id: u32,
    },
    BuilderStart {
        builder_id: u32,
        repository_id: u32,
    },
    BuilderStop {
        builder_id: u32,
        runner_id: u32,
    },
    ArtifactPushed {
        repository: String,
        digest: Digest,
        tag: String,
        media_type: String,
    },
}

impl TaskPayload {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::GcRun { .. } => TOPIC_GC,
            Self::BuilderStart { .. } | Self::BuilderStop { .. } => TOPIC_BUILDER,
            Self::ArtifactPushed { .. } => TOPIC_ARTIFACT_PUSHED,
        }
    }

    /// Tasks sharing a partition key are delivered in enqueue order.
    pub fn partition_key(&self) -> String {
        match self {
            Self::GcRun { rule_id } => format!("rule-{rule_id}"),
            Self::BuilderStart { builder_id, .. } | Self::BuilderStop { builder_id, .. } => {
                format!("builder-{builder_id}")
            }
            Self::ArtifactPushed { repository, .. } => repository.clone(),
        }
    }
}

/// A produce expressed as a SQL statement so callers can splice it into
/// their own transaction.
pub struct TaskStatement {
    pub sql: &'static str,
    pub params: hiqlite::Params,
}

const INSERT_TASK: &str =
    "INSERT INTO tasks(topic, partition_key, payload) VALUES ($1, $2, $3);";

#[derive(Debug, Deserialize)]
struct TaskRow {
    id: u64,
    payload: String,
    attempts: u32,
}

#[derive(Debug)]
pub struct ClaimedTask {
    pub id: u64,
    pub payload: TaskPayload,
    pub attempts: u32,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: TaskPayload) -> Result<()>;
}

impl RegistryState {
    /// The outbox form of produce. The returned statement participates in
    /// whatever transaction the caller commits.
    pub fn task_statement(&self, payload: &TaskPayload) -> Result<TaskStatement> {
        let body = serde_json::to_string(payload).context("Failed to encode task payload")?;

        Ok(TaskStatement {
            sql: INSERT_TASK,
            params: params!(payload.topic(), payload.partition_key(), body),
        })
    }

    /// Standalone produce for callers with no surrounding transaction.
    pub async fn produce_task(&self, payload: &TaskPayload) -> Result<()> {
        let statement = self.task_statement(payload)?;
        self.client.execute(statement.sql, statement.params).await?;
        self.task_wake.notify_waiters();
        Ok(())
    }

    /// Claim the next deliverable task in a topic. Partition FIFO: a task is
    /// only claimable when its partition has nothing in flight and nothing
    /// older still pending, so retries never reorder behind newer work.
    pub async fn claim_task(&self, topic: &str, claim_token: &str) -> Result<Option<ClaimedTask>> {
        let claimed = self
            .client
            .execute(
                "UPDATE tasks
                 SET status = 'inflight', claimed_by = $2,
                     attempts = attempts + 1, updated_at = CURRENT_TIMESTAMP
                 WHERE id = (
                    SELECT t.id FROM tasks t
                    WHERE t.topic = $1
                    AND t.status = 'pending'
                    AND t.not_before <= datetime('now')
                    AND NOT EXISTS (
                        SELECT 1 FROM tasks i
                        WHERE i.topic = t.topic
                        AND i.partition_key = t.partition_key
                        AND i.status = 'inflight'
                    )
                    AND NOT EXISTS (
                        SELECT 1 FROM tasks o
                        WHERE o.topic = t.topic
                        AND o.partition_key = t.partition_key
                        AND o.status = 'pending'
                        AND o.id < t.id
                    )
                    ORDER BY t.id
                    LIMIT 1
                 );",
                params!(topic, claim_token),
            )
            .await?;

        if claimed == 0 {
            return Ok(None);
        }

        let row: Option<TaskRow> = self
            .client
            .query_as_optional(
                "SELECT id, payload, attempts FROM tasks
                 WHERE claimed_by = $1 AND status = 'inflight';",
                params!(claim_token),
            )
            .await?;

        let Some(row) = row else { return Ok(None) };

        let payload: TaskPayload =
            serde_json::from_str(&row.payload).context("Undecodable task payload")?;

        Ok(Some(ClaimedTask {
            id: row.id,
            payload,
            attempts: row.attempts,
        }))
    }

    pub async fn complete_task(&self, task_id: u64) -> Result<()> {
        self.client
            .execute("DELETE FROM tasks WHERE id = $1;", params!(task_id as i64))
            .await?;
        Ok(())
    }

    /// Nack: back off exponentially, dead-letter once attempts hit the cap.
    pub async fn fail_task(&self, task: &ClaimedTask) -> Result<()> {
        let max_attempts = self.config.queue.max_attempts;

        if task.attempts >= max_attempts {
            warn!(task = task.id, "Task exhausted its attempts; dead-lettering");
            self.client
                .execute(
                    "UPDATE tasks SET status = 'dead', updated_at = CURRENT_TIMESTAMP
                     WHERE id = $1;",
                    params!(task.id as i64),
                )
                .await?;
            return Ok(());
        }

        let base = self.config.queue.retry_base.as_secs().max(1);
        let backoff = (base << (task.attempts - 1).min(10)).min(60 * 60);

        self.client
            .execute(
                "UPDATE tasks
                 SET status = 'pending', claimed_by = '',
                     not_before = datetime('now', '+' || $2 || ' seconds'),
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1;",
                params!(task.id as i64, backoff as i64),
            )
            .await?;

        Ok(())
    }

    /// Dead-lettered tasks older than the cutoff go back to pending with a
    /// clean attempt count; driven from a scheduler tick.
    pub async fn requeue_dead_tasks(&self, older_secs: u64) -> Result<usize> {
        let requeued = self
            .client
            .execute(
                "UPDATE tasks
                 SET status = 'pending', attempts = 0, claimed_by = '',
                     not_before = datetime('now'), updated_at = CURRENT_TIMESTAMP
                 WHERE status = 'dead'
                 AND updated_at < datetime('now', '-' || $1 || ' seconds');",
                params!(older_secs as i64),
            )
            .await?;

        if requeued > 0 {
            self.task_wake.notify_waiters();
        }

        Ok(requeued)
    }

    /// Recover tasks stranded in flight by a crashed consumer.
    pub async fn release_stuck_tasks(&self, older_secs: u64) -> Result<usize> {
        Ok(self
            .client
            .execute(
                "UPDATE tasks
                 SET status = 'pending', claimed_by = '', updated_at = CURRENT_TIMESTAMP
                 WHERE status = 'inflight'
                 AND updated_at < datetime('now', '-' || $1 || ' seconds');",
                params!(older_secs as i64),
            )
            .await?)
    }
}

/// Long-running consumer for one topic. Spawned once per topic by the
/// composition root; polls, and wakes early on same-node produces.
pub fn consume(
    tasks: &mut JoinSet<Result<()>>,
    state: Arc<RegistryState>,
    topic: &'static str,
    handler: Arc<dyn TaskHandler>,
    mut broadcasts: broadcast::Receiver<Broadcast>,
) {
    tasks.spawn(async move {
        let poll_interval = state.config.queue.poll_interval;
        info!("Queue consumer for {topic} started");

        loop {
            drain(&state, topic, handler.as_ref()).await;

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {},
                _ = state.task_wake.notified() => {},
                Ok(Broadcast::Shutdown) = broadcasts.recv() => {
                    info!("Queue consumer for {topic}: graceful shutdown");
                    break;
                }
            }
        }

        Ok(())
    });
}

async fn drain(state: &Arc<RegistryState>, topic: &str, handler: &dyn TaskHandler) {
    loop {
        let claim_token = uuid::Uuid::new_v4().as_hyphenated().to_string();

        let task = match state.claim_task(topic, &claim_token).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(err) => {
                error!("Queue claim failed for {topic}: {err:?}");
                break;
            }
        };

        debug!(task = task.id, attempts = task.attempts, "Handling task");

        match handler.handle(task.payload.clone()).await {
            Ok(()) => {
                if let Err(err) = state.complete_task(task.id).await {
                    error!("Failed to ack task {}: {err:?}", task.id);
                }
            }
            Err(err) => {
                warn!("Task {} failed: {err:?}", task.id);
                if let Err(err) = state.fail_task(&task).await {
                    error!("Failed to nack task {}: {err:?}", task.id);
                }
            }
        }
    }
}
