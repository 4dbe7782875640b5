//! Cooperative timewheel driving periodic work.
//!
//! A single ticker wakes every `scheduler.tick`; a tick that fills its batch
//! asks for another tick sooner via [`TickHandle::tick_next`] instead of
//! waiting out the full interval. Ticks only run on the elected leader.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hiqlite_macros::params;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{error, info, warn};

use crate::builder::template::{self, TemplateContext};
use crate::cron::CronRule;
use crate::queue::TaskPayload;
use crate::shutdown::Broadcast;
use crate::state::RegistryState;

/// Brings the next tick forward; a tick that found a full batch uses this to
/// pick up the remainder without waiting for the wheel to come round.
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::Sender<Duration>,
}

impl TickHandle {
    pub fn tick_next(&self, duration: Duration) {
        let _ = self.tx.try_send(duration);
    }
}

/// How long a dead-lettered task rests before a tick revives it.
const DEAD_TASK_REST_SECS: u64 = 60 * 60;
/// In-flight tasks older than this are assumed stranded by a dead consumer.
const STUCK_TASK_SECS: u64 = 30 * 60;

pub fn start(
    tasks: &mut JoinSet<Result<()>>,
    state: Arc<RegistryState>,
    leader: watch::Receiver<bool>,
    mut broadcasts: broadcast::Receiver<Broadcast>,
) -> TickHandle {
    let (tx, mut rx) = mpsc::channel(16);
    let handle = TickHandle { tx };
    let loop_handle = handle.clone();

    tasks.spawn(async move {
        let tick = state.config.scheduler.tick;
        let mut deadline = Instant::now() + tick;

        info!("Scheduler timewheel started, tick {tick:?}");

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    deadline = Instant::now() + tick;

                    if !*leader.borrow() {
                        continue;
                    }

                    match run_tick(&state).await {
                        Ok(outcome) => {
                            if outcome.hit_cap {
                                loop_handle.tick_next(Duration::from_secs(3));
                            }
                        }
                        Err(err) => error!("Scheduler tick failed: {err:?}"),
                    }
                }
                Some(sooner) = rx.recv() => {
                    deadline = deadline.min(Instant::now() + sooner);
                }
                Ok(Broadcast::Shutdown) = broadcasts.recv() => {
                    info!("Scheduler: graceful shutdown");
                    break;
                }
            }
        }

        Ok(())
    });

    handle
}

#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    pub scheduled: usize,
    pub hit_cap: bool,
}

/// One scheduler pass: launch due GC rules and due builders, then housekeep
/// the queue. Each rule is handled in its own metadata transaction so a
/// produced task is never orphaned from its runner row.
pub async fn run_tick(state: &Arc<RegistryState>) -> Result<TickOutcome> {
    let max_job = state.config.scheduler.max_job;
    let mut scheduled = 0;

    let now = chrono::Utc::now();

    for rule in state.due_gc_rules(max_job).await? {
        let Some(cron_rule) = rule.cron_rule.as_deref() else {
            continue;
        };

        let next_trigger = match cron_rule.parse::<CronRule>() {
            Ok(parsed) => parsed.next_trigger_column(now),
            Err(err) => {
                warn!(rule = rule.id, "Disabling gc rule with bad cron: {err}");
                state
                    .client
                    .execute(
                        "UPDATE gc_rules SET cron_enabled = 0 WHERE id = $1;",
                        params!(rule.id),
                    )
                    .await?;
                continue;
            }
        };

        // Claim first so two runners can never race for the same rule, then
        // one transaction covers trigger, runner row and queue task.
        let claimed = state
            .client
            .execute(
                "UPDATE gc_rules SET is_running = 1 WHERE id = $1 AND is_running = 0;",
                params!(rule.id),
            )
            .await?;
        if claimed == 0 {
            continue;
        }

        let task = state.task_statement(&TaskPayload::GcRun { rule_id: rule.id })?;

        let result = state
            .client
            .txn(vec![
                (
                    "UPDATE gc_rules SET cron_next_trigger = $2 WHERE id = $1;",
                    params!(rule.id, next_trigger),
                ),
                (
                    "INSERT INTO gc_runners(rule_id, status) VALUES ($1, 'pending');",
                    params!(rule.id),
                ),
                (task.sql, task.params),
            ])
            .await;

        if let Err(err) = result {
            error!(rule = rule.id, "Failed to schedule gc runner: {err:?}");
            state
                .client
                .execute(
                    "UPDATE gc_rules SET is_running = 0 WHERE id = $1;",
                    params!(rule.id),
                )
                .await?;
            continue;
        }

        scheduled += 1;
    }

    let remaining = max_job.saturating_sub(scheduled);

    for builder in state.due_builders(remaining).await? {
        let Some(cron_rule) = builder.spec.cron_rule.as_deref() else {
            continue;
        };

        let next_trigger = match cron_rule.parse::<CronRule>() {
            Ok(parsed) => parsed.next_trigger_column(now),
            Err(err) => {
                warn!(
                    builder = builder.id,
                    "Disabling builder cron with bad rule: {err}"
                );
                state
                    .client
                    .execute(
                        "UPDATE builders SET cron_enabled = 0 WHERE id = $1;",
                        params!(builder.id),
                    )
                    .await?;
                continue;
            }
        };

        let context = TemplateContext {
            scm_branch: builder.spec.scm_branch.clone().unwrap_or_default(),
            scm_tag: String::new(),
            scm_ref: String::new(),
        };

        let tag = match template::render(
            builder
                .spec
                .cron_tag_template
                .as_deref()
                .unwrap_or("{{ .ScmBranch | default \"latest\" }}"),
            &context,
        ) {
            Ok(tag) => tag,
            Err(err) => {
                warn!(builder = builder.id, "Tag template failed validation: {err}");
                state
                    .set_builder_next_trigger(builder.id, &next_trigger)
                    .await?;
                continue;
            }
        };

        let task = state.task_statement(&TaskPayload::BuilderStart {
            builder_id: builder.id,
            repository_id: builder.repository_id,
        })?;

        // The guarded insert no-ops when a runner is already active; the
        // dispatcher drops the task on finding no pending runner.
        state
            .client
            .txn(vec![
                (
                    "UPDATE builders SET cron_next_trigger = $2 WHERE id = $1;",
                    params!(builder.id, next_trigger),
                ),
                (
                    "INSERT INTO builder_runners(builder_id, status, tag, scm_branch)
                     SELECT $1, 'pending', $2, $3
                     WHERE NOT EXISTS (
                        SELECT 1 FROM builder_runners
                        WHERE builder_id = $1 AND status IN ('pending', 'building')
                     );",
                    params!(
                        builder.id,
                        tag,
                        builder.spec.scm_branch.clone().unwrap_or_default()
                    ),
                ),
                (task.sql, task.params),
            ])
            .await?;

        scheduled += 1;
    }

    state.task_wake.notify_waiters();

    state.requeue_dead_tasks(DEAD_TASK_REST_SECS).await?;
    state.release_stuck_tasks(STUCK_TASK_SECS).await?;

    Ok(TickOutcome {
        scheduled,
        hit_cap: scheduled >= max_job,
    })
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::queue::{TOPIC_BUILDER, TOPIC_GC};
    use crate::state::builders::{BuilderSource, BuilderSpec, ScmCredentialType};
    use crate::state::gc::{GcRuleSpec, GcVariant, RetentionRuleType};
    use crate::tests::StateFixture;

    use super::*;

    fn builder_spec() -> BuilderSpec {
        BuilderSpec {
            source: BuilderSource::Dockerfile,
            scm_credential_type: ScmCredentialType::None,
            scm_ssh_key: None,
            scm_token: None,
            scm_username: None,
            scm_password: None,
            scm_repository: None,
            scm_branch: Some("main".into()),
            scm_depth: None,
            scm_submodule: false,
            cron_enabled: true,
            cron_rule: Some("* * * * *".into()),
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

    #[test(tokio::test)]
    async fn tick_schedules_due_builder() -> Result<()> {
        let registry = StateFixture::new().await?;
        let state = registry.registries[0].clone();

        let builder_id = registry
            .create_builder(
                "library/app",
                &builder_spec(),
                Some("2000-01-01 00:00:00".into()),
            )
            .await?
            .unwrap();

        let outcome = run_tick(&state).await?;
        assert_eq!(outcome.scheduled, 1);
        assert!(!outcome.hit_cap);

        // Runner row exists and the start task is claimable
        let runner = registry.pending_runner(builder_id).await?.unwrap();
        assert_eq!(runner.tag, "main");

        let task = registry.claim_task(TOPIC_BUILDER, "c1").await?.unwrap();
        assert_eq!(
            task.payload,
            TaskPayload::BuilderStart {
                builder_id,
                repository_id: registry.get_builder(builder_id).await?.unwrap().repository_id,
            }
        );

        // Trigger advanced into the future; a second tick schedules nothing
        let outcome = run_tick(&state).await?;
        assert_eq!(outcome.scheduled, 0);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn tick_schedules_due_gc_rule() -> Result<()> {
        let registry = StateFixture::new().await?;
        let state = registry.registries[0].clone();

        let rule = registry
            .upsert_gc_rule(
                "library",
                GcVariant::Tag,
                &GcRuleSpec {
                    cron_enabled: true,
                    cron_rule: Some("* * * * *".into()),
                    retention_pattern: "v*".into(),
                    retention_rule_type: RetentionRuleType::Quantity,
                    retention_rule_amount: 2,
                },
                Some("2000-01-01 00:00:00".into()),
            )
            .await?;

        let outcome = run_tick(&state).await?;
        assert_eq!(outcome.scheduled, 1);

        let runners = registry.list_gc_runners(rule.id).await?;
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].status, "pending");

        let task = registry.claim_task(TOPIC_GC, "c1").await?.unwrap();
        assert_eq!(task.payload, TaskPayload::GcRun { rule_id: rule.id });

        // The rule is claimed; the next tick leaves it alone
        let outcome = run_tick(&state).await?;
        assert_eq!(outcome.scheduled, 0);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn full_batches_report_the_cap() -> Result<()> {
        let registry = StateFixture::with_config(|config| {
            config.scheduler.max_job = 2;
        })
        .await?;
        let state = registry.registries[0].clone();

        for i in 0..5 {
            registry
                .create_builder(
                    &format!("library/app{i}"),
                    &builder_spec(),
                    Some("2000-01-01 00:00:00".into()),
                )
                .await?
                .unwrap();
        }

        // 5 due builders drain in batches of 2, 2, 1
        let outcome = run_tick(&state).await?;
        assert_eq!(
            outcome,
            TickOutcome {
                scheduled: 2,
                hit_cap: true
            }
        );

        let outcome = run_tick(&state).await?;
        assert_eq!(outcome.scheduled, 2);
        assert!(outcome.hit_cap);

        let outcome = run_tick(&state).await?;
        assert_eq!(
            outcome,
            TickOutcome {
                scheduled: 1,
                hit_cap: false
            }
        );

        // Every builder produced exactly one runner
        for i in 0..5 {
            let repository = registry
                .get_repository(&format!("library/app{i}"))
                .await?
                .unwrap();
            let builder = registry
                .builder_for_repository(repository.id)
                .await?
                .unwrap();
            assert!(registry.pending_runner(builder.id).await?.is_some());
        }

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn bad_cron_is_disabled_not_retried() -> Result<()> {
        let registry = StateFixture::new().await?;
        let state = registry.registries[0].clone();

        registry
            .create_builder(
                "library/app",
                &BuilderSpec {
                    cron_rule: Some("not a cron".into()),
                    ..builder_spec()
                },
                Some("2000-01-01 00:00:00".into()),
            )
            .await?
            .unwrap();

        let outcome = run_tick(&state).await?;
        assert_eq!(outcome.scheduled, 0);

        // Disabled; the next tick no longer sees it
        assert!(registry.due_builders(10).await?.is_empty());

        registry.teardown().await?;

        Ok(())
    }
}
