use anyhow::{Context, Result};
use glob::Pattern;
use hiqlite_macros::params;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::RegistryState;
use crate::state::artifacts::TagEntry;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GcVariant {
    Tag,
    Artifact,
    Blob,
    Repository,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetentionRuleType {
    Day,
    Quantity,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GcRunnerStatus {
    Pending,
    Doing,
    Success,
    Failed,
}

#[derive(Debug, Deserialize)]
struct GcRuleRow {
    id: u32,
    namespace: String,
    variant: String,
    cron_enabled: u32,
    cron_rule: Option<String>,
    retention_pattern: String,
    retention_rule_type: String,
    retention_rule_amount: u32,
    is_running: u32,
}

#[derive(Debug, Clone)]
pub struct GcRule {
    pub id: u32,
    pub namespace: String,
    pub variant: GcVariant,
    pub cron_enabled: bool,
    pub cron_rule: Option<String>,
    pub retention_pattern: String,
    pub retention_rule_type: RetentionRuleType,
    pub retention_rule_amount: u32,
    pub is_running: bool,
}

impl TryFrom<GcRuleRow> for GcRule {
    type Error = anyhow::Error;

    fn try_from(row: GcRuleRow) -> Result<Self> {
        Ok(GcRule {
            id: row.id,
            namespace: row.namespace,
            variant: row.variant.parse().context("Invalid gc variant")?,
            cron_enabled: row.cron_enabled != 0,
            cron_rule: row.cron_rule.filter(|r| !r.is_empty()),
            retention_pattern: row.retention_pattern,
            retention_rule_type: row
                .retention_rule_type
                .parse()
                .context("Invalid retention rule type")?,
            retention_rule_amount: row.retention_rule_amount,
            is_running: row.is_running != 0,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct GcRunnerRow {
    pub id: u32,
    pub rule_id: u32,
    pub status: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GcRecordRow {
    pub id: u32,
    pub runner_id: u32,
    pub resource: String,
    pub failed: u32,
    pub message: Option<String>,
}

/// Which tags a tag GC run deletes. Tags matching any glob in the pattern
/// list are protected outright; among the rest, Quantity keeps the newest N
/// and Day keeps anything pushed within the last D days. Input must be
/// sorted newest first.
pub fn retention_victims(
    tags: &[TagEntry],
    pattern_list: &str,
    rule_type: RetentionRuleType,
    amount: u32,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<String> {
    let patterns: Vec<Pattern> = pattern_list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut kept = 0;
    let mut victims = vec![];

    for tag in tags {
        if patterns.iter().any(|p| p.matches(&tag.name)) {
            continue;
        }

        match rule_type {
            RetentionRuleType::Quantity => {
                if kept < amount {
                    kept += 1;
                } else {
                    victims.push(tag.name.clone());
                }
            }
            RetentionRuleType::Day => {
                let cutoff = now - chrono::Duration::days(amount as i64);
                match super::parse_datetime(&tag.pushed_at) {
                    Ok(pushed) if pushed >= cutoff => {}
                    // Unparseable ages are kept, never deleted on bad data
                    Err(_) => {}
                    Ok(_) => victims.push(tag.name.clone()),
                }
            }
        }
    }

    victims
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcRuleSpec {
    #[serde(default)]
    pub cron_enabled: bool,
    #[serde(default)]
    pub cron_rule: Option<String>,
    #[serde(default)]
    pub retention_pattern: String,
    #[serde(default = "default_rule_type")]
    pub retention_rule_type: RetentionRuleType,
    #[serde(default)]
    pub retention_rule_amount: u32,
}

fn default_rule_type() -> RetentionRuleType {
    RetentionRuleType::Quantity
}

impl RegistryState {
    pub async fn upsert_gc_rule(
        &self,
        namespace: &str,
        variant: GcVariant,
        spec: &GcRuleSpec,
        next_trigger: Option<String>,
    ) -> Result<GcRule> {
        self.client
            .execute(
                "INSERT INTO gc_rules(namespace, variant, cron_enabled, cron_rule,
                    cron_next_trigger, retention_pattern, retention_rule_type, retention_rule_amount)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT(namespace, variant) DO UPDATE SET
                    cron_enabled = excluded.cron_enabled,
                    cron_rule = excluded.cron_rule,
                    cron_next_trigger = excluded.cron_next_trigger,
                    retention_pattern = excluded.retention_pattern,
                    retention_rule_type = excluded.retention_rule_type,
                    retention_rule_amount = excluded.retention_rule_amount,
                    updated_at = CURRENT_TIMESTAMP;",
                params!(
                    namespace,
                    variant.to_string(),
                    spec.cron_enabled as u32,
                    spec.cron_rule.clone().unwrap_or_default(),
                    next_trigger.unwrap_or_default(),
                    &spec.retention_pattern,
                    spec.retention_rule_type.to_string(),
                    spec.retention_rule_amount
                ),
            )
            .await?;

        self.get_gc_rule(namespace, variant)
            .await?
            .context("Rule vanished after upsert")
    }

    pub async fn get_gc_rule(
        &self,
        namespace: &str,
        variant: GcVariant,
    ) -> Result<Option<GcRule>> {
        let row: Option<GcRuleRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM gc_rules WHERE namespace = $1 AND variant = $2;",
                params!(namespace, variant.to_string()),
            )
            .await?;

        row.map(GcRule::try_from).transpose()
    }

    pub async fn get_gc_rule_by_id(&self, rule_id: u32) -> Result<Option<GcRule>> {
        let row: Option<GcRuleRow> = self
            .client
            .query_as_optional("SELECT * FROM gc_rules WHERE id = $1;", params!(rule_id))
            .await?;

        row.map(GcRule::try_from).transpose()
    }

    pub async fn delete_gc_rule(&self, namespace: &str, variant: GcVariant) -> Result<()> {
        self.client
            .execute(
                "DELETE FROM gc_rules WHERE namespace = $1 AND variant = $2;",
                params!(namespace, variant.to_string()),
            )
            .await?;
        Ok(())
    }

    /// Claim the rule for a new runner. The `is_running` flag makes this a
    /// compare-and-set: a second caller gets None while a runner is live.
    pub async fn try_begin_gc_runner(&self, rule_id: u32) -> Result<Option<u32>> {
        let claimed = self
            .client
            .execute(
                "UPDATE gc_rules SET is_running = 1, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND is_running = 0;",
                params!(rule_id),
            )
            .await?;

        if claimed == 0 {
            return Ok(None);
        }

        self.client
            .execute(
                "INSERT INTO gc_runners(rule_id, status) VALUES ($1, 'pending');",
                params!(rule_id),
            )
            .await?;

        let runner: Option<GcRunnerRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM gc_runners
                 WHERE rule_id = $1 AND status = 'pending'
                 ORDER BY id DESC;",
                params!(rule_id),
            )
            .await?;

        Ok(runner.map(|r| r.id))
    }

    /// The pending runner a produced GC task should pick up.
    pub async fn pending_gc_runner(&self, rule_id: u32) -> Result<Option<u32>> {
        let runner: Option<GcRunnerRow> = self
            .client
            .query_as_optional(
                "SELECT * FROM gc_runners
                 WHERE rule_id = $1 AND status = 'pending'
                 ORDER BY id DESC;",
                params!(rule_id),
            )
            .await?;

        Ok(runner.map(|r| r.id))
    }

    pub async fn gc_runner_doing(&self, runner_id: u32) -> Result<()> {
        self.client
            .execute(
                "UPDATE gc_runners
                 SET status = 'doing', started_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND status = 'pending';",
                params!(runner_id),
            )
            .await?;
        Ok(())
    }

    /// Terminal transition; releases the rule's running flag in the same
    /// transaction.
    pub async fn gc_runner_finished(&self, runner_id: u32, failed: bool) -> Result<()> {
        let status = if failed {
            GcRunnerStatus::Failed
        } else {
            GcRunnerStatus::Success
        };

        self.client
            .txn(vec![
                (
                    "UPDATE gc_runners
                     SET status = $2,
                         ended_at = CURRENT_TIMESTAMP,
                         duration_ms = CAST(
                            (julianday(CURRENT_TIMESTAMP) - julianday(started_at)) * 86400000 AS INTEGER
                         )
                     WHERE id = $1;",
                    params!(runner_id, status.to_string()),
                ),
                (
                    "UPDATE gc_rules SET is_running = 0
                     WHERE id = (SELECT rule_id FROM gc_runners WHERE id = $1);",
                    params!(runner_id),
                ),
            ])
            .await
            .context("Failed to finish gc runner")?;

        Ok(())
    }

    /// One audit row per deleted (or failed to delete) item.
    pub async fn gc_record(
        &self,
        runner_id: u32,
        resource: &str,
        failed: bool,
        message: Option<&str>,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO gc_records(runner_id, resource, failed, message)
                 VALUES ($1, $2, $3, $4);",
                params!(runner_id, resource, failed as u32, message.unwrap_or_default()),
            )
            .await?;
        Ok(())
    }

    pub async fn list_gc_runners(&self, rule_id: u32) -> Result<Vec<GcRunnerRow>> {
        Ok(self
            .client
            .query_as(
                "SELECT * FROM gc_runners WHERE rule_id = $1 ORDER BY id DESC;",
                params!(rule_id),
            )
            .await?)
    }

    pub async fn list_gc_records(&self, runner_id: u32) -> Result<Vec<GcRecordRow>> {
        Ok(self
            .client
            .query_as(
                "SELECT * FROM gc_records WHERE runner_id = $1 ORDER BY id;",
                params!(runner_id),
            )
            .await?)
    }

    pub async fn due_gc_rules(&self, limit: usize) -> Result<Vec<GcRule>> {
        let rows: Vec<GcRuleRow> = self
            .client
            .query_as(
                "SELECT * FROM gc_rules
                 WHERE cron_enabled = 1
                 AND is_running = 0
                 AND cron_next_trigger != ''
                 AND cron_next_trigger <= datetime('now')
                 ORDER BY cron_next_trigger
                 LIMIT $1;",
                params!(limit as u32),
            )
            .await?;

        rows.into_iter().map(GcRule::try_from).collect()
    }

    pub async fn set_gc_rule_next_trigger(&self, rule_id: u32, next_trigger: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE gc_rules SET cron_next_trigger = $2 WHERE id = $1;",
                params!(rule_id, next_trigger),
            )
            .await?;
        Ok(())
    }

    /// Repositories that a per-namespace GC variant should walk.
    pub async fn repositories_in_namespace(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .client
            .query_as(
                "SELECT name FROM repositories WHERE namespace = $1 ORDER BY name;",
                params!(namespace),
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_log::test;

    use crate::tests::StateFixture;

    use super::*;

    fn tag(name: &str, age_hours: i64) -> TagEntry {
        TagEntry {
            name: name.to_string(),
            pushed_at: (Utc::now() - chrono::Duration::hours(age_hours))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        }
    }

    #[test]
    fn retention_by_quantity_with_protection() {
        // Newest first: dev-c (1h), dev-b (3h), dev-a (4h), v1.1 (48h), v1.0 (72h)
        let tags = vec![
            tag("dev-c", 1),
            tag("dev-b", 3),
            tag("dev-a", 4),
            tag("v1.1", 48),
            tag("v1.0", 72),
        ];

        let victims = retention_victims(&tags, "v*", RetentionRuleType::Quantity, 2, Utc::now());

        // v* protected; of dev-a/b/c the two newest stay
        assert_eq!(victims, vec!["dev-a"]);
    }

    #[test]
    fn retention_by_day() {
        let tags = vec![tag("new", 10), tag("old", 30 * 24), tag("v1.0", 40 * 24)];

        let victims = retention_victims(&tags, "v*", RetentionRuleType::Day, 7, Utc::now());

        assert_eq!(victims, vec!["old"]);
    }

    #[test]
    fn retention_empty_pattern_protects_nothing() {
        let tags = vec![tag("a", 1), tag("b", 2), tag("c", 3)];

        let victims = retention_victims(&tags, "", RetentionRuleType::Quantity, 1, Utc::now());
        assert_eq!(victims, vec!["b", "c"]);
    }

    #[test(tokio::test)]
    async fn rule_upsert_round_trip() -> Result<()> {
        let registry = StateFixture::new().await?;

        let rule = registry
            .upsert_gc_rule(
                "library",
                GcVariant::Tag,
                &GcRuleSpec {
                    cron_enabled: true,
                    cron_rule: Some("0 2 * * *".into()),
                    retention_pattern: "v*".into(),
                    retention_rule_type: RetentionRuleType::Quantity,
                    retention_rule_amount: 10,
                },
                Some("2000-01-01 00:00:00".into()),
            )
            .await?;

        assert_eq!(rule.namespace, "library");
        assert_eq!(rule.variant, GcVariant::Tag);
        assert!(!rule.is_running);

        // Upsert replaces in place
        let updated = registry
            .upsert_gc_rule(
                "library",
                GcVariant::Tag,
                &GcRuleSpec {
                    cron_enabled: false,
                    cron_rule: None,
                    retention_pattern: String::new(),
                    retention_rule_type: RetentionRuleType::Day,
                    retention_rule_amount: 30,
                },
                None,
            )
            .await?;
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.retention_rule_type, RetentionRuleType::Day);

        registry.teardown().await?;

        Ok(())
    }

    #[test(tokio::test)]
    async fn at_most_one_runner_per_rule() -> Result<()> {
        let registry = StateFixture::new().await?;

        let rule = registry
            .upsert_gc_rule(
                "library",
                GcVariant::Blob,
                &GcRuleSpec {
                    cron_enabled: false,
                    cron_rule: None,
                    retention_pattern: String::new(),
                    retention_rule_type: RetentionRuleType::Quantity,
                    retention_rule_amount: 0,
                },
                None,
            )
            .await?;

        let runner_id = registry.try_begin_gc_runner(rule.id).await?.unwrap();

        // Second claim refused while running
        assert_eq!(registry.try_begin_gc_runner(rule.id).await?, None);

        registry.gc_runner_doing(runner_id).await?;
        registry.gc_record(runner_id, "sha256:abcd", false, None).await?;
        registry.gc_runner_finished(runner_id, false).await?;

        let runners = registry.list_gc_runners(rule.id).await?;
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].status, "success");
        assert!(runners[0].duration_ms.is_some());

        let records = registry.list_gc_records(runner_id).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource, "sha256:abcd");
        assert_eq!(records[0].failed, 0);

        // Flag released, next runner can start
        assert!(registry.try_begin_gc_runner(rule.id).await?.is_some());

        registry.teardown().await?;

        Ok(())
    }
}
