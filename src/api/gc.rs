use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::context::RequestContext;
use crate::cron::CronRule;
use crate::error::ApiError;
use crate::queue::TaskPayload;
use crate::state::RegistryState;
use crate::state::gc::{GcRule, GcRuleSpec, GcVariant};

#[derive(Debug, Deserialize)]
pub struct RulePath {
    namespace: String,
    variant: String,
}

#[derive(Debug, Deserialize)]
pub struct RunnerPath {
    namespace: String,
    variant: String,
    runner_id: u32,
}

fn parse_variant(variant: &str) -> Result<GcVariant, ApiError> {
    variant
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown gc variant: {variant}")))
}

fn authorize_admin(context: &RequestContext) -> Result<(), ApiError> {
    if !context.validated_token {
        return Err(ApiError::MustAuthenticate {
            challenge: context.get_general_challenge(),
        });
    }

    // GC policy is operator surface
    if !context.admin {
        return Err(ApiError::AccessDenied);
    }

    Ok(())
}

fn rule_json(rule: &GcRule) -> serde_json::Value {
    json!({
        "id": rule.id,
        "namespace": rule.namespace,
        "variant": rule.variant,
        "cron_enabled": rule.cron_enabled,
        "cron_rule": rule.cron_rule,
        "retention_pattern": rule.retention_pattern,
        "retention_rule_type": rule.retention_rule_type,
        "retention_rule_amount": rule.retention_rule_amount,
        "is_running": rule.is_running,
    })
}

pub(crate) async fn upsert_rule(
    Path(RulePath { namespace, variant }): Path<RulePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    Json(spec): Json<GcRuleSpec>,
) -> Result<Response, ApiError> {
    authorize_admin(&context)?;
    let variant = parse_variant(&variant)?;

    let next_trigger = if spec.cron_enabled {
        let Some(rule) = spec.cron_rule.as_deref() else {
            return Err(ApiError::BadRequest(
                "cron_enabled requires cron_rule".to_string(),
            ));
        };
        let parsed: CronRule = rule
            .parse()
            .map_err(|err| ApiError::BadRequest(format!("invalid cron rule: {err}")))?;
        Some(parsed.next_trigger_column(Utc::now()))
    } else {
        None
    };

    let rule = registry
        .upsert_gc_rule(&namespace, variant, &spec, next_trigger)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(rule_json(&rule).to_string()))?)
}

pub(crate) async fn show_rule(
    Path(RulePath { namespace, variant }): Path<RulePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_admin(&context)?;
    let variant = parse_variant(&variant)?;

    let Some(rule) = registry.get_gc_rule(&namespace, variant).await? else {
        return Err(ApiError::NotFound);
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(rule_json(&rule).to_string()))?)
}

pub(crate) async fn delete_rule(
    Path(RulePath { namespace, variant }): Path<RulePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_admin(&context)?;
    let variant = parse_variant(&variant)?;

    if registry.get_gc_rule(&namespace, variant).await?.is_none() {
        return Err(ApiError::NotFound);
    }

    registry.delete_gc_rule(&namespace, variant).await?;

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())?)
}

/// Manual trigger. Claims the rule's runner slot and produces the task; a
/// live runner means 400, per the one-runner-per-rule contract.
pub(crate) async fn run(
    Path(RulePath { namespace, variant }): Path<RulePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_admin(&context)?;
    let variant = parse_variant(&variant)?;

    let Some(rule) = registry.get_gc_rule(&namespace, variant).await? else {
        return Err(ApiError::NotFound);
    };

    let Some(runner_id) = registry.try_begin_gc_runner(rule.id).await? else {
        return Err(ApiError::BadRequest("rule is running".to_string()));
    };

    registry
        .produce_task(&TaskPayload::GcRun { rule_id: rule.id })
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"runner_id": runner_id}).to_string()))?)
}

pub(crate) async fn list_runners(
    Path(RulePath { namespace, variant }): Path<RulePath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_admin(&context)?;
    let variant = parse_variant(&variant)?;

    let Some(rule) = registry.get_gc_rule(&namespace, variant).await? else {
        return Err(ApiError::NotFound);
    };

    let runners: Vec<_> = registry
        .list_gc_runners(rule.id)
        .await?
        .iter()
        .map(|runner| {
            json!({
                "id": runner.id,
                "rule_id": runner.rule_id,
                "status": runner.status,
                "started_at": runner.started_at,
                "ended_at": runner.ended_at,
                "duration_ms": runner.duration_ms,
            })
        })
        .collect();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"runners": runners}).to_string()))?)
}

pub(crate) async fn list_records(
    Path(RunnerPath {
        namespace,
        variant,
        runner_id,
    }): Path<RunnerPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    authorize_admin(&context)?;
    let variant = parse_variant(&variant)?;

    if registry.get_gc_rule(&namespace, variant).await?.is_none() {
        return Err(ApiError::NotFound);
    }

    let records: Vec<_> = registry
        .list_gc_records(runner_id)
        .await?
        .iter()
        .map(|record| {
            json!({
                "id": record.id,
                "resource": record.resource,
                "failed": record.failed != 0,
                "message": record.message,
            })
        })
        .collect();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"records": records}).to_string()))?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use test_log::test;

    use crate::queue::TOPIC_GC;
    use crate::tests::ApiFixture;

    use super::*;

    #[test(tokio::test)]
    pub async fn rule_crud() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri("/api/v1/namespaces/library/gc/tag/rule")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({
                            "cron_enabled": true,
                            "cron_rule": "0 2 * * *",
                            "retention_pattern": "v*",
                            "retention_rule_type": "quantity",
                            "retention_rule_amount": 10,
                        })
                        .to_string(),
                    ))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/namespaces/library/gc/tag/rule")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        assert_eq!(value["retention_pattern"], "v*");
        assert_eq!(value["is_running"], false);

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/namespaces/library/gc/tag/rule")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn unknown_variant_is_rejected() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let res = fixture
            .request(
                Request::builder()
                    .uri("/api/v1/namespaces/library/gc/everything/rule")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn second_run_is_refused_while_running() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        fixture
            .request(
                Request::builder()
                    .method("PUT")
                    .uri("/api/v1/namespaces/library/gc/blob/rule")
                    .header("Content-Type", "application/json")
                    .body(Body::from(json!({}).to_string()))?,
            )
            .await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/namespaces/library/gc/blob/run")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        // The queue task was produced for this rule
        let task = fixture.state().claim_task(TOPIC_GC, "c1").await?.unwrap();
        assert!(matches!(task.payload, TaskPayload::GcRun { .. }));

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/namespaces/library/gc/blob/run")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        assert_eq!(value["message"], "rule is running");

        fixture.teardown().await
    }
}
