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
use crate::state::RegistryState;
use crate::state::builders::{Builder, BuilderSpec};

#[derive(Debug, Deserialize)]
pub struct BuilderPath {
    pub repository_id: u32,
    pub builder_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPath {
    repository_id: u32,
}

pub(crate) async fn repository_name(
    registry: &RegistryState,
    repository_id: u32,
) -> Result<String, ApiError> {
    let name: Option<String> = registry
        .client
        .query_as_optional(
            "SELECT name FROM repositories WHERE id = $1;",
            hiqlite_macros::params!(repository_id),
        )
        .await?;

    name.ok_or(ApiError::NotFound)
}

pub(crate) fn authorize(
    context: &RequestContext,
    repository: &str,
    action: &str,
) -> Result<(), ApiError> {
    if !context.validated_token {
        return Err(ApiError::MustAuthenticate {
            challenge: context.get_push_challenge(repository),
        });
    }

    if !context.has_permission(repository, action) {
        return Err(ApiError::AccessDenied);
    }

    Ok(())
}

/// Next trigger is computed at write time so the scheduler only ever
/// compares timestamps.
fn next_trigger(spec: &BuilderSpec) -> Result<Option<String>, ApiError> {
    if !spec.cron_enabled {
        return Ok(None);
    }

    let Some(rule) = spec.cron_rule.as_deref() else {
        return Err(ApiError::BadRequest(
            "cron_enabled requires cron_rule".to_string(),
        ));
    };

    let parsed: CronRule = rule
        .parse()
        .map_err(|err| ApiError::BadRequest(format!("invalid cron rule: {err}")))?;

    Ok(Some(parsed.next_trigger_column(Utc::now())))
}

fn validate(spec: &BuilderSpec) -> Result<(), ApiError> {
    spec.validate().map_err(ApiError::BadRequest)
}

fn builder_json(builder: &Builder) -> serde_json::Value {
    json!({
        "id": builder.id,
        "repository_id": builder.repository_id,
        "repository": builder.repository,
        "source": builder.source,
        "scm_credential_type": builder.spec.scm_credential_type,
        "scm_repository": builder.spec.scm_repository,
        "scm_branch": builder.spec.scm_branch,
        "scm_depth": builder.spec.scm_depth,
        "scm_submodule": builder.spec.scm_submodule,
        "cron_enabled": builder.spec.cron_enabled,
        "cron_rule": builder.spec.cron_rule,
        "cron_tag_template": builder.spec.cron_tag_template,
        "webhook_enabled": builder.spec.webhook_enabled,
        "webhook_tag_template": builder.spec.webhook_tag_template,
        "buildkit_insecure_registries": builder.spec.buildkit_insecure_registries,
        "buildkit_context": builder.spec.buildkit_context,
        "buildkit_dockerfile": builder.spec.buildkit_dockerfile,
        "buildkit_platforms": builder.spec.buildkit_platforms,
        "buildkit_build_args": builder.spec.buildkit_build_args,
    })
}

pub(crate) async fn create(
    Path(RepositoryPath { repository_id }): Path<RepositoryPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    Json(spec): Json<BuilderSpec>,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "push")?;

    validate(&spec)?;
    let trigger = next_trigger(&spec)?;

    let Some(builder_id) = registry.create_builder(&repository, &spec, trigger).await? else {
        return Err(ApiError::Conflict(
            "repository already has a builder".to_string(),
        ));
    };

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"id": builder_id}).to_string()))?)
}

pub(crate) async fn show(
    Path(BuilderPath {
        repository_id,
        builder_id,
    }): Path<BuilderPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "pull")?;

    let Some(builder) = registry.get_builder(builder_id).await? else {
        return Err(ApiError::NotFound);
    };

    if builder.repository_id != repository_id {
        return Err(ApiError::NotFound);
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(builder_json(&builder).to_string()))?)
}

pub(crate) async fn update(
    Path(BuilderPath {
        repository_id,
        builder_id,
    }): Path<BuilderPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    Json(spec): Json<BuilderSpec>,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "push")?;

    let Some(builder) = registry.get_builder(builder_id).await? else {
        return Err(ApiError::NotFound);
    };
    if builder.repository_id != repository_id {
        return Err(ApiError::NotFound);
    }

    validate(&spec)?;
    let trigger = next_trigger(&spec)?;

    registry.update_builder(builder_id, &spec, trigger).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"id": builder_id}).to_string()))?)
}

pub(crate) async fn destroy(
    Path(BuilderPath {
        repository_id,
        builder_id,
    }): Path<BuilderPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "push")?;

    let Some(builder) = registry.get_builder(builder_id).await? else {
        return Err(ApiError::NotFound);
    };
    if builder.repository_id != repository_id {
        return Err(ApiError::NotFound);
    }

    registry.delete_builder(builder_id).await?;

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use test_log::test;

    use crate::tests::ApiFixture;

    use super::*;

    fn payload() -> Value {
        json!({
            "source": "dockerfile",
            "scm_branch": "main",
            "cron_enabled": true,
            "cron_rule": "0 2 * * *",
            "cron_tag_template": "{{ .ScmBranch }}",
        })
    }

    #[test(tokio::test)]
    pub async fn create_and_fetch() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/repositories/{repository_id}/builders"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(payload().to_string()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        let builder_id = value["id"].as_u64().unwrap();

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!(
                        "/api/v1/repositories/{repository_id}/builders/{builder_id}"
                    ))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        assert_eq!(value["repository"], "library/app");
        assert_eq!(value["cron_rule"], "0 2 * * *");

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn second_builder_conflicts() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let res = fixture
                .request(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/api/v1/repositories/{repository_id}/builders"))
                        .header("Content-Type", "application/json")
                        .body(Body::from(payload().to_string()))?,
                )
                .await?;
            assert_eq!(res.status(), expected);
        }

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn bad_cron_is_rejected() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;

        let mut body = payload();
        body["cron_rule"] = json!("not a cron");

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/repositories/{repository_id}/builders"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn mismatched_credentials_are_rejected() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;

        let body = json!({
            "source": "code_repository",
            "scm_credential_type": "ssh",
        });

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/repositories/{repository_id}/builders"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn delete_builder() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/repositories/{repository_id}/builders"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(payload().to_string()))?,
            )
            .await?;
        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        let builder_id = value["id"].as_u64().unwrap();

        let res = fixture
            .request(
                Request::builder()
                    .method("DELETE")
                    .uri(format!(
                        "/api/v1/repositories/{repository_id}/builders/{builder_id}"
                    ))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = fixture
            .request(
                Request::builder()
                    .uri(format!(
                        "/api/v1/repositories/{repository_id}/builders/{builder_id}"
                    ))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        fixture.teardown().await
    }
}
