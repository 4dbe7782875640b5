use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::builder::logs;
use crate::builder::template::{self, TemplateContext};
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::queue::TaskPayload;
use crate::state::RegistryState;
use crate::state::builders::{Runner, RunnerStatus};

use super::builders::{BuilderPath, authorize, repository_name};

#[derive(Debug, Deserialize)]
pub struct RunnerPath {
    repository_id: u32,
    builder_id: u32,
    runner_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    raw_tag: String,
    #[serde(default)]
    scm_branch: Option<String>,
}

fn runner_json(runner: &Runner) -> serde_json::Value {
    json!({
        "id": runner.id,
        "builder_id": runner.builder_id,
        "status": runner.status,
        "tag": runner.tag,
        "scm_branch": runner.scm_branch,
        "started_at": runner.started_at.map(|t| t.to_rfc3339()),
        "ended_at": runner.ended_at.map(|t| t.to_rfc3339()),
        "duration_ms": runner.duration_ms,
    })
}

/// Manual run: validates the tag, inserts the pending runner under the
/// at-most-one guard, then produces the start task.
pub(crate) async fn run(
    Path(BuilderPath {
        repository_id,
        builder_id,
    }): Path<BuilderPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "push")?;

    let Some(builder) = registry.get_builder(builder_id).await? else {
        return Err(ApiError::NotFound);
    };
    if builder.repository_id != repository_id {
        return Err(ApiError::NotFound);
    }

    let scm_branch = request
        .scm_branch
        .clone()
        .or_else(|| builder.spec.scm_branch.clone());

    // raw_tag may itself be a template; rendered output must be a valid
    // OCI tag before anything is scheduled
    let context_values = TemplateContext {
        scm_branch: scm_branch.clone().unwrap_or_default(),
        scm_tag: String::new(),
        scm_ref: String::new(),
    };
    let tag = template::render(&request.raw_tag, &context_values)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let Some(runner) = registry
        .create_runner(builder_id, &tag, scm_branch.as_deref())
        .await?
    else {
        return Err(ApiError::Conflict("builder already has an active runner".to_string()));
    };

    registry
        .produce_task(&TaskPayload::BuilderStart {
            builder_id,
            repository_id,
        })
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"runner_id": runner.id}).to_string()))?)
}

pub(crate) async fn list(
    Path(BuilderPath {
        repository_id,
        builder_id,
    }): Path<BuilderPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "pull")?;

    let runners: Vec<_> = registry
        .list_runners(builder_id)
        .await?
        .iter()
        .map(runner_json)
        .collect();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"runners": runners}).to_string()))?)
}

pub(crate) async fn show(
    Path(RunnerPath {
        repository_id,
        builder_id,
        runner_id,
    }): Path<RunnerPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "pull")?;

    let Some(runner) = registry.get_runner(runner_id).await? else {
        return Err(ApiError::NotFound);
    };
    if runner.builder_id != builder_id {
        return Err(ApiError::NotFound);
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(runner_json(&runner).to_string()))?)
}

pub(crate) async fn stop(
    Path(RunnerPath {
        repository_id,
        builder_id,
        runner_id,
    }): Path<RunnerPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "push")?;

    let Some(runner) = registry.get_runner(runner_id).await? else {
        return Err(ApiError::NotFound);
    };
    if runner.builder_id != builder_id {
        return Err(ApiError::NotFound);
    }

    if runner.status.is_terminal() {
        return Err(ApiError::BadRequest("runner already finished".to_string()));
    }

    registry
        .produce_task(&TaskPayload::BuilderStop {
            builder_id,
            runner_id,
        })
        .await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())?)
}

/// Follow a runner's log over WebSocket. Terminal runner: the stored gzip
/// log is decompressed and streamed, then the socket closes. Live runner:
/// raw bytes are forwarded as they arrive; attachment is from now on, with
/// no replay.
pub(crate) async fn log(
    Path(RunnerPath {
        repository_id,
        builder_id,
        runner_id,
    }): Path<RunnerPath>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let repository = repository_name(&registry, repository_id).await?;
    authorize(&context, &repository, "pull")?;

    let Some(runner) = registry.get_runner(runner_id).await? else {
        return Err(ApiError::NotFound);
    };
    if runner.builder_id != builder_id {
        return Err(ApiError::NotFound);
    }

    Ok(ws.on_upgrade(move |socket| stream_log(socket, registry, runner)))
}

async fn stream_log(mut socket: WebSocket, registry: Arc<RegistryState>, runner: Runner) {
    if runner.status.is_terminal() {
        let Some(log_ref) = runner.log_ref.as_deref() else {
            let _ = socket.send(Message::Close(None)).await;
            return;
        };

        match logs::load(registry.store.as_ref(), log_ref).await {
            Ok(raw) => {
                for chunk in raw.chunks(64 * 1024) {
                    if socket
                        .send(Message::Binary(chunk.to_vec().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Err(err) => warn!("Could not load stored log for runner {}: {err:?}", runner.id),
        }

        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // Live follow; the hub drops oldest chunks for laggards
    let Some(mut rx) = registry.logs.subscribe(runner.id) else {
        debug!("Runner {} is not streaming on this node", runner.id);
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        match rx.recv().await {
            Ok(chunk) => {
                if socket.send(Message::Binary(chunk)).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Log follower for runner {} lagged {skipped} chunks", runner.id);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use test_log::test;

    use crate::queue::TOPIC_BUILDER;
    use crate::tests::ApiFixture;

    use super::*;

    async fn create_builder(fixture: &ApiFixture, repository_id: u32) -> Result<u32> {
        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/repositories/{repository_id}/builders"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({"source": "dockerfile", "scm_branch": "main"}).to_string(),
                    ))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        Ok(value["id"].as_u64().unwrap() as u32)
    }

    #[test(tokio::test)]
    pub async fn run_creates_pending_runner_and_task() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;
        let builder_id = create_builder(&fixture, repository_id).await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!(
                        "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/run"
                    ))
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({"raw_tag": "v1", "scm_branch": "main"}).to_string(),
                    ))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::CREATED);

        let body = res.into_body().collect().await?.to_bytes();
        let value: Value = serde_json::from_slice(&body)?;
        let runner_id = value["runner_id"].as_u64().unwrap() as u32;

        let runner = fixture.state().get_runner(runner_id).await?.unwrap();
        assert_eq!(runner.status, RunnerStatus::Pending);
        assert_eq!(runner.tag, "v1");

        let task = fixture
            .state()
            .claim_task(TOPIC_BUILDER, "c1")
            .await?
            .unwrap();
        assert_eq!(
            task.payload,
            TaskPayload::BuilderStart {
                builder_id,
                repository_id
            }
        );

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn second_run_conflicts() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;
        let builder_id = create_builder(&fixture, repository_id).await?;

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let res = fixture
                .request(
                    Request::builder()
                        .method("POST")
                        .uri(format!(
                            "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/run"
                        ))
                        .header("Content-Type", "application/json")
                        .body(Body::from(json!({"raw_tag": "v1"}).to_string()))?,
                )
                .await?;
            assert_eq!(res.status(), expected);
        }

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn invalid_tag_fails_before_scheduling() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;
        let builder_id = create_builder(&fixture, repository_id).await?;

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!(
                        "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/run"
                    ))
                    .header("Content-Type", "application/json")
                    .body(Body::from(json!({"raw_tag": "not/a/tag"}).to_string()))?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        // Nothing was scheduled
        assert!(fixture.state().pending_runner(builder_id).await?.is_none());
        assert!(fixture.state().claim_task(TOPIC_BUILDER, "c1").await?.is_none());

        fixture.teardown().await
    }

    #[test(tokio::test)]
    pub async fn stop_produces_stop_task() -> Result<()> {
        let fixture = ApiFixture::new().await?;

        let repository_id = fixture.repository("library/app").await?;
        let builder_id = create_builder(&fixture, repository_id).await?;

        let runner = fixture
            .state()
            .create_runner(builder_id, "v1", None)
            .await?
            .unwrap();

        let res = fixture
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!(
                        "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/{}/stop",
                        runner.id
                    ))
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let task = fixture
            .state()
            .claim_task(TOPIC_BUILDER, "c1")
            .await?
            .unwrap();
        assert_eq!(
            task.payload,
            TaskPayload::BuilderStop {
                builder_id,
                runner_id: runner.id
            }
        );

        fixture.teardown().await
    }
}
