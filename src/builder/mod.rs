//! Build orchestration: turning queue payloads into runner lifecycles.
//!
//! Start loads the builder and its pending runner, mints a scoped token,
//! renders the runner environment and submits to the backend; a watcher
//! task follows the run, fans out logs, and records the terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jwt_simple::prelude::*;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Configuration;
use crate::config::acl::Action;
use crate::context::{Access, AdditionalClaims};
use crate::queue::{TaskHandler, TaskPayload};
use crate::state::RegistryState;
use crate::state::builders::{Builder, Runner, RunnerStatus};

pub(crate) mod backend;
pub(crate) mod logs;
pub(crate) mod template;

use backend::{RunnerBackend, RunnerHandle, RunnerSpec};
use logs::LogHub;

/// Token handed to a runner: pull/push on its repository plus the cache
/// endpoints, valid for the expected build duration.
pub(crate) fn mint_runner_token(
    config: &Configuration,
    repository: &str,
) -> Result<Option<String>> {
    let Some(authentication) = &config.authentication else {
        return Ok(None);
    };

    let claims = Claims::with_custom_claims(
        AdditionalClaims {
            access: vec![Access {
                type_: "repository".to_string(),
                name: repository.to_string(),
                actions: vec![Action::Pull, Action::Push],
            }],
        },
        Duration::from_secs(config.builder.token_ttl.as_secs()),
    )
    .with_issuer(&config.url)
    .with_audience(&config.url)
    .with_subject("$builder");

    let token = authentication
        .key_pair
        .key_pair
        .sign(claims)
        .context("Failed to sign runner token")?;

    Ok(Some(token))
}

pub(crate) struct Dispatcher {
    state: Arc<RegistryState>,
    backend: Arc<dyn RunnerBackend>,
    logs: Arc<LogHub>,
    handles: Mutex<HashMap<u32, RunnerHandle>>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<RegistryState>,
        backend: Arc<dyn RunnerBackend>,
        logs: Arc<LogHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            backend,
            logs,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// The environment contract between the dispatcher and the runner
    /// container.
    fn runner_env(&self, builder: &Builder, runner: &Runner, token: Option<String>) -> Vec<(String, String)> {
        let config = &self.state.config.builder;
        let spec = &builder.spec;

        let (registry_username, registry_password) = match token {
            Some(token) => ("$builder".to_string(), token),
            None => (
                config.registry_username.clone(),
                config.registry_password.clone(),
            ),
        };

        let scm_branch = runner
            .scm_branch
            .clone()
            .or_else(|| spec.scm_branch.clone())
            .unwrap_or_default();

        vec![
            ("ID".into(), builder.id.to_string()),
            ("RUNNER_ID".into(), runner.id.to_string()),
            (
                "SCM_CREDENTIAL_TYPE".into(),
                spec.scm_credential_type.to_string(),
            ),
            (
                "SCM_SSH_KEY".into(),
                spec.scm_ssh_key.clone().unwrap_or_default(),
            ),
            ("SCM_TOKEN".into(), spec.scm_token.clone().unwrap_or_default()),
            (
                "SCM_USERNAME".into(),
                spec.scm_username.clone().unwrap_or_default(),
            ),
            (
                "SCM_PASSWORD".into(),
                spec.scm_password.clone().unwrap_or_default(),
            ),
            ("SCM_PROVIDER".into(), builder.source.to_string()),
            (
                "SCM_REPOSITORY".into(),
                spec.scm_repository.clone().unwrap_or_default(),
            ),
            ("SCM_BRANCH".into(), scm_branch),
            (
                "SCM_DEPTH".into(),
                spec.scm_depth.map(|d| d.to_string()).unwrap_or_default(),
            ),
            ("SCM_SUBMODULE".into(), spec.scm_submodule.to_string()),
            ("OCI_REGISTRY_DOMAIN".into(), config.registry_domain.clone()),
            ("OCI_REGISTRY_USERNAME".into(), registry_username),
            ("OCI_REGISTRY_PASSWORD".into(), registry_password),
            (
                "OCI_NAME".into(),
                format!(
                    "{}/{}:{}",
                    config.registry_domain, builder.repository, runner.tag
                ),
            ),
            (
                "BUILDKIT_INSECURE_REGISTRIES".into(),
                spec.buildkit_insecure_registries.clone(),
            ),
            (
                "BUILDKIT_CACHE_DIR".into(),
                format!("{}/{}", config.cache_url, builder.id),
            ),
            ("BUILDKIT_CONTEXT".into(), spec.buildkit_context.clone()),
            ("BUILDKIT_DOCKERFILE".into(), spec.buildkit_dockerfile.clone()),
            ("BUILDKIT_PLATFORMS".into(), spec.buildkit_platforms.clone()),
        ]
    }

    async fn start(self: &Arc<Self>, builder_id: u32) -> Result<()> {
        let Some(builder) = self.state.get_builder(builder_id).await? else {
            warn!("Start for unknown builder {builder_id}; dropping");
            return Ok(());
        };

        // The scheduler or API created the pending runner in the same
        // transaction as this task; no pending runner means the start was
        // superseded.
        let Some(runner) = self.state.pending_runner(builder_id).await? else {
            info!("Builder {builder_id} has no pending runner; dropping start");
            return Ok(());
        };

        let token = mint_runner_token(&self.state.config, &builder.repository)?;
        let env = self.runner_env(&builder, &runner, token);

        let handle = self
            .backend
            .start(RunnerSpec {
                name: format!("builder-{}-runner-{}", builder.id, runner.id),
                command: self.state.config.builder.command.clone(),
                env,
            })
            .await;

        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                error!("Backend refused runner {}: {err:?}", runner.id);
                self.state
                    .runner_finished(runner.id, RunnerStatus::Failed, None)
                    .await?;
                return Ok(());
            }
        };

        if !self.state.runner_building(runner.id).await? {
            // Raced with a stop; tear the container back down
            warn!("Runner {} left pending state early; stopping", runner.id);
            let _ = self.backend.stop(handle).await;
            return Ok(());
        }

        self.handles.lock().await.insert(runner.id, handle);

        info!(
            builder = builder.id,
            runner = runner.id,
            tag = %runner.tag,
            "Runner building"
        );

        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatcher.watch(runner.id, handle).await {
                error!("Watcher for runner {} failed: {err:?}", runner.id);
            }
        });

        Ok(())
    }

    /// Follow a running build: pump backend logs into the fan-out channel,
    /// then record the exit and persist the log.
    async fn watch(self: &Arc<Self>, runner_id: u32, handle: RunnerHandle) -> Result<()> {
        let fanout = self.logs.open(runner_id);

        let mut collected = Vec::new();

        match self.backend.log_stream(handle).await {
            Ok(mut stream) => {
                let mut buffer = [0u8; 8192];
                loop {
                    match stream.read(&mut buffer).await {
                        Ok(0) => break,
                        Ok(len) => {
                            collected.extend_from_slice(&buffer[..len]);
                            let _ = fanout.send(bytes::Bytes::copy_from_slice(&buffer[..len]));
                        }
                        Err(err) => {
                            warn!("Log stream for runner {runner_id} broke: {err:?}");
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!("No log stream for runner {runner_id}: {err:?}"),
        }

        let code = self.backend.wait(handle).await?;

        let log_key = self.state.log_key(runner_id);
        let log_ref = match logs::persist(self.state.store.as_ref(), &log_key, &collected).await {
            Ok(()) => Some(log_key.as_str()),
            Err(err) => {
                error!("Failed to persist log for runner {runner_id}: {err:?}");
                None
            }
        };

        let status = if code == 0 {
            RunnerStatus::Success
        } else {
            RunnerStatus::Failed
        };

        self.state
            .runner_finished(runner_id, status, log_ref)
            .await?;

        self.logs.close(runner_id);
        self.handles.lock().await.remove(&runner_id);

        info!(runner = runner_id, code, "Runner finished");

        Ok(())
    }

    async fn stop(&self, runner_id: u32) -> Result<()> {
        // Mark stopped first so the watcher's terminal update loses
        self.state.runner_stopped(runner_id).await?;

        let handle = self.handles.lock().await.get(&runner_id).copied();
        match handle {
            Some(handle) => self.backend.stop(handle).await?,
            None => info!("Stop for runner {runner_id} with no live handle"),
        }

        Ok(())
    }
}

#[async_trait]
impl TaskHandler for Arc<Dispatcher> {
    async fn handle(&self, payload: TaskPayload) -> Result<()> {
        match payload {
            TaskPayload::BuilderStart { builder_id, .. } => self.start(builder_id).await,
            TaskPayload::BuilderStop { runner_id, .. } => self.stop(runner_id).await,
            other => {
                warn!("Builder dispatcher got unexpected payload {other:?}");
                Ok(())
            }
        }
    }
}
