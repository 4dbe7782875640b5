//! vessel: an OCI distribution registry with an integrated build plane.
//!
//! The registry core serves the Distribution v2 surface backed by an object
//! store and an embedded replicated metadata store; the build plane drives
//! builder runners through a work queue, scheduler and leader election.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use hiqlite::cache_idx::CacheIndex;
use hiqlite_macros::embed::*;
use prometheus_client::registry::Registry;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub(crate) mod api;
pub(crate) mod builder;
pub mod config;
pub(crate) mod context;
pub(crate) mod cron;
pub(crate) mod digest;
pub(crate) mod error;
pub(crate) mod garbage;
pub(crate) mod leader;
pub(crate) mod manifest;
pub(crate) mod metrics;
pub(crate) mod notify;
pub(crate) mod proxy;
pub(crate) mod queue;
pub(crate) mod registry;
pub(crate) mod scheduler;
pub(crate) mod shutdown;
pub(crate) mod state;
pub(crate) mod storage;
pub(crate) mod sweeper;
pub(crate) mod webhook;


use crate::builder::Dispatcher;
use crate::builder::backend::ProcessBackend;
use crate::config::{Configuration, StorageConfig};
use crate::garbage::GcHandler;
use crate::shutdown::{Broadcast, ShutdownRegistry};
use crate::state::RegistryState;
use crate::storage::{FilesystemStore, ObjectStore, s3::S3Store};
use crate::webhook::{WebhookRelay, WebhookService};

#[derive(Embed)]
#[folder = "migrations"]
pub struct Migrations;

/// Cache namespaces of the embedded metadata store.
#[derive(Debug, strum::EnumIter)]
pub enum Cache {
    Sessions,
}

impl CacheIndex for Cache {
    fn to_usize(self) -> usize {
        self as usize
    }
}

fn build_store(config: &Configuration) -> Result<Arc<dyn ObjectStore>> {
    Ok(match &config.storage {
        StorageConfig::Filesystem { path } => Arc::new(FilesystemStore::new(path.relative())),
        s3 @ StorageConfig::S3 { .. } => {
            Arc::new(S3Store::new(s3).context("Invalid S3 storage config")?)
        }
    })
}

pub async fn launch(config: Configuration) -> Result<()> {
    let node_id = config.node_id;

    let mut prometheus = Registry::with_prefix("vessel");
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let (broadcaster, _) = broadcast::channel::<Broadcast>(16);

    let webhooks = WebhookService::start(&mut tasks, config.webhooks.clone(), &mut prometheus);

    let client = hiqlite::start_node_with_cache::<Cache>(config.clone().try_into()?)
        .await
        .context("Failed to start metadata store node")?;

    client.wait_until_healthy_db().await;
    client
        .migrate::<Migrations>()
        .await
        .context("Failed to run metadata migrations")?;

    let store = build_store(&config)?;

    let state = Arc::new(RegistryState::new(
        node_id,
        config.clone(),
        client,
        store,
        webhooks,
    ));

    // Leader-gated background plane
    let leadership = leader::start(&mut tasks, state.clone(), broadcaster.subscribe());
    scheduler::start(
        &mut tasks,
        state.clone(),
        leadership.clone(),
        broadcaster.subscribe(),
    );
    sweeper::start(
        &mut tasks,
        state.clone(),
        leadership,
        broadcaster.subscribe(),
    );

    // Work queue consumers
    queue::consume(
        &mut tasks,
        state.clone(),
        queue::TOPIC_GC,
        Arc::new(GcHandler::new(state.clone())),
        broadcaster.subscribe(),
    );

    let dispatcher = Dispatcher::new(
        state.clone(),
        ProcessBackend::new(),
        state.logs.clone(),
    );
    queue::consume(
        &mut tasks,
        state.clone(),
        queue::TOPIC_BUILDER,
        Arc::new(dispatcher),
        broadcaster.subscribe(),
    );

    queue::consume(
        &mut tasks,
        state.clone(),
        queue::TOPIC_ARTIFACT_PUSHED,
        Arc::new(WebhookRelay::new(state.clone())),
        broadcaster.subscribe(),
    );

    // HTTP surfaces: registry + management on the registry address,
    // metrics on its own port
    let http_metrics = metrics::HttpMetrics::new(&mut prometheus);

    let app = axum::Router::new()
        .merge(registry::router(state.clone()))
        .merge(api::router(state.clone()))
        .layer(registry::RewriteUriLayer)
        .layer(http_metrics)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::request_id::SetRequestIdLayer::x_request_id(
            tower_http::request_id::MakeRequestUuid,
        ));

    let registry_addr = config
        .nodes
        .iter()
        .find(|node| node.id == node_id)
        .map(|node| node.addr_registry.clone())
        .context("This node is not in the nodes list")?;

    let listener = tokio::net::TcpListener::bind(&registry_addr)
        .await
        .with_context(|| format!("Could not bind registry address {registry_addr}"))?;

    info!("Registry listening on {registry_addr}");

    let mut http_shutdown = broadcaster.subscribe();
    tasks.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
            .context("Registry server failed")
    });

    let metrics_addr = format!(
        "{}:{}",
        config.prometheus.address, config.prometheus.port
    );
    let metrics_app = metrics::router(Arc::new(Mutex::new(prometheus)));
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("Could not bind metrics address {metrics_addr}"))?;

    let mut metrics_shutdown = broadcaster.subscribe();
    tasks.spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.recv().await;
            })
            .await
            .context("Metrics server failed")
    });

    // Wait for ctrl-c, then drain everything under one deadline
    tokio::signal::ctrl_c()
        .await
        .context("Unable to listen for shutdown signal")?;

    info!("Shutting down");

    if broadcaster.send(Broadcast::Shutdown).is_err() {
        warn!("No subsystems were listening for shutdown");
    }

    let mut drain = ShutdownRegistry::new(Duration::from_secs(30));

    drain.register(10, "background tasks", async move {
        // Give subsystems a moment to observe the broadcast, then reap
        tokio::time::sleep(Duration::from_millis(500)).await;
        tasks.shutdown().await;
        Ok(())
    });

    let drain_state = state.clone();
    drain.register(20, "metadata store", async move {
        drain_state.shutdown().await
    });

    drain.drain().await;

    Ok(())
}
