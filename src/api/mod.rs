//! Management HTTP surface under `/api/v1/`.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::state::RegistryState;

mod builders;
mod caches;
mod gc;
mod runners;
mod system;

pub fn router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route(
            "/api/v1/repositories/{repository_id}/builders",
            post(builders::create),
        )
        .route(
            "/api/v1/repositories/{repository_id}/builders/{builder_id}",
            get(builders::show)
                .put(builders::update)
                .delete(builders::destroy),
        )
        .route(
            "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners",
            get(runners::list),
        )
        .route(
            "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/run",
            post(runners::run),
        )
        .route(
            "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/{runner_id}",
            get(runners::show),
        )
        .route(
            "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/{runner_id}/stop",
            post(runners::stop),
        )
        .route(
            "/api/v1/repositories/{repository_id}/builders/{builder_id}/runners/{runner_id}/log",
            get(runners::log),
        )
        .route(
            "/api/v1/caches/{builder_id}",
            put(caches::put).get(caches::get).delete(caches::delete),
        )
        .route(
            "/api/v1/namespaces/{namespace}/gc/{variant}/rule",
            put(gc::upsert_rule).get(gc::show_rule).delete(gc::delete_rule),
        )
        .route(
            "/api/v1/namespaces/{namespace}/gc/{variant}/run",
            post(gc::run),
        )
        .route(
            "/api/v1/namespaces/{namespace}/gc/{variant}/runners",
            get(gc::list_runners),
        )
        .route(
            "/api/v1/namespaces/{namespace}/gc/{variant}/runners/{runner_id}/records",
            get(gc::list_records),
        )
        .route("/api/v1/validators/cron", post(system::validate_cron))
        .route("/api/v1/system/version", get(system::version))
        .route("/api/v1/system/endpoint", get(system::endpoint))
        .with_state(state)
}
