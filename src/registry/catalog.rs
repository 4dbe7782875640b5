use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::context::RequestContext;
use crate::error::RegistryError;
use crate::state::RegistryState;

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    last: Option<String>,
    n: Option<usize>,
}

const DEFAULT_PAGE: usize = 100;

pub(crate) async fn get(
    Query(CatalogQuery { last, n }): Query<CatalogQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    let n = n.unwrap_or(DEFAULT_PAGE);

    // Anonymous callers may browse public repositories only
    let public_only = !context.admin;

    let repositories = registry
        .list_repositories(n + 1, last.as_deref(), public_only)
        .await?;

    let has_more = repositories.len() > n;
    let repositories = &repositories[..repositories.len().min(n)];

    let body = json!({ "repositories": repositories }).to_string();

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json");

    let builder = if has_more {
        match repositories.last() {
            Some(final_name) => builder.header(
                "Link",
                format!("/v2/_catalog?n={n}&last={final_name}; rel=\"next\""),
            ),
            None => builder,
        }
    } else {
        builder
    };

    Ok(builder.body(Body::from(body))?)
}
