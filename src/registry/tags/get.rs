use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::context::RequestContext;
use crate::error::RegistryError;
use crate::state::RegistryState;

#[derive(Debug, Deserialize)]
pub struct TagList {
    repository: String,
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    last: Option<String>,
    n: Option<usize>,
}

pub(crate) async fn get(
    Path(TagList { repository }): Path<TagList>,
    Query(TagQuery { last, n }): Query<TagQuery>,
    State(registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    if !context.validated_token {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.get_pull_challenge(&repository),
        });
    }

    if !context.has_permission(&repository, "pull") {
        return Err(RegistryError::AccessDenied {});
    }

    if !registry.repository_exists(&repository).await? {
        return Err(RegistryError::RepositoryNotFound {});
    }

    let mut tags = registry.get_tags(&repository).await?;

    if let Some(last) = &last {
        // Names are sorted; resume strictly after the marker
        tags.retain(|tag| tag > last);
    }

    let mut include_link = false;

    if let Some(n) = n {
        if n < tags.len() {
            include_link = true;
        }
        tags.truncate(n);
    }

    let body = json!(
        {
            "name": repository.clone(),
            "tags": tags,
        }
    )
    .to_string();

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json");

    let builder = if include_link {
        let mut fragments = vec![];

        if let Some(n) = n {
            fragments.push(format!("n={n}"))
        }

        if let Some(tag) = tags.last() {
            fragments.push(format!("last={tag}"))
        }

        let suffix = if !fragments.is_empty() {
            let joined = fragments.join("&");
            format!("?{joined}")
        } else {
            "".to_string()
        };

        builder.header(
            "Link",
            format!("/v2/{}/tags/list{}; rel=\"next\"", repository, suffix),
        )
    } else {
        builder
    };

    Ok(builder.body(Body::from(body))?)
}
