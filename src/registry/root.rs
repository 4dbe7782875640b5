use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    response::Response,
};

use crate::context::RequestContext;
use crate::error::RegistryError;
use crate::state::RegistryState;

/// Version probe. 200 with an empty JSON body for authenticated callers,
/// 401 with a challenge otherwise.
pub(crate) async fn get(
    State(_registry): State<Arc<RegistryState>>,
    context: RequestContext,
) -> Result<Response, RegistryError> {
    if !context.validated_token {
        return Err(RegistryError::MustAuthenticate {
            challenge: context.get_general_challenge(),
        });
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Docker-Distribution-Api-Version", "registry/2.0")
        .body(Body::from("{}"))?)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use test_log::test;

    use crate::tests::RegistryFixture;

    use super::*;

    #[test(tokio::test)]
    pub async fn version_probe() -> Result<()> {
        let fixture = RegistryFixture::new().await?;

        let res = fixture
            .request(Request::builder().uri("/v2/").body(Body::empty())?)
            .await?;

        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"{}");

        fixture.teardown().await
    }
}
