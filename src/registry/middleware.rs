use std::sync::LazyLock;
use std::task::{Context, Poll};

use axum::http::{Request, Response, Uri};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::{Captures, Regex};
use tower::Service;

static REPOSITORY_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^/v2/)(.+)(/(manifests|blobs|tags|referrers).*$)").unwrap()
});

/// Repository names contain slashes, which axum's router cannot capture in
/// one segment. Percent-encode the repository portion of /v2/ paths before
/// routing so `{repository}` matches it whole.
#[derive(Clone)]
pub(crate) struct RewriteUriLayer;

impl<S> tower::Layer<S> for RewriteUriLayer {
    type Service = RewriteUriService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RewriteUriService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct RewriteUriService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RewriteUriService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let uri = req.uri();
        let path = uri.path().to_string();

        let result = REPOSITORY_SEGMENT.replace(&path, |caps: &Captures| {
            let prefix = &caps[1];
            let encoded = utf8_percent_encode(&caps[2], NON_ALPHANUMERIC).to_string();
            let suffix = &caps[3];

            format!("{prefix}{encoded}{suffix}")
        });

        let rewritten = match uri.query() {
            Some(query) => format!("{result}?{query}"),
            None => result.to_string(),
        };

        if let Ok(new_uri) = rewritten.parse::<Uri>() {
            *req.uri_mut() = new_uri;
        }

        self.inner.call(req)
    }
}
