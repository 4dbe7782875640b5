//! Client for a proxied upstream registry.
//!
//! Speaks OCI Distribution v2 against the configured upstream, handling the
//! token dance on 401 and retrying transient failures with backoff. Blob
//! descriptors are cached briefly in memory to absorb repeat HEAD probes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::digest::Digest;

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamDescriptor {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct ProxyClient {
    config: ProxyConfig,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
    descriptors: Mutex<HashMap<String, (UpstreamDescriptor, Instant)>>,
}

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(100).factor(2).take(3)
}

/// Pull the realm, service and scope parameters out of a Www-Authenticate
/// challenge.
fn parse_challenge(header: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    let Some(rest) = header.strip_prefix("Bearer ") else {
        return params;
    };

    for part in rest.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }

    params
}

impl ProxyClient {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .user_agent("vessel/proxy")
                .build()
                .expect("reqwest client"),
            token: Mutex::new(None),
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, repository: &str, kind: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/{}/{}",
            self.config.url.trim_end_matches('/'),
            repository,
            kind,
            reference
        )
    }

    async fn fetch_token(&self, challenge: &str, repository: &str) -> Result<String> {
        let params = parse_challenge(challenge);

        let realm = params
            .get("realm")
            .context("Challenge without realm")?
            .clone();

        let mut request = self.client.get(&realm).query(&[
            ("service", params.get("service").cloned().unwrap_or_default()),
            ("scope", format!("repository:{repository}:pull")),
        ]);

        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let resp = request.send().await.context("Token endpoint unreachable")?;
        if !resp.status().is_success() {
            bail!("Token endpoint refused: {}", resp.status());
        }

        let body: TokenResponse = resp.json().await.context("Undecodable token response")?;
        let token = body
            .token
            .or(body.access_token)
            .context("Token response carried no token")?;

        debug!("Fetched upstream token for {repository}");

        Ok(token)
    }

    /// Issue a request, transparently acquiring a bearer token when the
    /// upstream challenges, and retrying transient transport failures.
    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        repository: &str,
    ) -> Result<reqwest::Response> {
        let resp = Retry::spawn(retry_strategy(), || async {
            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = self.token.lock().expect("poisoned token").clone() {
                request = request.bearer_auth(token);
            }
            request.send().await
        })
        .await
        .context("Upstream unreachable")?;

        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .context("401 without a challenge")?
            .to_string();

        let token = self.fetch_token(&challenge, repository).await?;
        *self.token.lock().expect("poisoned token") = Some(token.clone());

        let resp = Retry::spawn(retry_strategy(), || async {
            self.client
                .request(method.clone(), url)
                .bearer_auth(&token)
                .send()
                .await
        })
        .await
        .context("Upstream unreachable after auth")?;

        Ok(resp)
    }

    fn cached_descriptor(&self, digest: &Digest) -> Option<UpstreamDescriptor> {
        let cache = self.descriptors.lock().expect("poisoned descriptor cache");
        cache.get(&digest.to_string()).and_then(|(descriptor, at)| {
            (at.elapsed() < self.config.cache_ttl).then(|| descriptor.clone())
        })
    }

    fn cache_descriptor(&self, descriptor: &UpstreamDescriptor) {
        let mut cache = self.descriptors.lock().expect("poisoned descriptor cache");

        // Keep the cache bounded; it only needs to absorb repeat probes
        if cache.len() > 4096 {
            cache.retain(|_, (_, at)| at.elapsed() < self.config.cache_ttl);
        }

        cache.insert(
            descriptor.digest.to_string(),
            (descriptor.clone(), Instant::now()),
        );
    }

    pub async fn head_blob(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<Option<UpstreamDescriptor>> {
        if let Some(descriptor) = self.cached_descriptor(digest) {
            return Ok(Some(descriptor));
        }

        let url = self.url(repository, "blobs", &digest.to_string());
        let resp = self.send(reqwest::Method::HEAD, &url, repository).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("Upstream blob head failed: {}", resp.status());
        }

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let media_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let descriptor = UpstreamDescriptor {
            digest: digest.clone(),
            media_type,
            size,
        };
        self.cache_descriptor(&descriptor);

        Ok(Some(descriptor))
    }

    /// Blob bytes as a stream, straight through from upstream.
    pub async fn get_blob(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<Option<(UpstreamDescriptor, reqwest::Response)>> {
        let url = self.url(repository, "blobs", &digest.to_string());
        let resp = self.send(reqwest::Method::GET, &url, repository).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("Upstream blob fetch failed: {}", resp.status());
        }

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let media_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let descriptor = UpstreamDescriptor {
            digest: digest.clone(),
            media_type,
            size,
        };
        self.cache_descriptor(&descriptor);

        Ok(Some((descriptor, resp)))
    }

    /// Fetch a manifest by tag or digest. Returns the raw bytes, the media
    /// type, and the digest of what was actually served.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<(Bytes, String, Digest)>> {
        let url = self.url(repository, "manifests", reference);

        let resp = Retry::spawn(retry_strategy(), || async {
            let mut request = self
                .client
                .get(&url)
                .header(
                    "Accept",
                    "application/vnd.docker.distribution.manifest.v2+json, \
                     application/vnd.docker.distribution.manifest.list.v2+json, \
                     application/vnd.oci.image.manifest.v1+json, \
                     application/vnd.oci.image.index.v1+json",
                );
            if let Some(token) = self.token.lock().expect("poisoned token").clone() {
                request = request.bearer_auth(token);
            }
            request.send().await
        })
        .await
        .context("Upstream unreachable")?;

        let resp = if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .context("401 without a challenge")?
                .to_string();

            let token = self.fetch_token(&challenge, repository).await?;
            *self.token.lock().expect("poisoned token") = Some(token.clone());

            self.client
                .get(&url)
                .header(
                    "Accept",
                    "application/vnd.docker.distribution.manifest.v2+json, \
                     application/vnd.docker.distribution.manifest.list.v2+json, \
                     application/vnd.oci.image.manifest.v1+json, \
                     application/vnd.oci.image.index.v1+json",
                )
                .bearer_auth(&token)
                .send()
                .await
                .context("Upstream unreachable after auth")?
        } else {
            resp
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("Upstream manifest fetch failed: {}", resp.status());
        }

        let media_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
            .to_string();

        let body = resp.bytes().await.context("Upstream body truncated")?;
        let digest = Digest::of_bytes(&body);

        info!("Proxied manifest {repository}:{reference} ({} bytes)", body.len());

        Ok(Some((body, media_type, digest)))
    }
}
