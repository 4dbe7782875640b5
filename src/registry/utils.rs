use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::body::BodyDataStream;
use futures_util::{StreamExt, TryStreamExt};
use regex::Regex;
use tokio::io::AsyncReadExt;

use crate::digest::{Digest, Hasher};
use crate::error::RegistryError;
use crate::storage::{ByteStream, ObjectStore};

/// Repository names are lowercase path segments; the leading segment is the
/// namespace and is always required.
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)+$").unwrap()
});

pub(crate) fn validate_name(repository: &str) -> Result<(), RegistryError> {
    if NAME_RE.is_match(repository) {
        Ok(())
    } else {
        Err(RegistryError::NameInvalid {})
    }
}

/// Adapt an inbound request body into the object store's stream type.
pub(crate) fn body_stream(body: BodyDataStream) -> ByteStream {
    body.map_err(std::io::Error::other).boxed()
}

/// Stream a stored object through sha256.
pub(crate) async fn digest_of_object(store: &dyn ObjectStore, key: &str) -> Result<Digest> {
    let mut reader = store
        .reader(key)
        .await
        .context("Could not open object for verification")?;

    let mut hasher = Hasher::new();
    let mut buffer = [0; 65536];

    loop {
        let len = reader
            .read(&mut buffer)
            .await
            .context("Failed reading object for verification")?;
        if len == 0 {
            break;
        }
        hasher.update(&buffer[..len]);
    }

    Ok(hasher.finish())
}
