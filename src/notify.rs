use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Cluster notifications published through the metadata store's
/// listen/notify channel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Notification {
    Tick,
    ArtifactAdded {
        node: u64,
        digest: Digest,
        repository: String,
    },
    BlobAdded {
        node: u64,
        digest: Digest,
        repository: String,
    },
}
