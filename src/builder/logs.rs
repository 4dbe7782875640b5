//! Build log fan-out and persistence.
//!
//! While a runner is live its output is fanned out over a broadcast channel
//! so followers can attach mid-run; a lagging follower loses the oldest
//! buffered chunks rather than ever blocking the writer. After completion
//! the full log is stored gzip-compressed in the object store.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;

use crate::storage::{ObjectStore, stream_of};

const CHANNEL_CAPACITY: usize = 1024;

/// Registry of live log channels keyed by runner id.
pub struct LogHub {
    channels: Mutex<HashMap<u32, broadcast::Sender<Bytes>>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open the channel for a starting runner. The watcher is the only
    /// writer.
    pub fn open(&self, runner_id: u32) -> broadcast::Sender<Bytes> {
        let mut channels = self.channels.lock().expect("poisoned log hub");
        channels
            .entry(runner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Attach to a live runner. None when the runner is not streaming,
    /// which callers resolve through the stored log instead.
    pub fn subscribe(&self, runner_id: u32) -> Option<broadcast::Receiver<Bytes>> {
        let channels = self.channels.lock().expect("poisoned log hub");
        channels.get(&runner_id).map(|tx| tx.subscribe())
    }

    pub fn close(&self, runner_id: u32) {
        let mut channels = self.channels.lock().expect("poisoned log hub");
        channels.remove(&runner_id);
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Compress a finished log and put it at its long-term key.
pub async fn persist(store: &dyn ObjectStore, key: &str, raw: &[u8]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).context("Failed to compress log")?;
    let compressed = encoder.finish().context("Failed to finish log compression")?;

    store
        .upload(key, stream_of(compressed))
        .await
        .context("Failed to store log")?;

    Ok(())
}

/// Fetch and decompress a stored log.
pub async fn load(store: &dyn ObjectStore, key: &str) -> Result<Vec<u8>> {
    let mut reader = store.reader(key).await.context("Log not stored")?;

    let mut compressed = Vec::new();
    reader
        .read_to_end(&mut compressed)
        .await
        .context("Failed to read stored log")?;

    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut raw)
        .context("Stored log is not valid gzip")?;

    Ok(raw)
}
