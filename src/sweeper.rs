//! Sweep for idle upload sessions.
//!
//! Sessions abandoned by clients are cancelled after the configured TTL:
//! the native multipart upload is aborted and the session rows dropped.
//! Runs on the leader only.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::shutdown::Broadcast;
use crate::state::RegistryState;

pub async fn sweep_stale_uploads(state: &Arc<RegistryState>) -> Result<usize> {
    let ttl = state.config.uploads.session_ttl.as_secs();

    let stale = state.stale_upload_sessions(ttl).await?;
    let mut swept = 0;

    for session in stale {
        info!(
            upload_id = %session.upload_id,
            repository = %session.repository,
            "Sweeping idle upload session"
        );

        let staging_key = state.upload_key(&session.file_id);
        if let Err(err) = state
            .store
            .abort_multipart(&staging_key, &session.native_id)
            .await
        {
            warn!(
                "Failed to abort multipart for {}: {err:?}",
                session.upload_id
            );
            continue;
        }

        state.delete_upload_session(&session.upload_id).await?;
        state.release_upload_lock(&session.upload_id);
        swept += 1;
    }

    Ok(swept)
}

pub fn start(
    tasks: &mut JoinSet<Result<()>>,
    state: Arc<RegistryState>,
    leader: watch::Receiver<bool>,
    mut broadcasts: broadcast::Receiver<Broadcast>,
) {
    tasks.spawn(async move {
        let interval = state.config.uploads.sweep_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !*leader.borrow() {
                        continue;
                    }

                    match sweep_stale_uploads(&state).await {
                        Ok(0) => {}
                        Ok(swept) => info!("Swept {swept} idle upload sessions"),
                        Err(err) => warn!("Upload sweep failed: {err:?}"),
                    }
                }
                Ok(Broadcast::Shutdown) = broadcasts.recv() => {
                    info!("Upload sweeper: graceful shutdown");
                    break;
                }
            }
        }

        Ok(())
    });
}
