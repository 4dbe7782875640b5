//! Leader election over a shared lease row.
//!
//! One replica at a time runs scheduler ticks, sweeps and GC. Identity is
//! hostname plus a random suffix; the lease is renewed well inside its TTL
//! and surrendered on shutdown. Consumers watch a bool channel and must back
//! off promptly when it flips false.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hiqlite_macros::params;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::shutdown::Broadcast;
use crate::state::RegistryState;

pub const LEASE_NAME: &str = "scheduler";

pub fn identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let suffix: u32 = rand::rng().random();

    format!("{host}-{suffix:08x}")
}

/// One acquire-or-renew round. The conditional upsert succeeds when we
/// already hold the lease or the previous holder let it expire.
async fn try_acquire(state: &RegistryState, identity: &str) -> Result<bool> {
    let lease_secs = state.config.leader.lease.as_secs();

    state
        .client
        .execute(
            "INSERT INTO leases(name, holder, expires_at)
             VALUES ($1, $2, datetime('now', '+' || $3 || ' seconds'))
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
             WHERE leases.holder = excluded.holder
                OR leases.expires_at < datetime('now');",
            params!(LEASE_NAME, identity, lease_secs as i64),
        )
        .await?;

    let holder: Option<String> = state
        .client
        .query_as_optional(
            "SELECT holder FROM leases WHERE name = $1;",
            params!(LEASE_NAME),
        )
        .await?;

    Ok(holder.as_deref() == Some(identity))
}

async fn release(state: &RegistryState, identity: &str) {
    if let Err(err) = state
        .client
        .execute(
            "DELETE FROM leases WHERE name = $1 AND holder = $2;",
            params!(LEASE_NAME, identity),
        )
        .await
    {
        warn!("Failed to release leadership lease: {err:?}");
    }
}

/// Spawn the election loop. The returned channel reads true exactly while
/// this replica holds the lease.
pub fn start(
    tasks: &mut JoinSet<Result<()>>,
    state: Arc<RegistryState>,
    mut broadcasts: broadcast::Receiver<Broadcast>,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let identity = identity();

    tasks.spawn(async move {
        let retry_period = state.config.leader.retry_period;
        let renew_deadline = state.config.leader.renew_deadline;

        let mut last_renewal: Option<Instant> = None;

        info!("Leader election started as {identity}");

        loop {
            match try_acquire(&state, &identity).await {
                Ok(true) => {
                    if !tx.send_replace(true) {
                        info!("Acquired leadership lease as {identity}");
                    }
                    last_renewal = Some(Instant::now());
                }
                Ok(false) => {
                    if tx.send_replace(false) {
                        info!("Lost leadership lease");
                    }
                    last_renewal = None;
                }
                Err(err) => {
                    debug!("Lease renewal attempt failed: {err:?}");

                    // Step down once renewal has failed past the deadline
                    if let Some(last) = last_renewal {
                        if last.elapsed() > renew_deadline && tx.send_replace(false) {
                            warn!("Renewal deadline passed; stepping down");
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry_period) => {},
                Ok(Broadcast::Shutdown) = broadcasts.recv() => {
                    info!("Leader election: graceful shutdown");
                    break;
                }
            }
        }

        if *tx.borrow() {
            release(&state, &identity).await;
        }
        tx.send_replace(false);

        Ok(())
    });

    rx
}
