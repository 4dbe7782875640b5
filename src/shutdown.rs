//! Graceful shutdown coordination.
//!
//! Subsystems subscribe to a broadcast channel and drain when Shutdown
//! arrives. Final teardown steps register with the [`ShutdownRegistry`] and
//! run in priority order under one deadline; a failing item is logged and
//! the rest still run.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub enum Broadcast {
    Shutdown,
}

type ShutdownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct ShutdownItem {
    priority: u32,
    name: &'static str,
    action: ShutdownFuture,
}

pub struct ShutdownRegistry {
    deadline: Duration,
    items: Vec<ShutdownItem>,
}

impl ShutdownRegistry {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            items: vec![],
        }
    }

    /// Lower priorities run first.
    pub fn register<F>(&mut self, priority: u32, name: &'static str, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.items.push(ShutdownItem {
            priority,
            name,
            action: Box::pin(action),
        });
    }

    /// Run every registered item sequentially. After the deadline the
    /// process gives up on whatever remains.
    pub async fn drain(mut self) {
        self.items.sort_by_key(|item| item.priority);

        let work = async {
            for item in self.items {
                info!("Shutdown: {}", item.name);
                if let Err(err) = item.action.await {
                    error!("Shutdown item {} failed: {err:?}", item.name);
                }
            }
        };

        if tokio::time::timeout(self.deadline, work).await.is_err() {
            warn!("Shutdown deadline passed with items remaining");
        }
    }
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
