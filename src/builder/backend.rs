//! Runner backends.
//!
//! The dispatcher talks to runner infrastructure through [`RunnerBackend`];
//! the in-tree implementation launches local processes, with Docker or
//! Kubernetes jobs being alternative implementations of the same trait.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Opaque identifier for a launched runner.
pub type RunnerHandle = u64;

#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub name: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait RunnerBackend: Send + Sync {
    async fn start(&self, spec: RunnerSpec) -> Result<RunnerHandle>;

    async fn stop(&self, handle: RunnerHandle) -> Result<()>;

    /// Live output of the runner. Single consumer; the dispatcher's watcher
    /// takes it and fans it out.
    async fn log_stream(
        &self,
        handle: RunnerHandle,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Block until the runner exits and return its exit code.
    async fn wait(&self, handle: RunnerHandle) -> Result<i32>;
}

struct ProcessEntry {
    kill: mpsc::Sender<()>,
    done: watch::Receiver<Option<i32>>,
    logs: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// Runs each runner as a local child process. Build environment travels in
/// the process environment exactly as a container backend would inject it.
pub struct ProcessBackend {
    entries: Mutex<HashMap<RunnerHandle, ProcessEntry>>,
    next_handle: AtomicU64,
}

impl ProcessBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(mut from: R, tx: mpsc::Sender<std::io::Result<Bytes>>) {
    let mut buffer = [0u8; 8192];
    loop {
        match from.read(&mut buffer).await {
            Ok(0) => break,
            Ok(len) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buffer[..len]))).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
}

#[async_trait]
impl RunnerBackend for ProcessBackend {
    async fn start(&self, spec: RunnerSpec) -> Result<RunnerHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .context("Runner command must not be empty")?;

        let mut child = Command::new(program)
            .args(args)
            .envs(spec.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch runner {}", spec.name))?;

        let (log_tx, log_rx) = mpsc::channel::<std::io::Result<Bytes>>(256);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, log_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, log_tx));
        }

        let (done_tx, done_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        let name = spec.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(err) => {
                            warn!("Failed waiting on runner {name}: {err:?}");
                            -1
                        }
                    };
                    debug!("Runner {name} exited with {code}");
                    done_tx.send_replace(Some(code));
                }
                Some(()) = kill_rx.recv() => {
                    if let Err(err) = child.kill().await {
                        warn!("Failed to kill runner {name}: {err:?}");
                    }
                    done_tx.send_replace(Some(-1));
                }
            }
        });

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().await.insert(
            handle,
            ProcessEntry {
                kill: kill_tx,
                done: done_rx,
                logs: Some(Box::new(StreamReader::new(ReceiverStream::new(log_rx)))),
            },
        );

        Ok(handle)
    }

    async fn stop(&self, handle: RunnerHandle) -> Result<()> {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(&handle) else {
            bail!("Unknown runner handle {handle}");
        };

        let _ = entry.kill.send(()).await;

        Ok(())
    }

    async fn log_stream(
        &self,
        handle: RunnerHandle,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&handle) else {
            bail!("Unknown runner handle {handle}");
        };

        entry
            .logs
            .take()
            .context("Log stream was already claimed")
    }

    async fn wait(&self, handle: RunnerHandle) -> Result<i32> {
        let mut done = {
            let entries = self.entries.lock().await;
            let Some(entry) = entries.get(&handle) else {
                bail!("Unknown runner handle {handle}");
            };
            entry.done.clone()
        };

        let code = *done
            .wait_for(Option::is_some)
            .await
            .context("Runner supervisor went away")?;

        self.entries.lock().await.remove(&handle);

        Ok(code.unwrap_or(-1))
    }
}
