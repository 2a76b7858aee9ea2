// housekeeper/src/health/mod.rs
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READY: &str = "ready\n";
const NOT_READY: &str = "not ready\n";
const CHECK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotReady,
    Ready,
}

impl State {
    fn reply(self) -> &'static str {
        match self {
            State::NotReady => NOT_READY,
            State::Ready => READY,
        }
    }
}

/// Shared readiness flag. Starts out not ready.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set(&self, state: State) {
        self.0.store(state == State::Ready, Ordering::SeqCst);
    }

    pub fn state(&self) -> State {
        if self.0.load(Ordering::SeqCst) {
            State::Ready
        } else {
            State::NotReady
        }
    }
}

/// Answers every connection on a Unix socket with the current readiness.
/// The socket file is removed again when the server is dropped.
pub struct HealthServer {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl HealthServer {
    pub fn start(path: &Path, readiness: Readiness) -> Result<Self> {
        // a previous process may have left its socket behind
        match fs::remove_file(path) {
            Ok(()) => debug!(socket = %path.display(), "Removed stale health check socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale socket {}", path.display())
                });
            }
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to create socket {}", path.display()))?;
        info!(socket = %path.display(), "Health check listening");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _)) => {
                        let reply = readiness.state().reply();
                        tokio::spawn(async move {
                            if let Err(e) = stream.write_all(reply.as_bytes()).await {
                                debug!(error = %e, "Health check client went away");
                            }
                            let _ = stream.shutdown().await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept health check connection"),
                }
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            task,
        })
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = fs::remove_file(&self.path);
    }
}

/// Asks the server listening on `path` whether it is ready.
pub async fn healthcheck(path: &Path) -> Result<()> {
    let reply = tokio::time::timeout(CHECK_TIMEOUT, async {
        let mut stream = UnixStream::connect(path).await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok::<_, io::Error>(reply)
    })
    .await
    .context("Health check timed out")?
    .with_context(|| format!("Failed to query {}", path.display()))?;

    if reply != READY {
        anyhow::bail!("housekeeper not ready");
    }
    Ok(())
}
