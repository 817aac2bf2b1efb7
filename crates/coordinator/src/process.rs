//! Worker process lifecycle.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bucketcache_protocol::constants::{PONG, PROBE_INTERVAL, STARTUP_TIMEOUT, WORKER_CONFIG_ENV};
use bucketcache_protocol::messages::{
    DownloadParams, DownloadResult, PingParams, PingResult, UploadParams, UploadResult,
};
use bucketcache_protocol::{Method, WorkerConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::client::RpcClient;
use crate::config::CacheConfig;
use crate::{CallFuture, CoordinatorError, TransferClient};

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unstarted,
    Starting,
    Ready,
    Stopped,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Unstarted => "unstarted",
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How to launch the worker and how long to wait for it.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub probe_interval: Duration,
    pub startup_timeout: Duration,
}

impl WorkerOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            probe_interval: PROBE_INTERVAL,
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            program: config.worker_program.clone(),
            args: config.worker_args.clone(),
            probe_interval: config.probe_interval(),
            startup_timeout: config.startup_timeout(),
        }
    }
}

/// A fresh socket path in the temp directory, unique per run.
pub fn unique_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("bucketcache-{}.sock", uuid::Uuid::new_v4()))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running worker process and the connection to it.
///
/// Dropping the handle kills the process and removes its socket.
pub struct WorkerHandle {
    socket_path: PathBuf,
    state: Mutex<WorkerState>,
    child: Mutex<Option<Child>>,
    client: RpcClient,
}

impl WorkerHandle {
    /// Spawns the worker and waits until it answers `Ping`.
    ///
    /// `config.socket_path` is replaced by a fresh unique path. If the
    /// process exits first this fails with [`CoordinatorError::WorkerExited`];
    /// if it never answers, with [`CoordinatorError::StartTimeout`]. The
    /// process is killed on failure.
    pub async fn start(options: &WorkerOptions, config: WorkerConfig) -> Result<Self, CoordinatorError> {
        Self::start_at(options, config, unique_socket_path()).await
    }

    pub(crate) async fn start_at(
        options: &WorkerOptions,
        mut config: WorkerConfig,
        socket_path: PathBuf,
    ) -> Result<Self, CoordinatorError> {
        config.socket_path = socket_path.clone();
        let blob = serde_json::to_string(&config)?;

        tracing::debug!(
            program = %options.program.display(),
            socket = %socket_path.display(),
            state = %WorkerState::Starting,
            "spawning worker"
        );
        let mut child = Command::new(&options.program)
            .args(&options.args)
            .env(WORKER_CONFIG_ENV, blob)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        match wait_ready(&mut child, &socket_path, options).await {
            Ok(client) => {
                tracing::info!(
                    socket = %socket_path.display(),
                    pid = ?child.id(),
                    "worker ready"
                );
                Ok(Self {
                    socket_path,
                    state: Mutex::new(WorkerState::Ready),
                    child: Mutex::new(Some(child)),
                    client,
                })
            }
            Err(e) => {
                tracing::warn!(state = %WorkerState::Failed, "worker failed to start: {e}");
                if let Err(kill_err) = child.start_kill() {
                    tracing::debug!("killing worker: {kill_err}");
                }
                let _ = child.wait().await;
                remove_socket(&socket_path);
                Err(e)
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    pub async fn ping(&self) -> Result<PingResult, CoordinatorError> {
        self.call(Method::Ping, &PingParams {}).await
    }

    /// Asks the worker to fetch an object. Failures are logged and returned.
    pub async fn download_file(
        &self,
        params: DownloadParams,
    ) -> Result<DownloadResult, CoordinatorError> {
        let result = self.call(Method::Download, &params).await;
        if let Err(e) = &result {
            tracing::warn!(path = %params.s3_path, "download failed: {e}");
        }
        result
    }

    /// Asks the worker to store a file or directory. Failures are logged and
    /// returned.
    pub async fn upload_file(&self, params: UploadParams) -> Result<UploadResult, CoordinatorError> {
        let result = self.call(Method::Upload, &params).await;
        if let Err(e) = &result {
            tracing::warn!(path = %params.s3_path, "upload failed: {e}");
        }
        result
    }

    /// Kills the worker and removes its socket. In-flight calls fail.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == WorkerState::Stopped {
                return;
            }
            *state = WorkerState::Stopped;
        }
        self.client.close();
        if let Some(mut child) = lock(&self.child).take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("killing worker: {e}");
            }
        }
        remove_socket(&self.socket_path);
        tracing::debug!(socket = %self.socket_path.display(), "worker stopped");
    }

    async fn call<P, R>(&self, method: Method, params: &P) -> Result<R, CoordinatorError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.state() != WorkerState::Ready {
            return Err(CoordinatorError::NotRunning);
        }
        let result = self.client.call(method, params).await;
        if matches!(result, Err(CoordinatorError::ChannelClosed)) {
            let mut state = lock(&self.state);
            if *state == WorkerState::Ready {
                *state = WorkerState::Failed;
            }
        }
        result
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TransferClient for WorkerHandle {
    fn download(&self, params: DownloadParams) -> CallFuture<'_, DownloadResult> {
        Box::pin(self.download_file(params))
    }

    fn upload(&self, params: UploadParams) -> CallFuture<'_, UploadResult> {
        Box::pin(self.upload_file(params))
    }
}

/// Probes the worker until it answers or the deadline passes.
async fn wait_ready(
    child: &mut Child,
    socket_path: &Path,
    options: &WorkerOptions,
) -> Result<RpcClient, CoordinatorError> {
    let deadline = Instant::now() + options.startup_timeout;
    let mut ticker = tokio::time::interval(options.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if let Some(status) = child.try_wait()? {
            return Err(CoordinatorError::WorkerExited {
                code: status.code(),
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoordinatorError::StartTimeout(options.startup_timeout));
        }

        match tokio::time::timeout(remaining, probe(socket_path)).await {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(e)) => tracing::trace!("worker probe failed: {e}"),
            Err(_) => tracing::trace!("worker probe timed out"),
        }
    }
}

async fn probe(socket_path: &Path) -> Result<RpcClient, CoordinatorError> {
    let client = RpcClient::connect(socket_path).await?;
    let pong: PingResult = client.call(Method::Ping, &PingParams {}).await?;
    if pong.message != PONG {
        return Err(CoordinatorError::Rpc {
            code: 0,
            message: format!("unexpected ping reply {:?}", pong.message),
        });
    }
    Ok(client)
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %path.display(), "failed to remove socket: {e}"),
    }
}
