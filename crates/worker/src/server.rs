//! Unix socket accept loop.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::WorkerError;
use crate::connection::serve_connection;
use crate::service::TransferService;

/// Listens on a Unix domain socket and serves every connection.
pub struct WorkerServer {
    socket_path: PathBuf,
    service: Arc<TransferService>,
    cancel: CancellationToken,
}

impl WorkerServer {
    pub fn new(socket_path: PathBuf, service: Arc<TransferService>, cancel: CancellationToken) -> Self {
        Self {
            socket_path,
            service,
            cancel,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops the accept loop and all connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs until cancellation. A stale socket file is replaced on start and
    /// the socket file is removed on exit.
    pub async fn run(&self) -> Result<(), WorkerError> {
        remove_socket(&self.socket_path)?;
        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "worker listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("worker shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            tracing::debug!("client connected");
                            tokio::spawn(serve_connection(
                                stream,
                                Arc::clone(&self.service),
                                self.cancel.child_token(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        if let Err(e) = remove_socket(&self.socket_path) {
            tracing::warn!(socket = %self.socket_path.display(), "failed to remove socket: {e}");
        }
        Ok(())
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketcache_storage::MemoryStore;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn serves_and_cleans_up_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("worker.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let service = Arc::new(TransferService::new(Arc::new(MemoryStore::new()), 1, 1));
        let server = Arc::new(WorkerServer::new(socket.clone(), service, CancellationToken::new()));
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        let stream = loop {
            match UnixStream::connect(&socket).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        let (read, mut write) = stream.into_split();
        write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"S3Service.Ping\",\"params\":[{}],\"id\":42}\n")
            .await
            .unwrap();
        let line = BufReader::new(read).lines().next_line().await.unwrap().unwrap();
        assert!(line.contains("\"id\":42"));
        assert!(line.contains("Pong"));

        server.shutdown();
        running.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
