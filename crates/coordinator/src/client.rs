//! JSON-RPC client over the worker socket.
//!
//! One connection carries any number of outstanding calls. Each call parks a
//! oneshot sender in the pending map under its request id; the read pump
//! routes responses back by id. When the connection ends every pending call
//! fails with [`CoordinatorError::ChannelClosed`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bucketcache_protocol::constants::MAX_LINE_LENGTH;
use bucketcache_protocol::{Method, RpcRequest, RpcResponse};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::CoordinatorError;

/// Outgoing request buffer.
const SEND_BUFFER_SIZE: usize = 1024;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<RpcResponse>>,
}

type PendingMap = Arc<Mutex<Pending>>;

/// Multiplexing RPC client for one worker connection.
pub struct RpcClient {
    write_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl RpcClient {
    /// Connects to the worker listening on `socket_path`.
    pub async fn connect(socket_path: &Path) -> Result<Self, CoordinatorError> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already connected stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (sink, lines) = framed.split();
        let (write_tx, write_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let pending = PendingMap::default();
        let cancel = CancellationToken::new();

        let read_handle = tokio::spawn(read_pump(lines, pending.clone(), cancel.clone()));
        let write_handle = tokio::spawn(write_pump(sink, write_rx, cancel.clone()));

        Self {
            write_tx,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
            read_handle,
            write_handle,
        }
    }

    /// Sends a request and waits for its response.
    pub async fn call<P, R>(&self, method: Method, params: &P) -> Result<R, CoordinatorError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&RpcRequest::new(id, method, params)?)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(CoordinatorError::ChannelClosed);
            }
            pending.waiters.insert(id, tx);
        }

        if self.write_tx.send(line).await.is_err() {
            self.pending.lock().await.waiters.remove(&id);
            return Err(CoordinatorError::ChannelClosed);
        }

        let response = rx.await.map_err(|_| CoordinatorError::ChannelClosed)?;
        if let Some(err) = response.error {
            return Err(CoordinatorError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .parse_result()?
            .ok_or(CoordinatorError::EmptyResponse)
    }

    /// Returns `true` once the connection has ended.
    pub async fn is_closed(&self) -> bool {
        self.pending.lock().await.closed
    }

    /// Closes the connection. Outstanding calls fail with
    /// [`CoordinatorError::ChannelClosed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

async fn read_pump<S>(mut lines: S, pending: PendingMap, cancel: CancellationToken)
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = lines.next() => {
                match frame {
                    Some(Ok(line)) => route(&line, &pending).await,
                    Some(Err(e)) => {
                        tracing::warn!("worker connection read error: {e}");
                        break;
                    }
                    None => {
                        tracing::debug!("worker closed the connection");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the senders wakes every waiter with ChannelClosed.
    let mut pending = pending.lock().await;
    pending.closed = true;
    if !pending.waiters.is_empty() {
        tracing::warn!(outstanding = pending.waiters.len(), "failing outstanding calls");
    }
    pending.waiters.clear();
    cancel.cancel();
}

async fn route(line: &str, pending: &PendingMap) {
    let response: RpcResponse = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("invalid response from worker: {e}");
            return;
        }
    };

    let Some(id) = response.id else {
        let message = response.error.map(|e| e.message).unwrap_or_default();
        tracing::warn!(%message, "worker could not parse a request");
        return;
    };

    match pending.lock().await.waiters.remove(&id) {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => tracing::debug!(id, "response for unknown or abandoned request"),
    }
}

async fn write_pump<K>(mut sink: K, mut rx: mpsc::Receiver<String>, cancel: CancellationToken)
where
    K: futures_util::Sink<String, Error = LinesCodecError> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            line = rx.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = sink.send(line).await {
                    tracing::warn!("worker connection write error: {e}");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketcache_protocol::constants::TRANSFER_FAILED;
    use bucketcache_protocol::messages::{PingParams, PingResult};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Reads `n` requests, then answers them in reverse order, echoing each
    /// id in the result.
    async fn reverse_server(stream: DuplexStream, n: usize) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut ids = Vec::new();
        while ids.len() < n {
            let line = lines.next_line().await.unwrap().unwrap();
            let req: RpcRequest = serde_json::from_str(&line).unwrap();
            ids.push(req.id);
        }
        for id in ids.into_iter().rev() {
            let resp = RpcResponse::success(
                id,
                &PingResult {
                    message: id.to_string(),
                },
            )
            .unwrap();
            let mut json = serde_json::to_string(&resp).unwrap();
            json.push('\n');
            write.write_all(json.as_bytes()).await.unwrap();
        }
        // Keep the connection open until the client is done.
        let _ = lines.next_line().await;
    }

    #[tokio::test]
    async fn routes_out_of_order_responses_by_id() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(reverse_server(server_end, 100));
        let client = Arc::new(RpcClient::from_stream(client_end));

        let calls = (0..100).map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let result: PingResult = client.call(Method::Ping, &PingParams {}).await.unwrap();
                result.message.parse::<u64>().unwrap()
            })
        });
        let mut echoed = Vec::new();
        for call in calls.collect::<Vec<_>>() {
            echoed.push(call.await.unwrap());
        }
        echoed.sort_unstable();
        assert_eq!(echoed, (1..=100).collect::<Vec<u64>>());

        client.close();
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn pending_calls_fail_when_connection_closes() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let client = RpcClient::from_stream(client_end);

        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(server_end).lines();
            lines.next_line().await.unwrap().unwrap();
            // Dropping the stream closes the connection without answering.
        });

        let err = client
            .call::<_, PingResult>(Method::Ping, &PingParams {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ChannelClosed));
        server.await.unwrap();

        assert!(client.is_closed().await);
        let err = client
            .call::<_, PingResult>(Method::Ping, &PingParams {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ChannelClosed));
    }

    #[tokio::test]
    async fn error_response_becomes_rpc_error() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let client = RpcClient::from_stream(client_end);

        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server_end);
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: RpcRequest = serde_json::from_str(&line).unwrap();
            let resp = RpcResponse::failure(Some(req.id), TRANSFER_FAILED, "bucket missing");
            let mut json = serde_json::to_string(&resp).unwrap();
            json.push('\n');
            write.write_all(json.as_bytes()).await.unwrap();
            let _ = lines.next_line().await;
        });

        let err = client
            .call::<_, PingResult>(Method::Ping, &PingParams {})
            .await
            .unwrap_err();
        match err {
            CoordinatorError::Rpc { code, message } => {
                assert_eq!(code, TRANSFER_FAILED);
                assert_eq!(message, "bucket missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
