//! Per-connection read loop and write pump.

use std::sync::Arc;

use bucketcache_protocol::RpcResponse;
use bucketcache_protocol::constants::{MAX_LINE_LENGTH, PARSE_ERROR};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::handle_line;
use crate::service::TransferService;

/// Serves one client until it disconnects or `cancel` fires.
///
/// Every request line is handled on its own task; responses are written in
/// completion order.
pub async fn serve_connection<S>(stream: S, service: Arc<TransferService>, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (sink, mut lines) = framed.split();
    let (tx, rx) = mpsc::channel::<String>(SEND_BUFFER_SIZE);

    let writer = tokio::spawn(write_pump(sink, rx));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = lines.next() => {
                match frame {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let tx = tx.clone();
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            let response = handle_line(service, &line).await;
                            send(&tx, &response).await;
                        });
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        tracing::warn!(max = MAX_LINE_LENGTH, "request line too long");
                        let response = RpcResponse::failure(None, PARSE_ERROR, "request line too long");
                        send(&tx, &response).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("connection read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // The pump drains until every in-flight request has dropped its sender.
    drop(tx);
    if let Err(e) = writer.await {
        tracing::error!("write pump failed: {e}");
    }
    tracing::debug!("connection closed");
}

async fn send(tx: &mpsc::Sender<String>, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if tx.send(json).await.is_err() {
                tracing::debug!(id = ?response.id, "connection gone, dropping response");
            }
        }
        Err(e) => tracing::error!(id = ?response.id, "failed to encode response: {e}"),
    }
}

async fn write_pump<K>(mut sink: K, mut rx: mpsc::Receiver<String>)
where
    K: futures_util::Sink<String, Error = LinesCodecError> + Unpin,
{
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            tracing::warn!("write pump send error: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketcache_protocol::messages::PingResult;
    use bucketcache_storage::MemoryStore;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn answers_every_request_on_one_stream() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let service = Arc::new(TransferService::new(Arc::new(MemoryStore::new()), 2, 2));
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(serve_connection(server, service, cancel.clone()));

        let (read, mut write) = tokio::io::split(client);
        for id in 1..=5u64 {
            let line = format!(
                "{{\"jsonrpc\":\"2.0\",\"method\":\"S3Service.Ping\",\"params\":[{{}}],\"id\":{id}}}\n"
            );
            write.write_all(line.as_bytes()).await.unwrap();
        }
        write.write_all(b"\n{broken\n").await.unwrap();

        let mut reader = BufReader::new(read).lines();
        let mut ids = Vec::new();
        let mut parse_errors = 0;
        for _ in 0..6 {
            let line = reader.next_line().await.unwrap().unwrap();
            let resp: RpcResponse = serde_json::from_str(&line).unwrap();
            match resp.id {
                Some(id) => {
                    let pong: PingResult = resp.parse_result().unwrap().unwrap();
                    assert_eq!(pong.message, "Pong");
                    ids.push(id);
                }
                None => {
                    assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
                    parse_errors += 1;
                }
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_errors, 1);

        cancel.cancel();
        serving.await.unwrap();
    }
}
