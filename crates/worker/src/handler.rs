//! Request dispatch: one JSON line in, one response out.

use std::future::Future;
use std::sync::Arc;

use bucketcache_protocol::constants::{
    INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, TRANSFER_FAILED,
};
use bucketcache_protocol::messages::PingParams;
use bucketcache_protocol::{Method, RpcRequest, RpcResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::WorkerError;
use crate::service::TransferService;

/// Handles one request line and produces its response.
///
/// The method body runs on its own task so a panic becomes an error
/// response instead of tearing down the connection.
pub async fn handle_line(service: Arc<TransferService>, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("invalid request JSON: {e}");
            return RpcResponse::failure(None, PARSE_ERROR, format!("parse error: {e}"));
        }
    };

    let id = request.id;
    let Some(method) = Method::parse(&request.method) else {
        tracing::warn!(id, method = %request.method, "unknown method");
        return RpcResponse::failure(
            Some(id),
            METHOD_NOT_FOUND,
            format!("method not found: {}", request.method),
        );
    };

    tracing::trace!(id, %method, "request received");
    let task = tokio::spawn(async move { dispatch(&service, method, &request).await });
    match task.await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(id, %method, "handler failed: {e}");
            RpcResponse::failure(Some(id), TRANSFER_FAILED, format!("internal error: {e}"))
        }
    }
}

async fn dispatch(service: &TransferService, method: Method, request: &RpcRequest) -> RpcResponse {
    match method {
        Method::Ping => {
            call(request, method, |_: PingParams| async { Ok(service.ping()) }).await
        }
        Method::Download => call(request, method, |p| service.download(p)).await,
        Method::Upload => call(request, method, |p| service.upload(p)).await,
    }
}

async fn call<P, R, F, Fut>(request: &RpcRequest, method: Method, f: F) -> RpcResponse
where
    P: DeserializeOwned,
    R: Serialize,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = Result<R, WorkerError>>,
{
    let id = request.id;
    let params: P = match request.parse_params() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(id, %method, "invalid params: {e}");
            return RpcResponse::failure(Some(id), INVALID_PARAMS, format!("invalid params: {e}"));
        }
    };

    let result = match f(params).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(id, %method, "transfer failed: {e}");
            return RpcResponse::failure(Some(id), TRANSFER_FAILED, e.to_string());
        }
    };

    RpcResponse::success(id, &result).unwrap_or_else(|e| {
        RpcResponse::failure(Some(id), TRANSFER_FAILED, format!("encoding result: {e}"))
    })
}
