use std::fmt;
use std::time::Duration;

/// JSON-RPC version string carried by every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Environment variable carrying the worker's JSON configuration blob.
pub const WORKER_CONFIG_ENV: &str = "BUCKETCACHE_WORKER_CONFIG";

/// How often the coordinator probes a starting worker with `Ping`.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// How long the coordinator waits for a starting worker to answer `Ping`.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of concurrent downloads admitted by the worker.
pub const DEFAULT_MAX_DOWNLOAD_CONCURRENCY: usize = 500;

/// Default number of concurrent uploads admitted by the worker.
pub const DEFAULT_MAX_UPLOAD_CONCURRENCY: usize = 500;

/// Default number of chunks (and parallel transfers) in bulk mode.
pub const DEFAULT_CHUNK_COUNT: usize = 10;

/// Maximum length of a single JSON line on the socket (1 MiB).
///
/// Payloads only carry paths and flags, never file data.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Reply to `S3Service.Ping`.
pub const PONG: &str = "Pong";

// JSON-RPC error codes.

/// The request line was not valid JSON.
pub const PARSE_ERROR: i32 = -32700;

/// The method does not exist.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// The params did not match the method's payload.
pub const INVALID_PARAMS: i32 = -32602;

/// The transfer itself failed (storage, filesystem, archive).
pub const TRANSFER_FAILED: i32 = -32000;

/// Methods exposed by the transfer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    Download,
    Upload,
}

impl Method {
    /// Returns the wire name, e.g. `S3Service.Download`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "S3Service.Ping",
            Method::Download => "S3Service.Download",
            Method::Upload => "S3Service.Upload",
        }
    }

    /// Parses a wire name. Returns `None` for unknown methods.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "S3Service.Ping" => Some(Method::Ping),
            "S3Service.Download" => Some(Method::Download),
            "S3Service.Upload" => Some(Method::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_roundtrip() {
        for method in [Method::Ping, Method::Download, Method::Upload] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
    }

    #[test]
    fn unknown_method() {
        assert_eq!(Method::parse("S3Service.Delete"), None);
        assert_eq!(Method::parse("ping"), None);
    }
}
