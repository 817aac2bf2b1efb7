//! Streaming tar/gzip plumbing between object bodies and the filesystem.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use bucketcache_storage::ObjectReader;
use bucketcache_transfer::validate_member_path;
use futures_util::StreamExt;
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;

use crate::WorkerError;

/// Buffer size for streaming I/O (128 KiB).
pub(crate) const BUF_SIZE: usize = 128 * 1024;

/// Wraps `body` in a gzip decoder.
pub fn gunzip(body: ObjectReader) -> ObjectReader {
    Box::pin(GzipDecoder::new(BufReader::with_capacity(BUF_SIZE, body)))
}

/// Wraps `body` in a gzip encoder.
pub fn gzip(body: ObjectReader) -> ObjectReader {
    Box::pin(GzipEncoder::new(BufReader::with_capacity(BUF_SIZE, body)))
}

// ---------------------------------------------------------------------------
// Plain files
// ---------------------------------------------------------------------------

/// Outcome of [`write_verified`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { bytes: u64 },
    ChecksumMismatch { expected: String, actual: String },
}

/// Temp file next to `dest`, hidden and unique per call.
fn sibling_temp(dest: &Path, suffix: &str) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut name = OsString::from(".");
    name.push(dest.file_name().unwrap_or_default());
    name.push(format!(".{}.{suffix}", uuid::Uuid::new_v4().simple()));
    parent.join(name)
}

/// Streams `body` into `dest` through a temp sibling, computing SHA-512 on
/// the way. The file is only renamed into place if `expected` is absent or
/// matches (case-insensitive hex); otherwise the temp file is removed.
pub async fn write_verified(
    mut body: ObjectReader,
    dest: &Path,
    expected: Option<&str>,
) -> Result<WriteOutcome, WorkerError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = sibling_temp(dest, "tmp");

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha512::new();
        let mut buf = vec![0u8; BUF_SIZE];
        let mut bytes = 0u64;
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            bytes += n as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<_, io::Error>((bytes, hex::encode(hasher.finalize())))
    }
    .await;

    let (bytes, actual) = match written {
        Ok(v) => v,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
    };

    if let Some(expected) = expected {
        if !expected.eq_ignore_ascii_case(&actual) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Ok(WriteOutcome::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(WriteOutcome::Written { bytes })
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Counters reported by [`unpack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    pub unpacked: usize,
    pub skipped: usize,
}

/// Unpacks a tar stream into `dest`, which must exist.
///
/// Member paths that are absolute or contain `..` fail the whole extraction.
/// With `keep_existing`, non-directory members whose target already exists
/// are skipped.
pub async fn unpack<R>(reader: R, dest: &Path, keep_existing: bool) -> Result<UnpackStats, WorkerError>
where
    R: AsyncRead + Unpin,
{
    let mut archive = tokio_tar::Archive::new(reader);
    let mut entries = archive.entries()?;
    let mut stats = UnpackStats::default();

    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // The archive root itself.
        if !path.components().any(|c| matches!(c, Component::Normal(_))) {
            continue;
        }
        validate_member_path(&path)?;

        if keep_existing
            && !entry.header().entry_type().is_dir()
            && tokio::fs::symlink_metadata(dest.join(&path)).await.is_ok()
        {
            stats.skipped += 1;
            continue;
        }

        entry.unpack_in(dest).await?;

        // A body that ends inside a member leaves a short file behind.
        if entry.header().entry_type().is_file() {
            let expected = entry.header().size()?;
            let actual = tokio::fs::metadata(dest.join(&path)).await?.len();
            if actual != expected {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{}: got {actual} of {expected} bytes", path.display()),
                )
                .into());
            }
        }
        stats.unpacked += 1;
    }

    Ok(stats)
}

/// Extracts into `dest`, creating it if needed and keeping files that are
/// already present.
///
/// The archive is unpacked into a staging sibling first. Nothing reaches
/// `dest` unless the whole stream unpacks cleanly, so an interrupted chunk
/// never leaves a partial member to be kept by a later merge.
pub async fn extract_merge(body: ObjectReader, dest: &Path) -> Result<UnpackStats, WorkerError> {
    tokio::fs::create_dir_all(dest).await?;
    let staging = sibling_temp(dest, "merge");
    tokio::fs::create_dir_all(&staging).await?;

    let result = async {
        let unpacked = unpack(body, &staging, false).await?;
        let skipped = promote(&staging, dest).await?;
        Ok::<_, WorkerError>(UnpackStats {
            unpacked: unpacked.unpacked.saturating_sub(skipped),
            skipped,
        })
    }
    .await;

    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        tracing::warn!(path = %staging.display(), "failed to remove merge staging: {e}");
    }
    result
}

/// Moves every non-directory under `staging` to the same relative path under
/// `dest`, unless something already exists there. Returns how many were kept
/// back.
async fn promote(staging: &Path, dest: &Path) -> Result<usize, WorkerError> {
    let mut skipped = 0;
    let mut pending = vec![PathBuf::new()];

    while let Some(rel) = pending.pop() {
        let mut dir = tokio::fs::read_dir(staging.join(&rel)).await?;
        while let Some(child) = dir.next_entry().await? {
            let rel = rel.join(child.file_name());
            let target = dest.join(&rel);
            if child.file_type().await?.is_dir() {
                tokio::fs::create_dir_all(&target).await?;
                pending.push(rel);
            } else if tokio::fs::symlink_metadata(&target).await.is_ok() {
                skipped += 1;
            } else {
                tokio::fs::rename(child.path(), &target).await?;
            }
        }
    }
    Ok(skipped)
}

/// Extracts into a fresh directory that then replaces `dest`.
///
/// A previous `dest` is moved to `<dest>.<ts>.bak` and removed once the new
/// tree is in place.
pub async fn extract_replace(body: ObjectReader, dest: &Path) -> Result<UnpackStats, WorkerError> {
    let stamp = chrono::Utc::now().timestamp_millis();
    let with_suffix = |suffix: &str| {
        let mut name = dest.as_os_str().to_owned();
        name.push(format!(".{stamp}.{suffix}"));
        PathBuf::from(name)
    };
    let staging = with_suffix("tmp");
    let backup = with_suffix("bak");

    tokio::fs::create_dir_all(&staging).await?;
    let stats = match unpack(body, &staging, false).await {
        Ok(stats) => stats,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }
    };

    let had_previous = match tokio::fs::rename(dest, &backup).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }
    };

    if let Err(e) = tokio::fs::rename(&staging, dest).await {
        if had_previous {
            let _ = tokio::fs::rename(&backup, dest).await;
        }
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e.into());
    }

    if had_previous {
        if let Err(e) = tokio::fs::remove_dir_all(&backup).await {
            tracing::warn!(path = %backup.display(), "failed to remove previous output: {e}");
        }
    }
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Archive creation
// ---------------------------------------------------------------------------

/// Opens `path` as an upload body.
pub async fn open_file(path: &Path) -> Result<ObjectReader, WorkerError> {
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::pin(file))
}

/// Streams a tar of `root` as an upload body.
///
/// With an empty `include` the whole directory is archived; otherwise only
/// the listed members (relative to `root`). Member paths are checked before
/// anything is spawned. Errors while building surface as read errors on the
/// returned body.
pub fn tar_stream(root: PathBuf, include: Vec<String>) -> Result<ObjectReader, WorkerError> {
    for member in &include {
        validate_member_path(Path::new(member))?;
    }

    let (writer, reader) = tokio::io::duplex(BUF_SIZE);
    let producer = tokio::spawn(async move {
        let mut builder = tokio_tar::Builder::new(writer);
        builder.follow_symlinks(false);
        if include.is_empty() {
            builder.append_dir_all("", &root).await?;
        } else {
            for member in &include {
                builder.append_path_with_name(root.join(member), member).await?;
            }
        }
        let mut writer = builder.into_inner().await?;
        writer.shutdown().await
    });

    Ok(Box::pin(ProducedReader {
        inner: reader,
        producer: Some(producer),
    }))
}

/// Read half of a pipe whose write half is fed by a task. At end of stream
/// the task's result is checked so a failed producer is not mistaken for a
/// short archive.
struct ProducedReader {
    inner: DuplexStream,
    producer: Option<JoinHandle<io::Result<()>>>,
}

impl AsyncRead for ProducedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        if let Some(producer) = self.producer.as_mut() {
            let joined = ready!(Pin::new(producer).poll(cx));
            self.producer = None;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(e) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for ProducedReader {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}
