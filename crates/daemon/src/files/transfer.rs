//! Streaming file transfer.
//!
//! Downloads are served straight from an open file handle in bounded chunks,
//! with single-range support. Uploads are written to a temporary sibling of
//! the destination and renamed into place only after the whole body has been
//! received and synced, so the destination never holds a partial payload.
//! The temporary is removed on any failure, including the request future
//! being dropped when a client disconnects.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use protocol::ApiError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default streaming buffer (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Infix that marks in-flight upload temporaries.
const UPLOAD_TEMP_MARKER: &str = ".upload-";

/// Errors that can occur during file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("path is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    /// A path component that must be a directory is something else.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("upload exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },

    /// The requested range lies outside a file of `total` bytes.
    #[error("range not satisfiable for file of size {total}")]
    RangeNotSatisfiable { total: u64 },

    /// The request body failed mid-stream.
    #[error("request body failed: {0}")]
    Body(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        let detail = err.to_string();
        match err {
            TransferError::NotFound(_) => ApiError::not_found(detail),
            TransferError::IsADirectory(_)
            | TransferError::AlreadyExists(_)
            | TransferError::NotADirectory(_) => ApiError::conflict(detail),
            TransferError::TooLarge { .. }
            | TransferError::RangeNotSatisfiable { .. }
            | TransferError::Body(_) => ApiError::validation(detail),
            TransferError::Io(e) => ApiError::from(e),
        }
    }
}

/// Whether a lookup error means the path does not exist, including a file
/// standing where a parent directory should be.
pub fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Create `dir` and any missing parents. An existing non-directory on the
/// way is [`TransferError::NotADirectory`].
pub async fn ensure_dir(dir: &Path) -> Result<(), TransferError> {
    for ancestor in dir.ancestors() {
        match tokio::fs::metadata(ancestor).await {
            Ok(meta) if meta.is_dir() => break,
            Ok(_) => return Err(TransferError::NotADirectory(ancestor.to_path_buf())),
            Err(e) if is_missing(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Whether `name` is an in-flight upload temporary.
pub fn is_upload_temp(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp") && name.contains(UPLOAD_TEMP_MARKER)
}

fn upload_temp_path(dest: &Path) -> Result<PathBuf, TransferError> {
    let parent = dest
        .parent()
        .ok_or_else(|| TransferError::IsADirectory(dest.to_path_buf()))?;
    let name = dest
        .file_name()
        .ok_or_else(|| TransferError::IsADirectory(dest.to_path_buf()))?;
    Ok(parent.join(format!(
        ".{}{}{}.tmp",
        name.to_string_lossy(),
        UPLOAD_TEMP_MARKER,
        Uuid::new_v4()
    )))
}

// ============================================================================
// Downloads
// ============================================================================

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// `Content-Range` value for a file of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end - 1, total)
    }
}

/// Parse a `Range` header against a file of `total` bytes.
///
/// Supports `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. An end
/// past the file is clamped. Multiple ranges are not supported. Returns
/// `None` when the header is malformed or cannot be satisfied.
pub fn parse_range_header(range_header: &str, total: u64) -> Option<ByteRange> {
    let ranges = range_header.trim().strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }

    if let Some(suffix) = ranges.strip_prefix('-') {
        let suffix: u64 = suffix.parse().ok()?;
        if suffix == 0 || total == 0 {
            return None;
        }
        return Some(ByteRange {
            start: total.saturating_sub(suffix),
            end: total,
        });
    }

    let (start, end) = ranges.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        total
    } else {
        // Inclusive in HTTP, exclusive here.
        end.parse::<u64>().ok()?.saturating_add(1).min(total)
    };

    if start >= total || start >= end {
        return None;
    }
    Some(ByteRange { start, end })
}

/// An opened file ready to stream.
pub struct Download {
    pub stream: ReaderStream<tokio::io::Take<tokio::fs::File>>,
    pub content_type: String,
    /// Size of the whole file.
    pub total: u64,
    /// The served range when the request asked for one.
    pub range: Option<ByteRange>,
}

impl Download {
    /// Number of bytes the stream will yield.
    pub fn len(&self) -> u64 {
        self.range.map(|r| r.len()).unwrap_or(self.total)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open `path` for streaming, honoring an optional `Range` header.
pub async fn open_download(
    path: &Path,
    range_header: Option<&str>,
    chunk_size: usize,
) -> Result<Download, TransferError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        if is_missing(&e) {
            TransferError::NotFound(path.to_path_buf())
        } else {
            TransferError::Io(e)
        }
    })?;
    let metadata = file.metadata().await?;
    if metadata.is_dir() {
        return Err(TransferError::IsADirectory(path.to_path_buf()));
    }
    let total = metadata.len();

    let range = match range_header {
        Some(header) => Some(
            parse_range_header(header, total)
                .ok_or(TransferError::RangeNotSatisfiable { total })?,
        ),
        None => None,
    };

    let (start, len) = match range {
        Some(r) => (r.start, r.len()),
        None => (0, total),
    };
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }

    debug!(path = %path.display(), start, len, total, "Opening download");

    Ok(Download {
        stream: ReaderStream::with_capacity(file.take(len), chunk_size),
        content_type: mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string(),
        total,
        range,
    })
}

// ============================================================================
// Uploads
// ============================================================================

/// Removes a temporary file on drop unless disarmed.
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed upload temporary"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove upload temporary")
            }
        }
    }
}

/// Stream `body` into `dest` atomically. Missing parent directories are
/// created. Returns the number of bytes written.
///
/// Concurrent writers to the same destination each use their own temporary;
/// the last rename wins and the destination always holds one complete
/// payload.
pub async fn write_atomic<B>(dest: &Path, mut body: B, max_size: u64) -> Result<u64, TransferError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    if let Some(parent) = dest.parent() {
        ensure_dir(parent).await?;
    }

    let temp = upload_temp_path(dest)?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .await?;
    let mut guard = TempGuard::new(temp.clone());

    let mut written: u64 = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| TransferError::Body(e.to_string()))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        written += data.len() as u64;
        if written > max_size {
            return Err(TransferError::TooLarge { limit: max_size });
        }
        file.write_all(&data).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp, dest).await?;
    guard.disarm();

    debug!(path = %dest.display(), bytes = written, "Upload committed");
    Ok(written)
}

/// Create `path` and any missing parents as directories.
pub async fn create_directory(path: &Path) -> Result<(), TransferError> {
    if tokio::fs::symlink_metadata(path).await.is_ok() {
        return Err(TransferError::AlreadyExists(path.to_path_buf()));
    }
    ensure_dir(path).await
}

// ============================================================================
// Checksums
// ============================================================================

/// SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> Result<Vec<u8>, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DEFAULT_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_vec())
}

/// Size and hex SHA-256 of a regular file, computed off the async runtime.
pub async fn checksum(path: &Path) -> Result<(u64, String), TransferError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let metadata = std::fs::metadata(&path).map_err(|e| {
            if is_missing(&e) {
                TransferError::NotFound(path.clone())
            } else {
                TransferError::Io(e)
            }
        })?;
        if metadata.is_dir() {
            return Err(TransferError::IsADirectory(path));
        }
        let digest = hash_file(&path)?;
        Ok((metadata.len(), hex::encode(digest)))
    })
    .await
    .map_err(|e| TransferError::Io(io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{self, StreamExt};
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;
    use std::fs;
    use std::pin::Pin;
    use std::time::Duration;
    use tempfile::TempDir;

    type TestStream = Pin<Box<dyn futures_util::Stream<Item = Result<Frame<Bytes>, io::Error>> + Send>>;

    fn temporaries(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| is_upload_temp(n))
            .collect()
    }

    fn chunked(payload: Vec<u8>, chunk: usize) -> StreamBody<TestStream> {
        let frames: Vec<Result<Frame<Bytes>, io::Error>> = payload
            .chunks(chunk)
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        let stream: TestStream = Box::pin(stream::iter(frames).then(|frame| async move {
            tokio::task::yield_now().await;
            frame
        }));
        StreamBody::new(stream)
    }

    async fn read_all(download: Download) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = download.stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    // ========================================================================
    // Ranges
    // ========================================================================

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range_header("bytes=0-99", 1000),
            Some(ByteRange { start: 0, end: 100 })
        );
        assert_eq!(
            parse_range_header("bytes=500-", 1000),
            Some(ByteRange {
                start: 500,
                end: 1000
            })
        );
        assert_eq!(
            parse_range_header("bytes=-100", 1000),
            Some(ByteRange {
                start: 900,
                end: 1000
            })
        );
        // Suffix longer than the file is the whole file.
        assert_eq!(
            parse_range_header("bytes=-5000", 1000),
            Some(ByteRange { start: 0, end: 1000 })
        );
        // End past the file is clamped.
        assert_eq!(
            parse_range_header("bytes=990-2000", 1000),
            Some(ByteRange {
                start: 990,
                end: 1000
            })
        );
    }

    #[test]
    fn test_parse_range_rejects() {
        for header in [
            "bytes=1000-",
            "bytes=5-4",
            "bytes=-0",
            "bytes=abc-",
            "items=0-1",
            "bytes=0-1,5-6",
            "bytes=",
        ] {
            assert_eq!(parse_range_header(header, 1000), None, "{}", header);
        }
        assert_eq!(parse_range_header("bytes=-10", 0), None);
    }

    #[test]
    fn test_content_range() {
        let range = ByteRange { start: 10, end: 20 };
        assert_eq!(range.content_range(100), "bytes 10-19/100");
        assert_eq!(range.len(), 10);
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    #[tokio::test]
    async fn test_download_full() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.pdf");
        let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        fs::write(&path, &content).unwrap();

        let download = open_download(&path, None, 1024).await.unwrap();
        assert_eq!(download.content_type, "application/pdf");
        assert_eq!(download.total, 10_000);
        assert_eq!(download.len(), 10_000);
        assert!(download.range.is_none());
        assert_eq!(read_all(download).await, content);
    }

    #[tokio::test]
    async fn test_download_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        fs::write(&path, b"0123456789").unwrap();

        let download = open_download(&path, Some("bytes=2-5"), 1024).await.unwrap();
        assert_eq!(download.range, Some(ByteRange { start: 2, end: 6 }));
        assert_eq!(download.content_type, "application/octet-stream");
        assert_eq!(read_all(download).await, b"2345");
    }

    #[tokio::test]
    async fn test_download_unsatisfiable_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.txt");
        fs::write(&path, b"short").unwrap();

        let err = open_download(&path, Some("bytes=100-"), 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::RangeNotSatisfiable { total: 5 }));
    }

    #[tokio::test]
    async fn test_download_missing_and_directory() {
        let temp = TempDir::new().unwrap();
        let err = open_download(&temp.path().join("nope"), None, 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::NotFound(_)));
        assert_eq!(ApiError::from(err).status_line(), "404 Not Found");

        let err = open_download(temp.path(), None, 1024).await.err().unwrap();
        assert!(matches!(err, TransferError::IsADirectory(_)));
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    #[tokio::test]
    async fn test_upload_writes_and_leaves_no_temporary() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("nested/dir/upload.bin");

        let written = write_atomic(&dest, Full::new(Bytes::from_static(b"payload")), 1024)
            .await
            .unwrap();

        assert_eq!(written, 7);
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(temporaries(dest.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_upload_replaces_existing_content() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file.txt");
        fs::write(&dest, b"old content that is longer").unwrap();

        write_atomic(&dest, Full::new(Bytes::from_static(b"new")), 1024)
            .await
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_upload_too_large() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("big.bin");

        let err = write_atomic(&dest, chunked(vec![7u8; 4096], 512), 1000)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::TooLarge { limit: 1000 }));
        assert_eq!(ApiError::from(err).status_line(), "400 Bad Request");
        assert!(!dest.exists());
        assert!(temporaries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_upload_body_error_keeps_old_content() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("doc.txt");
        fs::write(&dest, b"original").unwrap();

        let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let body = StreamBody::new(stream::iter(frames));

        let err = write_atomic(&dest, body, 1024).await.unwrap_err();
        assert!(matches!(err, TransferError::Body(_)));
        assert_eq!(fs::read(&dest).unwrap(), b"original");
        assert!(temporaries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_upload_cancelled_mid_stream_removes_temporary() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("stalled.bin");

        let first: Vec<Result<Frame<Bytes>, io::Error>> =
            vec![Ok(Frame::data(Bytes::from_static(b"first chunk")))];
        let stream: TestStream = Box::pin(stream::iter(first).chain(stream::pending()));
        let body = StreamBody::new(stream);

        let task_dest = dest.clone();
        let handle = tokio::spawn(async move { write_atomic(&task_dest, body, 1024).await });

        let mut seen = false;
        for _ in 0..100 {
            if !temporaries(temp.path()).is_empty() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "upload temporary never appeared");

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(temporaries(temp.path()).is_empty());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_concurrent_uploads_leave_one_payload() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("contested.bin");
        let a = vec![b'a'; 256 * 1024];
        let b = vec![b'b'; 256 * 1024];

        let (ra, rb) = tokio::join!(
            write_atomic(&dest, chunked(a.clone(), 4096), u64::MAX),
            write_atomic(&dest, chunked(b.clone(), 4096), u64::MAX),
        );
        ra.unwrap();
        rb.unwrap();

        let result = fs::read(&dest).unwrap();
        assert!(result == a || result == b, "destination holds interleaved bytes");
        assert!(temporaries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_create_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a/b/c");

        create_directory(&dir).await.unwrap();
        assert!(dir.is_dir());

        let err = create_directory(&dir).await.unwrap_err();
        assert!(matches!(err, TransferError::AlreadyExists(_)));
        assert_eq!(ApiError::from(err).status_line(), "409 Conflict");
    }

    #[tokio::test]
    async fn test_file_in_place_of_parent_directory() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("plain.txt");
        fs::write(&plain, b"plain").unwrap();

        let err = write_atomic(
            &plain.join("child.txt"),
            Full::new(Bytes::from_static(b"x")),
            1024,
        )
        .await
        .unwrap_err();
        assert!(matches!(&err, TransferError::NotADirectory(p) if *p == plain));
        assert_eq!(ApiError::from(err).status_line(), "409 Conflict");

        let err = create_directory(&plain.join("a/b")).await.unwrap_err();
        assert!(matches!(err, TransferError::NotADirectory(_)));
        assert_eq!(fs::read(&plain).unwrap(), b"plain");
        assert!(temporaries(temp.path()).is_empty());

        let missing = checksum(&plain.join("child.txt")).await.unwrap_err();
        assert!(matches!(missing, TransferError::NotFound(_)));
    }

    #[test]
    fn test_temp_names() {
        let temp = upload_temp_path(Path::new("/srv/alice/photo.jpg")).unwrap();
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".photo.jpg.upload-"));
        assert!(is_upload_temp(&name));
        assert_eq!(temp.parent(), Some(Path::new("/srv/alice")));

        assert!(!is_upload_temp("photo.jpg"));
        assert!(!is_upload_temp(".hidden.tmp"));
    }

    // ========================================================================
    // Checksums
    // ========================================================================

    #[tokio::test]
    async fn test_checksum() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hello.txt");
        fs::write(&path, b"hello world").unwrap();

        let (size, digest) = checksum(&path).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let err = checksum(temp.path()).await.unwrap_err();
        assert!(matches!(err, TransferError::IsADirectory(_)));
    }
}
