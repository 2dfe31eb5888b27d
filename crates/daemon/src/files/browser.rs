//! Streaming directory listings.
//!
//! A listing is produced in two phases. The directory is read once for entry
//! names only, which are sorted by name. A blocking producer then stats each
//! entry as it is about to be written and pushes JSON fragments into a
//! bounded channel, so memory stays flat no matter how large the directory
//! is and a client that goes away stops the work.
//!
//! The assembled body is a single JSON document:
//! `{"path":"/docs","items":[{"name":..,"size":..,"modified":..,"isDir":..},..]}`

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use protocol::messages::ListingEntry;
use protocol::ApiError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::scope::ResolvedTarget;
use super::transfer::is_upload_temp;

/// Number of encoded chunks buffered ahead of the client.
pub const LISTING_CHANNEL_DEPTH: usize = 4;

/// Receiving half of a listing; each item is one chunk of the JSON body.
pub type ListingReceiver = mpsc::Receiver<io::Result<Bytes>>;

/// Start streaming the listing of `target`, which must be a directory.
pub async fn list_directory(
    target: &ResolvedTarget,
    chunk_size: usize,
) -> Result<ListingReceiver, ApiError> {
    let dir = target.path.clone();
    let names = tokio::task::spawn_blocking(move || read_sorted_names(&dir))
        .await
        .map_err(|e| ApiError::internal(format!("listing task failed: {}", e)))??;

    debug!(path = %target.logical, entries = names.len(), "Listing directory");

    let producer = ListingProducer {
        dir: target.path.clone(),
        root: target.root.clone(),
        logical: target.logical.clone(),
        names,
        chunk_size,
    };
    let (tx, rx) = mpsc::channel(LISTING_CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || producer.run(tx));
    Ok(rx)
}

/// Entry names of `dir`, sorted by name. Upload temporaries are hidden.
pub fn read_sorted_names(dir: &Path) -> Result<Vec<(String, OsString)>, ApiError> {
    let entries = fs::read_dir(dir).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ApiError::not_found(format!("{} not found", dir.display())),
        _ => ApiError::internal(format!("read_dir {}: {}", dir.display(), e)),
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        let raw = entry.file_name();
        let name = raw.to_string_lossy().into_owned();
        if is_upload_temp(&name) {
            continue;
        }
        names.push((name, raw));
    }

    names.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(names)
}

/// Stat one entry. `None` when it vanished after the directory was read.
///
/// Symlinks report their target's metadata only when the target stays under
/// `root`; otherwise the link itself is described.
pub fn stat_entry(dir: &Path, root: &Path, name: &str, raw: &OsString) -> Option<ListingEntry> {
    let path = dir.join(raw);
    let mut meta = fs::symlink_metadata(&path).ok()?;

    if meta.file_type().is_symlink() {
        if let Ok(target) = fs::canonicalize(&path) {
            if target.starts_with(root) {
                if let Ok(followed) = fs::metadata(&target) {
                    meta = followed;
                }
            }
        }
    }

    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Some(ListingEntry {
        name: name.to_string(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified,
        is_dir: meta.is_dir(),
    })
}

/// Blocking half of a listing.
pub struct ListingProducer {
    pub dir: PathBuf,
    pub root: PathBuf,
    pub logical: String,
    pub names: Vec<(String, OsString)>,
    /// Approximate byte size of each chunk sent down the channel.
    pub chunk_size: usize,
}

impl ListingProducer {
    /// Write the whole document into `tx`. Returns how many entries were
    /// sent; stops early when the receiver is gone.
    pub fn run(self, tx: mpsc::Sender<io::Result<Bytes>>) -> usize {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let header = match serde_json::to_string(&self.logical) {
            Ok(path) => format!("{{\"path\":{},\"items\":[", path),
            Err(e) => {
                let _ = tx.blocking_send(Err(io::Error::other(e)));
                return 0;
            }
        };
        buf.put_slice(header.as_bytes());

        let mut written = 0usize;
        for (name, raw) in &self.names {
            let Some(entry) = stat_entry(&self.dir, &self.root, name, raw) else {
                debug!(name = %name, "Entry vanished during listing");
                continue;
            };
            if written > 0 {
                buf.put_u8(b',');
            }
            if let Err(e) = serde_json::to_writer((&mut buf).writer(), &entry) {
                let _ = tx.blocking_send(Err(io::Error::other(e)));
                return written;
            }
            written += 1;

            if buf.len() >= self.chunk_size {
                if tx.blocking_send(Ok(buf.split().freeze())).is_err() {
                    debug!(path = %self.logical, written, "Listing client went away");
                    return written;
                }
            }
        }

        buf.put_slice(b"]}");
        if tx.blocking_send(Ok(buf.freeze())).is_err() {
            debug!(path = %self.logical, "Listing client went away");
        }
        written
    }
}
