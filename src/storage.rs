//! Local storage adapter for the served directory
//!
//! Every operation takes a client-supplied name and resolves it to the base
//! component under the served root. A name that cannot be reduced to a plain
//! file name ("..", "/", empty, NUL) is rejected before any filesystem call.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;

use crate::protocol::FileEntry;

/// Metadata for a single file as reported by /info
#[derive(Clone, Debug)]
pub struct FileStat {
    pub size: u64,
    pub created_at: String,
    pub modified_at: String,
}

/// Reduce a client-supplied name to its base component.
pub fn sanitize_name(name: &str) -> Result<String> {
    if name.is_empty() {
        bail!("empty filename");
    }
    if name.contains('\0') {
        bail!("filename contains NUL byte");
    }
    let base = match Path::new(name).file_name() {
        Some(b) => b.to_string_lossy().into_owned(),
        None => bail!("filename has no base component: {name}"),
    };
    if base.is_empty() || base == "." || base == ".." {
        bail!("filename has no base component: {name}");
    }
    Ok(base)
}

fn rfc3339(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339()
}

// Distinguishes staged write targets when sessions upload the same name
static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Storage { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied name to a path directly under the root
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_name(name)?))
    }

    /// Enumerate plain files under the root, sorted by name. Dot-prefixed
    /// names stay hidden; staged upload targets live there.
    pub async fn list(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut rd = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("read_dir {}", self.root.display()))?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(FileEntry {
                name,
                size: meta.len(),
                modified_at: rfc3339(modified),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Size and timestamps for one file, None if absent
    pub async fn stat(&self, name: &str) -> Result<Option<FileStat>> {
        let path = self.resolve(name)?;
        let meta = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        // Creation time is unavailable on some filesystems
        let created = meta.created().unwrap_or(modified);
        Ok(Some(FileStat {
            size: meta.len(),
            created_at: rfc3339(created),
            modified_at: rfc3339(modified),
        }))
    }

    /// Full content of one file, None if absent
    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Remove one file. Returns false if it did not exist.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }

    /// Unique staged path for an in-progress write to `name`. Staging keeps
    /// half-written uploads out of reads; the finished file moves into place
    /// with one rename, so a name only ever resolves to complete content.
    pub fn stage_path(&self, name: &str) -> Result<PathBuf> {
        let base = sanitize_name(name)?;
        let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        Ok(self.root.join(format!(".{base}.{seq}.part")))
    }

    /// Open a file for streaming, with its length. None if absent.
    pub async fn open_read(&self, name: &str) -> Result<Option<(fs::File, u64)>> {
        let path = self.resolve(name)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        let len = file.metadata().await?.len();
        Ok(Some((file, len)))
    }
}
