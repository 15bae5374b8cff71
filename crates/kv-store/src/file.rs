//! File-backed store
//!
//! Keeps every entry in one JSON object on disk. All writes use atomic
//! temp-file + rename so a crash mid-write never corrupts the ledger.
//!
//! Updates land in the in-memory map immediately; disk writes are coalesced.
//! A writer that finds its change already covered by a newer write returns
//! without touching the disk, so a burst of updates costs one or two file
//! rewrites rather than one each. Every call still returns only once its
//! change is on disk. The whole map is rewritten each time, which suits a
//! single node with a modest credential count; use the Redis backend for
//! shared or high-throughput deployments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{MutexGuard, PoisonError};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{BoxFuture, KvStore};

struct Entries {
    map: HashMap<String, String>,
    /// Bumped on every update
    version: u64,
}

pub struct FileStore {
    path: PathBuf,
    entries: std::sync::Mutex<Entries>,
    /// Version of the map last written to disk; held across the write
    written: Mutex<u64>,
    disk_writes: AtomicU64,
}

impl FileStore {
    /// Load entries from the given file path.
    ///
    /// A missing file is created as `{}` so the next start skips the
    /// cold-start path. A present but malformed file is an error.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let map = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded store file");
            entries
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            entries: std::sync::Mutex::new(Entries { map, version: 0 }),
            written: Mutex::new(0),
            disk_writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of file rewrites since load.
    pub fn disk_writes(&self) -> u64 {
        self.disk_writes.load(Ordering::Relaxed)
    }

    fn lock_entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to the map and return the resulting version.
    fn update(&self, update: impl FnOnce(&mut HashMap<String, String>)) -> u64 {
        let mut entries = self.lock_entries();
        update(&mut entries.map);
        entries.version += 1;
        entries.version
    }

    /// Make sure the file holds at least `version`.
    async fn flush_through(&self, version: u64) -> Result<()> {
        let mut written = self.written.lock().await;
        if *written >= version {
            return Ok(());
        }
        let (snapshot, latest) = {
            let entries = self.lock_entries();
            (entries.map.clone(), entries.version)
        };
        write_atomic(&self.path, &snapshot).await?;
        *written = latest;
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl KvStore for FileStore {
    fn id(&self) -> &str {
        "file"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.lock_entries().map.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let version = self.update(|map| {
                map.insert(key.to_string(), value);
            });
            self.flush_through(version).await
        })
    }

    fn set_many(&self, entries: Vec<(String, String)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let version = self.update(|map| map.extend(entries));
            self.flush_through(version).await
        })
    }
}

/// Write the entry map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Permissions are 0600 on unix since entries name credentials.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".ledger.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), entries = data.len(), "persisted store file");
    Ok(())
}
