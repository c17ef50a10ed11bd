use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::types::ServerRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode server store: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{} is not a valid server store: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What `ServerStore::upsert` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Deduplicated set of discovered servers keyed by address, snapshotted to one JSON file.
///
/// The file is an object mapping `"ip:port"` to the record fields. Not
/// synchronised: a scan funnels every mutation through a single owner.
#[derive(Debug)]
pub struct ServerStore {
    path: PathBuf,
    records: BTreeMap<SocketAddrV4, ServerRecord>,
}

impl ServerStore {
    /// An empty store that will flush to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
        }
    }

    /// Rebuild the store from the last snapshot at `path`.
    ///
    /// A missing or blank file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new(path)),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        if content.trim().is_empty() {
            return Ok(Self::new(path));
        }

        let raw: BTreeMap<String, ServerRecord> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(source) => return Err(StoreError::Corrupt { path, source }),
        };
        let mut records = BTreeMap::new();
        for (key, record) in raw {
            let addr = record.addr();
            if key != addr.to_string() {
                warn!(%key, %addr, "store key disagrees with record address; using the record");
            }
            records.insert(addr, record);
        }
        debug!(path = %path.display(), servers = records.len(), "loaded server store");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, addr: &SocketAddrV4) -> Option<&ServerRecord> {
        self.records.get(addr)
    }

    pub fn records(&self) -> impl Iterator<Item = &ServerRecord> {
        self.records.values()
    }

    pub fn addresses(&self) -> Vec<SocketAddrV4> {
        self.records.keys().copied().collect()
    }

    /// Insert a record or merge it into the existing one for the same address.
    ///
    /// The incoming record wins for every field except `first_seen`, which
    /// keeps the earliest sighting.
    pub fn upsert(&mut self, mut record: ServerRecord) -> Upsert {
        match self.records.get_mut(&record.addr()) {
            Some(existing) => {
                record.first_seen = existing.first_seen.min(record.first_seen);
                *existing = record;
                Upsert::Updated
            }
            None => {
                self.records.insert(record.addr(), record);
                Upsert::Inserted
            }
        }
    }

    /// Drop every record last seen before `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&mut self, cutoff: OffsetDateTime) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.last_seen >= cutoff);
        before - self.records.len()
    }

    /// Records ordered by reported player count, busiest first.
    pub fn by_player_count(&self) -> Vec<&ServerRecord> {
        let mut out: Vec<&ServerRecord> = self.records.values().collect();
        out.sort_by(|a, b| b.player_count.cmp(&a.player_count));
        out
    }

    /// Owned copy of the current record set, writable off the async runtime.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            path: self.path.clone(),
            records: self
                .records
                .iter()
                .map(|(addr, record)| (addr.to_string(), record.clone()))
                .collect(),
        }
    }

    /// Atomically replace the snapshot file with the current record set.
    pub fn flush(&self) -> Result<(), StoreError> {
        let keyed: BTreeMap<String, &ServerRecord> = self
            .records
            .iter()
            .map(|(addr, record)| (addr.to_string(), record))
            .collect();
        write_atomic(&self.path, &keyed)?;
        debug!(path = %self.path.display(), servers = keyed.len(), "flushed server store");
        Ok(())
    }
}

/// Point-in-time copy of a `ServerStore`, keyed by `"ip:port"`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
    records: BTreeMap<String, ServerRecord>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Same contract as `ServerStore::flush`. Blocking; run it on a blocking thread.
    pub fn write(&self) -> Result<(), StoreError> {
        write_atomic(&self.path, &self.records)?;
        debug!(path = %self.path.display(), servers = self.records.len(), "flushed server store");
        Ok(())
    }
}

/// Earliest `last_seen` that survives a prune of records older than `max_age_hours`.
///
/// `None` when the age does not fit the calendar range.
pub fn stale_cutoff(now: OffsetDateTime, max_age_hours: u64) -> Option<OffsetDateTime> {
    let secs = i64::try_from(max_age_hours).ok()?.checked_mul(3600)?;
    now.checked_sub(time::Duration::seconds(secs))
}

/// Write `value` to a sibling temp file, sync it and rename it over `path`,
/// so a reader sees either the old or the new snapshot. The temp file is
/// removed if any step fails.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let tmp = tmp_path(path);
    let written = write_synced(&tmp, value)
        .and_then(|()| fs::rename(&tmp, path).map_err(io_err(path)));
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

fn write_synced<T: Serialize>(tmp: &Path, value: &T) -> Result<(), StoreError> {
    let file = File::create(tmp).map_err(io_err(tmp))?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, value).map_err(StoreError::Encode)?;
    w.flush().map_err(io_err(tmp))?;
    let file = w.into_inner().map_err(|e| io_err(tmp)(e.into_error()))?;
    file.sync_all().map_err(io_err(tmp))
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
