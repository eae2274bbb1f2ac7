//! Pluggable persistence for stream cursors.
//!
//! The [`SequenceStore`] trait abstracts over where `(pts, seq, date)` per
//! stream is kept, so callers can swap in a file, an SQLite database, an
//! in-memory map, or anything else.  The core treats the store as the
//! authority and reads through it on every check.
//!
//! Built-in stores:
//! * [`InMemoryStore`]: nothing survives a restart (default).
//! * [`BinaryFileStore`]: one compact binary file for every stream.
//! * [`SqliteStore`]: SQLite (requires the `sqlite-store` Cargo feature).

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::pts::{StreamKey, StreamState};

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Where and how stream cursors are persisted.
pub trait SequenceStore: Send + Sync {
    /// Load the cursor of `key`, or `None` if the stream was never stored.
    fn load(&self, key: StreamKey) -> io::Result<Option<StreamState>>;

    /// Persist the cursor of `key`.
    fn save(&self, key: StreamKey, state: StreamState) -> io::Result<()>;

    /// Forget the cursor of `key` (e.g. after leaving a channel).
    fn delete(&self, key: StreamKey) -> io::Result<()>;

    /// Human-readable name of this store (for log messages).
    fn name(&self) -> &str;
}

// ─── InMemoryStore ────────────────────────────────────────────────────────────

/// An ephemeral store that keeps nothing on disk.
///
/// Useful for testing or for bots that resync from `getState` on start.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<BTreeMap<StreamKey, StreamState>>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl SequenceStore for InMemoryStore {
    fn load(&self, key: StreamKey) -> io::Result<Option<StreamState>> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(&key).copied())
    }

    fn save(&self, key: StreamKey, state: StreamState) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.insert(key, state);
        Ok(())
    }

    fn delete(&self, key: StreamKey) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.remove(&key);
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── BinaryFileStore ──────────────────────────────────────────────────────────

const KIND_GLOBAL:  u8 = 0;
const KIND_CHANNEL: u8 = 1;
const ENTRY_LEN:    usize = 1 + 8 + 4 + 4 + 4;

/// Keeps every stream in one little-endian binary file.
///
/// Layout: `count: u32`, then `count` entries of
/// `kind: u8, channel_id: i64, pts: i32, seq: i32, date: i32`.
/// The file is re-read on every `load`; writes rewrite it whole.
pub struct BinaryFileStore {
    path: PathBuf,
    // Serialises read-modify-write cycles of this process.
    write_lock: Mutex<()>,
}

impl BinaryFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    fn read_all(&self) -> io::Result<BTreeMap<StreamKey, StreamState>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        decode(&std::fs::read(&self.path)?)
    }

    fn write_all(&self, map: &BTreeMap<StreamKey, StreamState>) -> io::Result<()> {
        std::fs::write(&self.path, encode(map))
    }
}

impl SequenceStore for BinaryFileStore {
    fn load(&self, key: StreamKey) -> io::Result<Option<StreamState>> {
        Ok(self.read_all()?.get(&key).copied())
    }

    fn save(&self, key: StreamKey, state: StreamState) -> io::Result<()> {
        let _w = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_all()?;
        map.insert(key, state);
        self.write_all(&map)
    }

    fn delete(&self, key: StreamKey) -> io::Result<()> {
        let _w = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_all()?;
        if map.remove(&key).is_some() {
            self.write_all(&map)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

fn encode(map: &BTreeMap<StreamKey, StreamState>) -> Vec<u8> {
    let mut b = Vec::with_capacity(4 + map.len() * ENTRY_LEN);
    b.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (key, state) in map {
        let (kind, id) = match key {
            StreamKey::Global      => (KIND_GLOBAL, 0i64),
            StreamKey::Channel(id) => (KIND_CHANNEL, *id),
        };
        b.push(kind);
        b.extend_from_slice(&id.to_le_bytes());
        b.extend_from_slice(&state.pts.to_le_bytes());
        b.extend_from_slice(&state.seq.to_le_bytes());
        b.extend_from_slice(&state.date.to_le_bytes());
    }
    b
}

fn decode(buf: &[u8]) -> io::Result<BTreeMap<StreamKey, StreamState>> {
    let mut p = 0usize;
    macro_rules! r {
        ($n:literal) => {{
            if p + $n > buf.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated sequence file"));
            }
            let mut a = [0u8; $n];
            a.copy_from_slice(&buf[p..p + $n]);
            p += $n;
            a
        }};
    }
    let count = u32::from_le_bytes(r!(4)) as usize;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let kind = r!(1)[0];
        let id   = i64::from_le_bytes(r!(8));
        let pts  = i32::from_le_bytes(r!(4));
        let seq  = i32::from_le_bytes(r!(4));
        let date = i32::from_le_bytes(r!(4));
        let key = match kind {
            KIND_GLOBAL  => StreamKey::Global,
            KIND_CHANNEL => StreamKey::Channel(id),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown stream kind {other}"),
                ));
            }
        };
        map.insert(key, StreamState { pts, seq, date });
    }
    Ok(map)
}

// ─── SqliteStore ──────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-store")]
pub use sqlite_store::SqliteStore;

#[cfg(feature = "sqlite-store")]
mod sqlite_store {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    /// SQLite-backed cursor store.
    ///
    /// Creates the `stream_state` table if it does not exist.
    ///
    /// Enable with the `sqlite-store` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// layer-updates = { version = "*", features = ["sqlite-store"] }
    /// ```
    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    fn to_io(e: rusqlite::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    // Global stream is stored as channel_id 0 with kind 0.
    fn columns(key: StreamKey) -> (i64, i64) {
        match key {
            StreamKey::Global      => (KIND_GLOBAL as i64, 0),
            StreamKey::Channel(id) => (KIND_CHANNEL as i64, id),
        }
    }

    impl SqliteStore {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path: PathBuf = path.into();
            let conn = Connection::open(&path).map_err(to_io)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS stream_state (
                    kind       INTEGER NOT NULL,
                    channel_id INTEGER NOT NULL,
                    pts        INTEGER NOT NULL,
                    seq        INTEGER NOT NULL,
                    date       INTEGER NOT NULL,
                    PRIMARY KEY (kind, channel_id)
                );",
            ).map_err(to_io)?;
            Ok(Self { conn: Mutex::new(conn) })
        }
    }

    impl SequenceStore for SqliteStore {
        fn load(&self, key: StreamKey) -> io::Result<Option<StreamState>> {
            let (kind, id) = columns(key);
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.query_row(
                "SELECT pts, seq, date FROM stream_state WHERE kind = ?1 AND channel_id = ?2",
                params![kind, id],
                |row| Ok(StreamState { pts: row.get(0)?, seq: row.get(1)?, date: row.get(2)? }),
            )
            .optional()
            .map_err(to_io)
        }

        fn save(&self, key: StreamKey, state: StreamState) -> io::Result<()> {
            let (kind, id) = columns(key);
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute(
                "INSERT OR REPLACE INTO stream_state (kind, channel_id, pts, seq, date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![kind, id, state.pts, state.seq, state.date],
            ).map_err(to_io)?;
            Ok(())
        }

        fn delete(&self, key: StreamKey) -> io::Result<()> {
            let (kind, id) = columns(key);
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute(
                "DELETE FROM stream_state WHERE kind = ?1 AND channel_id = ?2",
                params![kind, id],
            ).map_err(to_io)?;
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("layer-updates-{tag}-{}.bin", std::process::id()))
    }

    #[test]
    fn in_memory_roundtrip_and_delete() {
        let store = InMemoryStore::new();
        assert_eq!(store.load(StreamKey::Global).unwrap(), None);
        store.save(StreamKey::Global, StreamState::new(1, 2, 3)).unwrap();
        assert_eq!(store.load(StreamKey::Global).unwrap(), Some(StreamState::new(1, 2, 3)));
        store.delete(StreamKey::Global).unwrap();
        assert_eq!(store.load(StreamKey::Global).unwrap(), None);
    }

    #[test]
    fn binary_file_keeps_streams_apart() {
        let path = scratch_path("streams");
        let store = BinaryFileStore::new(&path);
        store.save(StreamKey::Global, StreamState::new(100, 10, 1_700_000_000)).unwrap();
        store.save(StreamKey::Channel(-1001), StreamState::new(55, 0, 0)).unwrap();

        // A second instance sees what the first one wrote.
        let reopened = BinaryFileStore::new(&path);
        assert_eq!(reopened.load(StreamKey::Global).unwrap(), Some(StreamState::new(100, 10, 1_700_000_000)));
        assert_eq!(reopened.load(StreamKey::Channel(-1001)).unwrap(), Some(StreamState::new(55, 0, 0)));
        assert_eq!(reopened.load(StreamKey::Channel(7)).unwrap(), None);

        reopened.delete(StreamKey::Channel(-1001)).unwrap();
        assert_eq!(store.load(StreamKey::Channel(-1001)).unwrap(), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn truncated_file_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert(StreamKey::Global, StreamState::new(1, 1, 1));
        let bytes = encode(&map);
        let err = decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
