//! Per-stream sequence tracking and gap detection.
//!
//! The server numbers the update containers it pushes with a **seq** and
//! moves a state cursor called **pts** forward for every event it applies.
//! The account has one global stream and every channel has its own.  When
//! the client misses updates, the next container's `seq_start` is no longer
//! the direct successor of the last applied `seq`; this module detects that
//! so the difference can be fetched before anything newer is trusted.
//!
//! All reads and writes go through the configured [`SequenceStore`]; the
//! only thing kept in memory is the per-stream lock table.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::store::SequenceStore;

// ─── StreamKey ────────────────────────────────────────────────────────────────

/// Which sequence stream a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamKey {
    /// The account-wide stream.
    Global,
    /// A channel-specific stream.
    Channel(i64),
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global      => write!(f, "global"),
            Self::Channel(id) => write!(f, "channel {id}"),
        }
    }
}

// ─── StreamState ──────────────────────────────────────────────────────────────

/// The cursor of one stream.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamState {
    /// State cursor.
    pub pts:  i32,
    /// Sequence number of the last applied container.
    pub seq:  i32,
    /// Date of the last known update (Unix timestamp).
    pub date: i32,
}

impl StreamState {
    pub fn new(pts: i32, seq: i32, date: i32) -> Self {
        Self { pts, seq, date }
    }

    /// Classify a container covering `seq_start..=seq` against this cursor.
    ///
    /// A `seq_start` of `0` means the container has no distinct range start.
    pub fn check_seq(&self, seq: i32, seq_start: i32) -> SeqCheck {
        let seq_start = if seq_start == 0 { seq } else { seq_start };
        // A cursor at i32::MAX has no successor; every seq is at or behind it
        // until the stream is resynced.
        let Some(expected) = self.seq.checked_add(1) else {
            return SeqCheck::Stale { current: self.seq, got: seq };
        };
        if seq_start == expected {
            SeqCheck::Apply
        } else if seq <= self.seq {
            SeqCheck::Stale { current: self.seq, got: seq }
        } else {
            SeqCheck::Gap { expected, got: seq_start }
        }
    }

    /// Move the cursor forward; values that would move it back are ignored.
    pub fn advance(&mut self, pts: Option<i32>, seq: Option<i32>, date: Option<i32>) {
        if let Some(pts) = pts  { if pts > self.pts   { self.pts = pts; } }
        if let Some(seq) = seq  { if seq > self.seq   { self.seq = seq; } }
        if let Some(date) = date { if date > self.date { self.date = date; } }
    }
}

/// Outcome of [`StreamState::check_seq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// `seq_start` is the direct successor: apply the container.
    Apply,
    /// Updates are missing between the cursor and this container.
    Gap { expected: i32, got: i32 },
    /// The container was already applied; drop it.
    Stale { current: i32, got: i32 },
}

impl SeqCheck {
    pub fn can_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }
}

// ─── StreamGuard ──────────────────────────────────────────────────────────────

/// Exclusive access to one stream's cursor.
///
/// Every write and every check-then-write sequence requires the guard, so
/// two updates can never both see themselves as the successor of the same
/// `seq`.  Dropping the guard releases the stream.
pub struct StreamGuard {
    key:    StreamKey,
    _guard: OwnedMutexGuard<()>,
}

impl StreamGuard {
    pub fn key(&self) -> StreamKey { self.key }
}

impl std::fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamGuard {{ key: {} }}", self.key)
    }
}

// ─── SequenceState ────────────────────────────────────────────────────────────

/// Keyed access to stream cursors with one async lock per stream.
///
/// Different streams never contend with each other.
pub struct SequenceState {
    store: Arc<dyn SequenceStore>,
    locks: Mutex<HashMap<StreamKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SequenceState {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self { store, locks: Mutex::new(HashMap::new()) }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Locks nobody holds or waits on are pruned here, so the table only
    /// keeps entries for streams that are currently in use.
    pub async fn lock(&self, key: StreamKey) -> StreamGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Holders and waiters each own a clone of the `Arc`.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key).or_default().clone()
        };
        StreamGuard { key, _guard: lock.lock_owned().await }
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Current cursor of `key`; a stream never seen before starts at zero.
    pub fn get(&self, key: StreamKey) -> io::Result<StreamState> {
        Ok(self.store.load(key)?.unwrap_or_default())
    }

    /// Overwrite the cursor of the guarded stream.
    pub fn set(&self, guard: &StreamGuard, state: StreamState) -> io::Result<()> {
        self.store.save(guard.key, state)
    }

    /// Validate a container against the guarded stream's cursor.
    pub fn check_seq(&self, guard: &StreamGuard, seq: i32, seq_start: i32) -> io::Result<SeqCheck> {
        Ok(self.get(guard.key)?.check_seq(seq, seq_start))
    }

    /// Move the guarded stream's cursor forward and return the new value.
    pub fn advance(
        &self,
        guard: &StreamGuard,
        pts:   Option<i32>,
        seq:   Option<i32>,
        date:  Option<i32>,
    ) -> io::Result<StreamState> {
        let mut state = self.get(guard.key)?;
        let before = state;
        state.advance(pts, seq, date);
        if state != before {
            self.set(guard, state)?;
        }
        Ok(state)
    }

    /// Name of the backing store (for log messages).
    pub fn store_name(&self) -> &str { self.store.name() }
}
