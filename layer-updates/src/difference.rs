//! Gap recovery via `getDifference` / `getChannelDifference`.
//!
//! When a stream falls behind, the missing events are fetched as a
//! *difference* from the stream's last known cursor.  A recovery cycle runs
//! through four phases while holding the stream's lock:
//!
//! 1. **FetchingDifference**: ask the [`DifferenceTransport`], following
//!    slices until the server sends the final part.  Slices are staged in
//!    memory; a failed fetch ends the cycle with nothing committed.
//! 2. **ApplyingDifference**: hand users, then chats, to the
//!    [`UserChatStore`], then commit the last new state.
//! 3. **ReplayingUpdates**: feed every recovered update back through the
//!    normal processing path with pts checking and cursor updates disabled
//!    and `getting_difference` set, so a replay can never start another
//!    recovery or move the cursor again.
//! 4. Back to **Idle**.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::entities::UserChatStore;
use crate::envelope::UpdateEnvelope;
use crate::errors::{RecoveryError, TransportError};
use crate::pts::{SequenceState, StreamGuard, StreamKey, StreamState};
use crate::update::{Chat, Message, Update, UpdateChannelNewMessage, UpdateNewMessage, User};

// ─── Transport interface ──────────────────────────────────────────────────────

/// Everything the server reported as changed since a cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DifferenceSnapshot {
    pub users:         Vec<User>,
    pub chats:         Vec<Chat>,
    /// Messages that arrived while the client was behind.
    pub new_messages:  Vec<Message>,
    pub other_updates: Vec<Update>,
    /// The cursor to continue from.  `None` when the server sent no fresh
    /// state (possible for channel differences); the cursor is then left as is.
    pub new_state:     Option<StreamState>,
}

/// Result of one difference request.
#[derive(Debug, Clone, PartialEq)]
pub enum Difference {
    /// Nothing was missed; only `date` and `seq` move.
    Empty { date: i32, seq: i32 },
    /// The complete difference.
    Snapshot(DifferenceSnapshot),
    /// Part of the difference; fetch again from `new_state` for the rest.
    Slice(DifferenceSnapshot),
}

/// Fetches differences from the server.
///
/// Implementations own the wire format, retries and connection handling; a
/// failed or timed-out request is simply returned as an error.
#[async_trait]
pub trait DifferenceTransport: Send + Sync {
    async fn fetch_difference(
        &self,
        key:     StreamKey,
        current: StreamState,
    ) -> Result<Difference, TransportError>;
}

// ─── Phase tracking ───────────────────────────────────────────────────────────

/// Where a stream's recovery cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPhase {
    #[default]
    Idle,
    FetchingDifference,
    ApplyingDifference,
    ReplayingUpdates,
}

/// Summary of a finished recovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub key:      StreamKey,
    /// How many differences were fetched (more than one if sliced).
    pub slices:   u32,
    /// How many updates were replayed through the dispatcher.
    pub replayed: usize,
    /// The stream's cursor after the cycle.
    pub state:    StreamState,
}

// ─── GapRecovery ──────────────────────────────────────────────────────────────

/// Runs recovery cycles.  Callers must hold the stream's [`StreamGuard`].
pub(crate) struct GapRecovery {
    transport:  Arc<dyn DifferenceTransport>,
    entities:   Arc<dyn UserChatStore>,
    timeout:    Option<Duration>,
    max_slices: u32,
    phases:     Mutex<HashMap<StreamKey, RecoveryPhase>>,
}

impl GapRecovery {
    pub(crate) fn new(
        transport:  Arc<dyn DifferenceTransport>,
        entities:   Arc<dyn UserChatStore>,
        timeout:    Option<Duration>,
        max_slices: u32,
    ) -> Self {
        Self {
            transport,
            entities,
            timeout,
            max_slices: max_slices.max(1),
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn phase(&self, key: StreamKey) -> RecoveryPhase {
        let phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        phases.get(&key).copied().unwrap_or_default()
    }

    fn enter(&self, key: StreamKey, phase: RecoveryPhase) {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        if phase == RecoveryPhase::Idle {
            phases.remove(&key);
        } else {
            phases.insert(key, phase);
        }
    }

    /// Run one full cycle for the guarded stream.
    ///
    /// `replay` is the normal processing path; it receives every recovered
    /// update wrapped with [`UpdateEnvelope::replayed`].
    pub(crate) async fn recover(
        &self,
        guard:    &StreamGuard,
        sequence: &SequenceState,
        replay:   &(dyn Fn(UpdateEnvelope) + Send + Sync),
    ) -> Result<RecoveryReport, RecoveryError> {
        let key    = guard.key();
        let result = self.run(guard, sequence, replay).await;
        self.enter(key, RecoveryPhase::Idle);
        match &result {
            Ok(r) => tracing::info!(
                "[layer-updates] Recovery of {key} done: {} slice(s), {} update(s) replayed, seq={} pts={}",
                r.slices, r.replayed, r.state.seq, r.state.pts
            ),
            Err(e) => tracing::warn!("[layer-updates] Recovery of {key} failed: {e}"),
        }
        result
    }

    async fn run(
        &self,
        guard:    &StreamGuard,
        sequence: &SequenceState,
        replay:   &(dyn Fn(UpdateEnvelope) + Send + Sync),
    ) -> Result<RecoveryReport, RecoveryError> {
        let key        = guard.key();
        let mut cursor = sequence.get(key)?;
        let mut commit = false;
        let mut slices = 0u32;
        let mut staged = Vec::new();

        self.enter(key, RecoveryPhase::FetchingDifference);
        loop {
            tracing::info!(
                "[layer-updates] getDifference for {key} (pts={}, seq={}, date={}) …",
                cursor.pts, cursor.seq, cursor.date
            );
            let diff = self.fetch(key, cursor).await?;
            slices += 1;

            let (snapshot, is_final) = match diff {
                Difference::Empty { date, seq } => {
                    tracing::debug!("[layer-updates] getDifference for {key}: empty (seq={seq})");
                    cursor = StreamState { date, seq, ..cursor };
                    commit = true;
                    break;
                }
                Difference::Snapshot(s) => (s, true),
                Difference::Slice(s)    => (s, false),
            };

            tracing::debug!(
                "[layer-updates] getDifference for {key}: {} messages, {} updates{}",
                snapshot.new_messages.len(),
                snapshot.other_updates.len(),
                if is_final { "" } else { " (slice)" }
            );

            // A slice without a fresh cursor would refetch the same range forever.
            let stuck = snapshot.new_state.is_none();
            if let Some(next) = snapshot.new_state {
                cursor = next;
                commit = true;
            }
            staged.push(snapshot);

            if is_final || stuck || slices >= self.max_slices {
                if !is_final {
                    tracing::warn!(
                        "[layer-updates] Stopping difference for {key} after {slices} slice(s)"
                    );
                }
                break;
            }
        }

        self.enter(key, RecoveryPhase::ApplyingDifference);
        for snapshot in &staged {
            self.entities.ingest(&snapshot.users, &snapshot.chats);
        }
        if commit {
            sequence.set(guard, cursor)?;
        }

        self.enter(key, RecoveryPhase::ReplayingUpdates);
        let mut replayed = 0usize;
        for snapshot in staged {
            for message in snapshot.new_messages {
                replay(UpdateEnvelope::replayed(message_update(key, message)));
                replayed += 1;
            }
            for update in snapshot.other_updates {
                replay(UpdateEnvelope::replayed(update));
                replayed += 1;
            }
        }

        Ok(RecoveryReport { key, slices, replayed, state: cursor })
    }

    async fn fetch(&self, key: StreamKey, current: StreamState) -> Result<Difference, RecoveryError> {
        let request = self.transport.fetch_difference(key, current);
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => Ok(result?),
                Err(_)     => Err(RecoveryError::Timeout(limit)),
            },
            None => Ok(request.await?),
        }
    }
}

/// Recovered messages are replayed as the update that would have carried them.
fn message_update(key: StreamKey, message: Message) -> Update {
    match key {
        StreamKey::Global     => UpdateNewMessage { message, pts: 0, pts_count: 0 }.into(),
        StreamKey::Channel(_) => UpdateChannelNewMessage { message, pts: 0, pts_count: 0 }.into(),
    }
}
