//! # layer-updates
//!
//! Update ingestion core for Telegram-style sequenced update streams.
//!
//! ## Features
//! - Typed update model with a closed variant set and an `Unknown` fallback
//! - O(1) tag → handler dispatch; every known tag has exactly one slot
//! - Per-stream `seq` / `pts` / `date` cursors (account-wide and per channel)
//!   behind a pluggable [`SequenceStore`] (memory, binary file, SQLite)
//! - Gap detection with exact successor semantics; stale deliveries dropped
//! - `getDifference` / `getChannelDifference` recovery with replay of the
//!   recovered updates, never re-entering recovery
//! - Per-stream locking: channels recover in parallel with the global stream
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use layer_updates::{Config, HandlerRegistry, UpdateEnvelope, UpdatesHandler};
//! use layer_updates::update::UpdateNewMessage;
//! # async fn demo(transport: Arc<dyn layer_updates::DifferenceTransport>, raw: layer_updates::update::Update)
//! #     -> Result<(), layer_updates::RecoveryError> {
//! let handlers = HandlerRegistry::new()
//!     .on(|u: UpdateNewMessage, _| println!("{}", u.message.message));
//! let updates = UpdatesHandler::new(Config::new(transport), handlers);
//!
//! updates.handle(UpdateEnvelope::new(raw).with_seq(42, 0)).await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod errors;
pub mod difference;
pub mod dispatch;
pub mod entities;
pub mod envelope;
pub mod pts;
pub mod store;
pub mod update;

pub use difference::{Difference, DifferenceSnapshot, DifferenceTransport, RecoveryPhase, RecoveryReport};
pub use dispatch::{Dispatcher, HandlerRegistry};
pub use entities::{EntityCache, UserChatStore};
pub use envelope::UpdateEnvelope;
pub use errors::{RecoveryError, RpcError, TransportError};
pub use pts::{SeqCheck, SequenceState, StreamGuard, StreamKey, StreamState};
pub use store::{BinaryFileStore, InMemoryStore, SequenceStore};
#[cfg(feature = "sqlite-store")]
pub use store::SqliteStore;
pub use update::{Update, UpdateTag};

use std::sync::Arc;
use std::time::Duration;

use difference::GapRecovery;
use update::{Chat, User};

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`UpdatesHandler::new`].
#[derive(Clone)]
pub struct Config {
    /// Fetches differences from the server.
    pub transport:             Arc<dyn DifferenceTransport>,
    /// Stream cursor persistence (default: in-memory).
    pub store:                 Arc<dyn SequenceStore>,
    /// Receives users and chats from batches and differences (default: [`EntityCache`]).
    pub entities:              Arc<dyn UserChatStore>,
    /// Deadline for one difference request (default: 30 s, `None` to wait forever).
    pub fetch_timeout:         Option<Duration>,
    /// Most difference slices followed in one recovery cycle (default: 32).
    pub max_difference_slices: u32,
}

impl Config {
    /// Defaults for everything except the transport.
    pub fn new(transport: Arc<dyn DifferenceTransport>) -> Self {
        Self {
            transport,
            store:                 Arc::new(InMemoryStore::new()),
            entities:              Arc::new(EntityCache::new()),
            fetch_timeout:         Some(Duration::from_secs(30)),
            max_difference_slices: 32,
        }
    }
}

// ─── Ingested ─────────────────────────────────────────────────────────────────

/// What [`UpdatesHandler::handle`] did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Dispatched; the cursor advanced if the envelope asked for it.
    Applied,
    /// Already applied (`seq <= current`); dropped without dispatch.
    Stale { current: i32, got: i32 },
    /// A recovery cycle ran.  Either a gap was found (the envelope itself is
    /// superseded by the difference and not dispatched), or the envelope was
    /// dispatched and asked for its channel to be resynced.
    Recovered(RecoveryReport),
}

// ─── UpdatesContainer ─────────────────────────────────────────────────────────

/// A batch of updates sharing one `seq_start..=seq` range (`updates` /
/// `updatesCombined`), together with the users and chats they reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatesContainer {
    pub updates:   Vec<Update>,
    pub users:     Vec<User>,
    pub chats:     Vec<Chat>,
    pub date:      i32,
    /// `0` when the container has no distinct range start.
    pub seq_start: i32,
    pub seq:       i32,
}

// ─── UpdatesHandler ───────────────────────────────────────────────────────────

struct HandlerInner {
    dispatcher: Dispatcher,
    sequence:   SequenceState,
    recovery:   GapRecovery,
    entities:   Arc<dyn UserChatStore>,
}

/// Entry point for every update the client receives.  Cheap to clone;
/// internally Arc-wrapped.
#[derive(Clone)]
pub struct UpdatesHandler {
    inner: Arc<HandlerInner>,
}

impl UpdatesHandler {
    pub fn new(config: Config, handlers: HandlerRegistry) -> Self {
        tracing::debug!(
            "[layer-updates] Starting with {} store, fetch timeout {:?}",
            config.store.name(), config.fetch_timeout
        );
        let inner = HandlerInner {
            dispatcher: Dispatcher::new(handlers),
            sequence:   SequenceState::new(config.store),
            recovery:   GapRecovery::new(
                config.transport,
                config.entities.clone(),
                config.fetch_timeout,
                config.max_difference_slices,
            ),
            entities:   config.entities,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn dispatcher(&self) -> &Dispatcher { &self.inner.dispatcher }

    pub fn sequence(&self) -> &SequenceState { &self.inner.sequence }

    /// Current cursor of `key`.
    pub fn state(&self, key: StreamKey) -> Result<StreamState, RecoveryError> {
        Ok(self.inner.sequence.get(key)?)
    }

    /// Where the recovery cycle of `key` currently is.
    pub fn recovery_phase(&self, key: StreamKey) -> RecoveryPhase {
        self.inner.recovery.phase(key)
    }

    // ── Processing ─────────────────────────────────────────────────────────

    /// Dispatch `envelope`, then advance its stream's cursor if the envelope
    /// asks for it.
    ///
    /// Dispatch happens regardless of sequence validity; use [`Self::handle`]
    /// for live traffic that still has to be validated.  Store failures are
    /// logged, never returned.
    pub async fn process_update(&self, envelope: UpdateEnvelope) {
        if envelope.is_update_pts() {
            let guard = self.inner.sequence.lock(envelope.stream_key()).await;
            self.process_locked(envelope, Some(&guard));
        } else {
            self.process_locked(envelope, None);
        }
    }

    fn process_locked(&self, envelope: UpdateEnvelope, guard: Option<&StreamGuard>) {
        tracing::debug!("[layer-updates] Received update: {:?}", envelope.payload());
        let advance = envelope.is_update_pts().then(|| {
            (envelope.stream_key(), envelope.pts(), envelope.seq(), envelope.date())
        });

        self.inner.dispatcher.dispatch(envelope);

        let (Some((key, pts, seq, date)), Some(guard)) = (advance, guard) else { return };
        if guard.key() != key {
            tracing::warn!("[layer-updates] Not advancing {key}: lock held for {}", guard.key());
            return;
        }
        if let Err(e) = self.inner.sequence.advance(guard, pts, seq, date) {
            tracing::warn!("[layer-updates] Failed to advance {key}: {e}");
        }
    }

    /// The replay path used by recovery: dispatch only, never advance.
    fn replay(&self, envelope: UpdateEnvelope) {
        debug_assert!(!envelope.is_update_pts() && !envelope.is_pts_check_enabled());
        self.process_locked(envelope, None);
    }

    /// Validate and process one live envelope.
    ///
    /// With pts checking enabled and a `seq` present, the envelope is applied
    /// only if it directly follows the stream's cursor.  Stale envelopes are
    /// dropped; a gap runs a recovery cycle before anything else on the
    /// stream is evaluated.  A `ChannelTooLong` update received outside a
    /// difference triggers that channel's recovery after it is dispatched.
    ///
    /// Only a failed recovery is returned as an error.
    pub async fn handle(&self, envelope: UpdateEnvelope) -> Result<Ingested, RecoveryError> {
        let key = envelope.stream_key();
        let resync = match envelope.payload() {
            Update::ChannelTooLong(u) if !envelope.is_getting_differences() => Some(u.channel_id),
            _ => None,
        };

        let outcome = {
            let guard = self.inner.sequence.lock(key).await;
            let check = match envelope.seq() {
                Some(seq) if envelope.is_pts_check_enabled() => {
                    self.inner.sequence.check_seq(&guard, seq, envelope.seq_start())?
                }
                _ => SeqCheck::Apply,
            };
            match check {
                SeqCheck::Apply => {
                    self.process_locked(envelope, Some(&guard));
                    Ingested::Applied
                }
                SeqCheck::Stale { current, got } => {
                    tracing::debug!("[layer-updates] Stale update on {key} (seq={got}, current={current}), discarding");
                    return Ok(Ingested::Stale { current, got });
                }
                SeqCheck::Gap { expected, got } => {
                    tracing::warn!("[layer-updates] seq gap on {key}: expected {expected}, got {got}, fetching difference");
                    Ingested::Recovered(self.recover_locked(&guard).await?)
                }
            }
        };

        match (outcome, resync) {
            (Ingested::Applied, Some(channel_id)) => {
                tracing::info!("[layer-updates] Channel {channel_id} too long, fetching its difference");
                Ok(Ingested::Recovered(self.get_channel_differences(channel_id).await?))
            }
            (outcome, _) => Ok(outcome),
        }
    }

    /// Validate and process a batch sharing one seq range.
    ///
    /// The batch is checked once against the global cursor; if it applies,
    /// its users and chats are ingested, every update is dispatched, and the
    /// cursor advances to the batch's `seq` and `date`.
    pub async fn handle_container(&self, container: UpdatesContainer) -> Result<Ingested, RecoveryError> {
        let guard = self.inner.sequence.lock(StreamKey::Global).await;
        let check = if container.seq == 0 {
            // No sequence info (e.g. `updateShort`); nothing to validate.
            SeqCheck::Apply
        } else {
            self.inner.sequence.check_seq(&guard, container.seq, container.seq_start)?
        };

        match check {
            SeqCheck::Apply => {
                self.inner.entities.ingest(&container.users, &container.chats);
                let mut resync = Vec::new();
                for update in container.updates {
                    if let Update::ChannelTooLong(u) = &update {
                        resync.push(u.channel_id);
                    }
                    let env = UpdateEnvelope::new(update)
                        .disable_pts_check()
                        .with_date(container.date);
                    if env.stream_key() == StreamKey::Global {
                        self.process_locked(env, Some(&guard));
                    } else {
                        self.process_update(env).await;
                    }
                }
                let seq = (container.seq != 0).then_some(container.seq);
                self.inner.sequence.advance(&guard, None, seq, Some(container.date))?;
                drop(guard);

                let mut outcome = Ingested::Applied;
                for channel_id in resync {
                    outcome = Ingested::Recovered(self.get_channel_differences(channel_id).await?);
                }
                Ok(outcome)
            }
            SeqCheck::Stale { current, got } => {
                tracing::debug!("[layer-updates] Stale container (seq={got}, current={current}), discarding");
                Ok(Ingested::Stale { current, got })
            }
            SeqCheck::Gap { expected, got } => {
                tracing::warn!("[layer-updates] seq gap: expected {expected}, got {got}, fetching difference");
                Ok(Ingested::Recovered(self.recover_locked(&guard).await?))
            }
        }
    }

    /// `true` if a container covering `seq_start..=seq` directly follows the
    /// cursor of `key`.  `date` does not take part in the decision.
    pub fn check_seq(&self, key: StreamKey, seq: i32, seq_start: i32, _date: i32) -> bool {
        match self.inner.sequence.get(key) {
            Ok(state) => state.check_seq(seq, seq_start).can_apply(),
            Err(e) => {
                tracing::warn!("[layer-updates] Failed to read {key}: {e}");
                false
            }
        }
    }

    // ── Recovery ───────────────────────────────────────────────────────────

    /// Fetch and replay the global difference.
    pub async fn get_differences(&self) -> Result<RecoveryReport, RecoveryError> {
        let guard = self.inner.sequence.lock(StreamKey::Global).await;
        self.recover_locked(&guard).await
    }

    /// Fetch and replay the difference of one channel.
    pub async fn get_channel_differences(&self, channel_id: i64) -> Result<RecoveryReport, RecoveryError> {
        let guard = self.inner.sequence.lock(StreamKey::Channel(channel_id)).await;
        self.recover_locked(&guard).await
    }

    /// The server said too much changed to push (`updatesTooLong`); resync.
    pub async fn on_updates_too_long(&self) -> Result<RecoveryReport, RecoveryError> {
        tracing::warn!("[layer-updates] updatesTooLong received, fetching difference");
        self.get_differences().await
    }

    async fn recover_locked(&self, guard: &StreamGuard) -> Result<RecoveryReport, RecoveryError> {
        let replay = |env: UpdateEnvelope| self.replay(env);
        self.inner.recovery.recover(guard, &self.inner.sequence, &replay).await
    }

    // ── State & entities ───────────────────────────────────────────────────

    /// Overwrite the cursor of `key` with an authoritative server state
    /// (e.g. the result of `updates.getState`).
    pub async fn sync_state(&self, key: StreamKey, state: StreamState) -> Result<(), RecoveryError> {
        let guard = self.inner.sequence.lock(key).await;
        self.inner.sequence.set(&guard, state)?;
        tracing::info!("[layer-updates] {key} synced: pts={}, seq={}, date={}", state.pts, state.seq, state.date);
        Ok(())
    }

    /// Ingest users received outside a difference.
    pub fn on_users(&self, users: &[User]) {
        self.inner.entities.ingest(users, &[]);
    }

    /// Ingest chats received outside a difference.
    pub fn on_chats(&self, chats: &[Chat]) {
        self.inner.entities.ingest(&[], chats);
    }
}

impl std::fmt::Debug for UpdatesHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatesHandler")
            .field("dispatcher", &self.inner.dispatcher)
            .field("store", &self.inner.sequence.store_name())
            .finish()
    }
}
