//! Live-path sequencing: seq validation, stale drops and batch containers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use layer_updates::update::{
    Chat, Message, Peer, UpdateChannelNewMessage, UpdateNewMessage, UpdateUserTyping, User,
};
use layer_updates::{
    BinaryFileStore, Config, Difference, DifferenceTransport, HandlerRegistry, Ingested,
    StreamKey, StreamState, TransportError, Update, UpdateEnvelope, UpdateTag, UpdatesContainer,
    UpdatesHandler,
};

// ─── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Difference, TransportError>>>,
    calls:     Mutex<Vec<(StreamKey, StreamState)>>,
}

impl ScriptedTransport {
    fn calls(&self) -> usize { self.calls.lock().unwrap().len() }
}

#[async_trait]
impl DifferenceTransport for ScriptedTransport {
    async fn fetch_difference(&self, key: StreamKey, current: StreamState) -> Result<Difference, TransportError> {
        self.calls.lock().unwrap().push((key, current));
        self.responses.lock().unwrap().pop_front().unwrap_or(Err(TransportError::Dropped))
    }
}

type Seen = Arc<Mutex<Vec<(UpdateTag, bool)>>>;

fn recording_handler(transport: Arc<ScriptedTransport>) -> (UpdatesHandler, Seen) {
    recording_handler_with(Config::new(transport))
}

fn recording_handler_with(config: Config) -> (UpdatesHandler, Seen) {
    let seen: Seen = Arc::default();
    let log = seen.clone();
    let registry = HandlerRegistry::new().on_every_tag(move |u: Update, gd| {
        log.lock().unwrap().push((u.tag().unwrap(), gd));
    });
    (UpdatesHandler::new(config, registry), seen)
}

fn typing(seq: i32, seq_start: i32) -> UpdateEnvelope {
    UpdateEnvelope::new(UpdateUserTyping { user_id: 1 }.into()).with_seq(seq, seq_start)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn gap_free_run_from_empty_state() {
    let transport = Arc::new(ScriptedTransport::default());
    let (updates, seen) = recording_handler(transport.clone());

    for seq in 1..=3 {
        let env = typing(seq, 0).with_date(1_700_000_000 + seq);
        assert_eq!(updates.handle(env).await.unwrap(), Ingested::Applied);
    }

    let state = updates.state(StreamKey::Global).unwrap();
    assert_eq!(state.seq, 3);
    assert_eq!(state.date, 1_700_000_003);
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn successor_applies_and_advances() {
    let transport = Arc::new(ScriptedTransport::default());
    let (updates, seen) = recording_handler(transport.clone());
    updates.sync_state(StreamKey::Global, StreamState::new(100, 10, 1000)).await.unwrap();

    let env = UpdateEnvelope::new(UpdateNewMessage {
        message:   Message { id: 1, message: "hi".into(), ..Default::default() },
        pts:       101,
        pts_count: 1,
    }.into()).with_seq(11, 11).with_date(1001);

    assert_eq!(updates.handle(env).await.unwrap(), Ingested::Applied);
    assert_eq!(updates.state(StreamKey::Global).unwrap(), StreamState::new(101, 11, 1001));
    assert_eq!(*seen.lock().unwrap(), vec![(UpdateTag::NewMessage, false)]);
}

#[tokio::test]
async fn stale_updates_change_nothing() {
    let transport = Arc::new(ScriptedTransport::default());
    let (updates, seen) = recording_handler(transport.clone());
    updates.sync_state(StreamKey::Global, StreamState::new(100, 10, 1000)).await.unwrap();

    assert_eq!(updates.handle(typing(10, 0)).await.unwrap(), Ingested::Stale { current: 10, got: 10 });
    assert_eq!(updates.handle(typing(7, 5)).await.unwrap(), Ingested::Stale { current: 10, got: 7 });

    assert_eq!(updates.state(StreamKey::Global).unwrap(), StreamState::new(100, 10, 1000));
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn saturated_seq_drops_instead_of_overflowing() {
    let transport = Arc::new(ScriptedTransport::default());
    let (updates, seen) = recording_handler(transport.clone());
    let max = StreamState::new(0, i32::MAX, 0);
    updates.sync_state(StreamKey::Global, max).await.unwrap();

    assert_eq!(updates.handle(typing(5, 0)).await.unwrap(), Ingested::Stale { current: i32::MAX, got: 5 });
    let container = UpdatesContainer { seq_start: 6, seq: 7, ..Default::default() };
    assert_eq!(
        updates.handle_container(container).await.unwrap(),
        Ingested::Stale { current: i32::MAX, got: 7 }
    );
    assert!(!updates.check_seq(StreamKey::Global, 5, 0, 0));

    assert_eq!(updates.state(StreamKey::Global).unwrap(), max);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn check_seq_reports_successor_only() {
    let (updates, _) = recording_handler(Arc::new(ScriptedTransport::default()));
    updates.sync_state(StreamKey::Global, StreamState::new(0, 10, 0)).await.unwrap();

    assert!(updates.check_seq(StreamKey::Global, 11, 0, 0));
    assert!(updates.check_seq(StreamKey::Global, 13, 11, 0));
    assert!(!updates.check_seq(StreamKey::Global, 15, 15, 0));
    assert!(!updates.check_seq(StreamKey::Global, 10, 0, 0));
    // Channel streams have their own cursor.
    assert!(updates.check_seq(StreamKey::Channel(5), 1, 0, 0));
}

#[tokio::test]
async fn unchecked_envelopes_skip_validation() {
    let transport = Arc::new(ScriptedTransport::default());
    let (updates, seen) = recording_handler(transport.clone());
    updates.sync_state(StreamKey::Global, StreamState::new(0, 10, 0)).await.unwrap();

    // Would be a gap if checked.
    let env = typing(40, 40).disable_pts_check();
    assert_eq!(updates.handle(env).await.unwrap(), Ingested::Applied);
    assert_eq!(updates.state(StreamKey::Global).unwrap().seq, 40);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn process_update_without_update_pts_leaves_state() {
    let (updates, seen) = recording_handler(Arc::new(ScriptedTransport::default()));
    updates.sync_state(StreamKey::Global, StreamState::new(5, 5, 5)).await.unwrap();

    let env = UpdateEnvelope::new(UpdateNewMessage {
        message: Message::default(), pts: 99, pts_count: 1,
    }.into()).with_seq(6, 0).disable_update_pts();
    updates.process_update(env).await;

    assert_eq!(updates.state(StreamKey::Global).unwrap(), StreamState::new(5, 5, 5));
    assert_eq!(*seen.lock().unwrap(), vec![(UpdateTag::NewMessage, false)]);
}

#[tokio::test]
async fn channel_update_advances_channel_stream_only() {
    let (updates, _) = recording_handler(Arc::new(ScriptedTransport::default()));

    let env = UpdateEnvelope::new(UpdateChannelNewMessage {
        message:   Message { id: 3, peer_id: Some(Peer::Channel(5)), ..Default::default() },
        pts:       12,
        pts_count: 1,
    }.into());
    updates.process_update(env).await;

    assert_eq!(updates.state(StreamKey::Channel(5)).unwrap().pts, 12);
    assert_eq!(updates.state(StreamKey::Global).unwrap(), StreamState::default());
}

#[tokio::test]
async fn container_is_checked_once_and_advanced_once() {
    let transport = Arc::new(ScriptedTransport::default());
    let (updates, seen) = recording_handler(transport.clone());
    updates.sync_state(StreamKey::Global, StreamState::new(100, 10, 1000)).await.unwrap();

    let container = UpdatesContainer {
        updates: vec![
            UpdateNewMessage { message: Message::default(), pts: 101, pts_count: 1 }.into(),
            UpdateUserTyping { user_id: 1 }.into(),
        ],
        users:     vec![User { id: 1, access_hash: Some(11), ..Default::default() }],
        chats:     vec![Chat::Group { id: 2, title: "g".into() }],
        date:      1010,
        seq_start: 11,
        seq:       12,
    };
    assert_eq!(updates.handle_container(container.clone()).await.unwrap(), Ingested::Applied);
    assert_eq!(updates.state(StreamKey::Global).unwrap(), StreamState::new(101, 12, 1010));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(UpdateTag::NewMessage, false), (UpdateTag::UserTyping, false)]
    );

    // Delivered again: already applied.
    assert_eq!(
        updates.handle_container(container).await.unwrap(),
        Ingested::Stale { current: 12, got: 12 }
    );
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn cursor_survives_restart_with_file_store() {
    let path = std::env::temp_dir().join(format!("layer-updates-restart-{}.bin", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let mut config = Config::new(Arc::new(ScriptedTransport::default()));
    config.store = Arc::new(BinaryFileStore::new(&path));
    let (updates, _) = recording_handler_with(config.clone());
    updates.handle(typing(1, 0).with_date(50)).await.unwrap();
    updates.handle(typing(2, 0).with_date(60)).await.unwrap();
    drop(updates);

    config.store = Arc::new(BinaryFileStore::new(&path));
    let (restarted, _) = recording_handler_with(config);
    assert_eq!(restarted.state(StreamKey::Global).unwrap(), StreamState::new(0, 2, 60));
    assert_eq!(restarted.handle(typing(2, 0)).await.unwrap(), Ingested::Stale { current: 2, got: 2 });

    std::fs::remove_file(&path).unwrap();
}
