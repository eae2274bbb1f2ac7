//! layer-app: scripted walk-through of the update pipeline.
//!
//! Plays a short, fixed session against an in-process fake server:
//! live updates, a duplicate, a seq gap with `getDifference` recovery,
//! `updateChannelTooLong`, and a combined container.
//!
//!   cargo run -p layer-app
//!
//! Raise verbosity with `RUST_LOG=layer_updates=debug`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use layer_updates::update::{
    Chat, Message, Peer, UpdateChannelNewMessage, UpdateChannelTooLong, UpdateNewMessage,
    UpdateUserStatus, UpdateUserTyping, User,
};
use layer_updates::{
    Config, Difference, DifferenceSnapshot, DifferenceTransport, EntityCache, HandlerRegistry,
    Ingested, StreamKey, StreamState, TransportError, UpdateEnvelope, UpdatesContainer,
    UpdatesHandler,
};

const NEWS_CHANNEL: i64 = 1001;
const ALICE:        i64 = 42;

// ── Fake server ───────────────────────────────────────────────────────────────

/// Answers difference requests from a per-stream script.
#[derive(Default)]
struct ScriptedServer {
    script: Mutex<HashMap<StreamKey, VecDeque<Difference>>>,
}

impl ScriptedServer {
    fn push(&self, key: StreamKey, diff: Difference) {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).entry(key).or_default().push_back(diff);
    }
}

#[async_trait]
impl DifferenceTransport for ScriptedServer {
    async fn fetch_difference(&self, key: StreamKey, current: StreamState) -> Result<Difference, TransportError> {
        stamp(&format!("→ server: difference for {key} from seq={} pts={}", current.seq, current.pts));
        // Simulated round trip.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&key).and_then(VecDeque::pop_front);
        Ok(next.unwrap_or(Difference::Empty { date: current.date, seq: current.seq }))
    }
}

fn stamp(line: &str) {
    println!("[{}] {line}", Utc::now().format("%H:%M:%S%.3f"));
}

fn text(id: i32, peer: Peer, body: &str) -> Message {
    Message {
        id,
        peer_id: Some(peer),
        from_id: Some(Peer::User(ALICE)),
        date:    Utc::now().timestamp() as i32,
        message: body.to_string(),
        out:     false,
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        // SAFETY: single-threaded at this point, no other threads reading env
        unsafe { std::env::set_var("RUST_LOG", "layer_updates=info,layer_app=info"); }
    }
    env_logger::init();

    if let Err(e) = run().await {
        eprintln!("\n✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let server   = Arc::new(ScriptedServer::default());
    let entities = Arc::new(EntityCache::new());

    let mut config = Config::new(server.clone());
    config.entities = entities.clone();

    let handlers = HandlerRegistry::new()
        .on(|u: UpdateNewMessage, replayed| {
            let tag = if replayed { " (recovered)" } else { "" };
            stamp(&format!("📨 message #{}: {}{tag}", u.message.id, u.message.message));
        })
        .on(|u: UpdateChannelNewMessage, replayed| {
            let tag = if replayed { " (recovered)" } else { "" };
            let channel = u.message.channel_id().unwrap_or_default();
            stamp(&format!("📣 channel {channel} post #{}: {}{tag}", u.message.id, u.message.message));
        })
        .on(|u: UpdateUserTyping, _| stamp(&format!("⌨️  user {} is typing", u.user_id)))
        .on(|u: UpdateUserStatus, _| {
            let status = if u.expires.is_some() { "online" } else { "offline" };
            stamp(&format!("👤 user {} is {status}", u.user_id));
        })
        .on(|u: UpdateChannelTooLong, _| stamp(&format!("⚠️  channel {} fell too far behind", u.channel_id)))
        .on_unsupported(|raw| stamp(&format!("⚙️  unsupported update {:#010x}", raw.constructor_id)));

    let updates = UpdatesHandler::new(config, handlers);
    let now = Utc::now().timestamp() as i32;

    // What the server will answer once the client notices it fell behind.
    server.push(StreamKey::Global, Difference::Snapshot(DifferenceSnapshot {
        users:         vec![User { id: ALICE, access_hash: Some(0x5eed), first_name: Some("Alice".into()), ..Default::default() }],
        new_messages:  vec![
            text(12, Peer::User(ALICE), "did you get my last two messages?"),
            text(13, Peer::User(ALICE), "hello??"),
        ],
        other_updates: vec![UpdateUserStatus { user_id: ALICE, expires: Some(now + 300) }.into()],
        new_state:     Some(StreamState::new(1_013, 20, now)),
        ..Default::default()
    }));
    server.push(StreamKey::Channel(NEWS_CHANNEL), Difference::Snapshot(DifferenceSnapshot {
        chats:        vec![Chat::Channel { id: NEWS_CHANNEL, access_hash: Some(0xc0ffee), title: "News".into(), megagroup: false }],
        new_messages: vec![text(501, Peer::Channel(NEWS_CHANNEL), "breaking: something happened")],
        new_state:    Some(StreamState::new(60, 0, now)),
        ..Default::default()
    }));

    // ── 1. Start from the server's getState ────────────────────────────
    updates.sync_state(StreamKey::Global, StreamState::new(1_010, 10, now)).await?;
    println!("\n── live traffic ──");

    let live = UpdateEnvelope::new(UpdateNewMessage {
        message:   text(11, Peer::User(ALICE), "hi there"),
        pts:       1_011,
        pts_count: 1,
    }.into()).with_seq(11, 0).with_date(now);
    report(updates.handle(live.clone()).await?);

    // ── 2. The same container delivered twice ─────────────────────────
    println!("\n── duplicate delivery ──");
    report(updates.handle(live).await?);

    // ── 3. seq 15 arrives while 12..14 never did ─────────────────────
    println!("\n── seq gap ──");
    let ahead = UpdateEnvelope::new(UpdateUserTyping { user_id: ALICE }.into()).with_seq(15, 15);
    report(updates.handle(ahead).await?);

    // ── 4. A channel needs its own difference ─────────────────────────
    println!("\n── channel too long ──");
    let too_long = UpdateEnvelope::new(UpdateChannelTooLong { channel_id: NEWS_CHANNEL, pts: None }.into());
    report(updates.handle(too_long).await?);

    // ── 5. A combined container continuing from the recovered seq ─────
    println!("\n── combined container ──");
    report(updates.handle_container(UpdatesContainer {
        updates: vec![
            UpdateUserTyping { user_id: ALICE }.into(),
            UpdateNewMessage { message: text(14, Peer::User(ALICE), "ok, all good"), pts: 1_014, pts_count: 1 }.into(),
        ],
        date:      now,
        seq_start: 21,
        seq:       22,
        ..Default::default()
    }).await?);

    println!("\n── final state ──");
    let global  = updates.state(StreamKey::Global)?;
    let channel = updates.state(StreamKey::Channel(NEWS_CHANNEL))?;
    println!("global:       pts={} seq={} date={}", global.pts, global.seq, global.date);
    println!("channel {NEWS_CHANNEL}: pts={}", channel.pts);
    println!(
        "cached:       {} entities (alice hash known: {}, news hash known: {})",
        entities.len(),
        entities.user_access_hash(ALICE).is_some(),
        entities.channel_access_hash(NEWS_CHANNEL).is_some(),
    );
    Ok(())
}

fn report(outcome: Ingested) {
    match outcome {
        Ingested::Applied => stamp("✅ applied"),
        Ingested::Stale { current, got } => stamp(&format!("↩️  stale (seq {got} ≤ {current}), dropped")),
        Ingested::Recovered(r) => stamp(&format!(
            "🔄 recovered {}: {} slice(s), {} update(s) replayed, now seq={} pts={}",
            r.key, r.slices, r.replayed, r.state.seq, r.state.pts
        )),
    }
}
