//! Per-delivery wrapper around an [`Update`].

use crate::pts::StreamKey;
use crate::update::Update;

/// One update plus the flags that govern how it is validated and recorded.
///
/// Live traffic uses the defaults (pts check on, state advanced afterwards,
/// not inside a difference).  Updates replayed from a difference are built
/// with [`UpdateEnvelope::replayed`], which turns both safeguards off so a
/// replay can never start another recovery or move the stream cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEnvelope {
    payload:                Update,
    channel_id:             Option<i64>,
    pts:                    Option<i32>,
    seq:                    Option<i32>,
    seq_start:              Option<i32>,
    date:                   Option<i32>,
    is_getting_differences: bool,
    is_pts_check_enabled:   bool,
    is_update_pts:          bool,
}

impl UpdateEnvelope {
    /// Wrap a live update.  The stream and pts are taken from the payload.
    pub fn new(payload: Update) -> Self {
        let channel_id = payload.channel_id();
        let pts        = payload.pts_info().map(|p| p.pts);
        Self {
            payload,
            channel_id,
            pts,
            seq:                    None,
            seq_start:              None,
            date:                   None,
            is_getting_differences: false,
            is_pts_check_enabled:   true,
            is_update_pts:          true,
        }
    }

    /// Wrap an update recovered from a difference.
    pub fn replayed(payload: Update) -> Self {
        Self::new(payload)
            .disable_pts_check()
            .disable_update_pts()
            .enable_getting_differences()
    }

    /// Set the `seq` range of the container this update arrived in.
    ///
    /// `seq_start == 0` means "same as `seq`".
    pub fn with_seq(mut self, seq: i32, seq_start: i32) -> Self {
        self.seq       = Some(seq);
        self.seq_start = Some(seq_start);
        self
    }

    pub fn with_date(mut self, date: i32) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_pts(mut self, pts: i32) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Force the update onto a channel stream.
    pub fn with_channel(mut self, channel_id: i64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn disable_pts_check(mut self) -> Self {
        self.is_pts_check_enabled = false;
        self
    }

    pub fn disable_update_pts(mut self) -> Self {
        self.is_update_pts = false;
        self
    }

    pub fn enable_getting_differences(mut self) -> Self {
        self.is_getting_differences = true;
        self
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn payload(&self) -> &Update { &self.payload }

    pub fn into_payload(self) -> Update { self.payload }

    pub fn channel_id(&self) -> Option<i64> { self.channel_id }

    /// The sequence stream this update belongs to.
    pub fn stream_key(&self) -> StreamKey {
        match self.channel_id {
            Some(id) => StreamKey::Channel(id),
            None     => StreamKey::Global,
        }
    }

    pub fn pts(&self) -> Option<i32> { self.pts }

    pub fn seq(&self) -> Option<i32> { self.seq }

    /// Start of the seq range; `0` when the container had no distinct start.
    pub fn seq_start(&self) -> i32 { self.seq_start.unwrap_or(0) }

    pub fn date(&self) -> Option<i32> { self.date }

    pub fn is_getting_differences(&self) -> bool { self.is_getting_differences }

    pub fn is_pts_check_enabled(&self) -> bool { self.is_pts_check_enabled }

    pub fn is_update_pts(&self) -> bool { self.is_update_pts }
}

impl From<Update> for UpdateEnvelope {
    fn from(payload: Update) -> Self { Self::new(payload) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{Message, Peer, UpdateChannelNewMessage, UpdateUserTyping};

    #[test]
    fn live_defaults() {
        let env = UpdateEnvelope::new(UpdateUserTyping { user_id: 1 }.into());
        assert!(env.is_pts_check_enabled());
        assert!(env.is_update_pts());
        assert!(!env.is_getting_differences());
        assert_eq!(env.stream_key(), StreamKey::Global);
        assert_eq!(env.seq_start(), 0);
    }

    #[test]
    fn replayed_clears_safeguards() {
        let env = UpdateEnvelope::replayed(UpdateUserTyping { user_id: 1 }.into());
        assert!(!env.is_pts_check_enabled());
        assert!(!env.is_update_pts());
        assert!(env.is_getting_differences());
    }

    #[test]
    fn channel_stream_from_payload() {
        let env = UpdateEnvelope::new(UpdateChannelNewMessage {
            message:   Message { id: 3, peer_id: Some(Peer::Channel(5)), ..Default::default() },
            pts:       12,
            pts_count: 1,
        }.into());
        assert_eq!(env.stream_key(), StreamKey::Channel(5));
        assert_eq!(env.pts(), Some(12));
    }
}
