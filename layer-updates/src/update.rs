//! Typed update payloads.
//!
//! Every update the server pushes is one of the variants of [`Update`].  The
//! variant set is closed: anything the client does not recognise arrives as
//! [`Update::Unknown`] carrying only its constructor ID, and is routed to the
//! dispatcher's default slot.
//!
//! Each variant wraps its own payload struct (`UpdateNewMessage`,
//! `UpdateChannelTooLong`, …).  The fieldless [`UpdateTag`] mirrors the
//! variant set and is what the dispatch table is indexed by.

// ─── Shared value types ───────────────────────────────────────────────────────

/// A chat partner: user, basic group or channel / supergroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    User(i64),
    Chat(i64),
    Channel(i64),
}

/// A message as carried inside message-related updates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub id:      i32,
    pub peer_id: Option<Peer>,
    pub from_id: Option<Peer>,
    pub date:    i32,
    pub message: String,
    pub out:     bool,
}

impl Message {
    /// The channel this message was posted in, if any.
    pub fn channel_id(&self) -> Option<i64> {
        match self.peer_id {
            Some(Peer::Channel(id)) => Some(id),
            _ => None,
        }
    }
}

/// A user as delivered in update batches and differences.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct User {
    pub id:          i64,
    pub access_hash: Option<i64>,
    pub first_name:  Option<String>,
    pub last_name:   Option<String>,
    pub username:    Option<String>,
    pub bot:         bool,
}

/// A group or channel as delivered in update batches and differences.
#[derive(Debug, Clone, PartialEq)]
pub enum Chat {
    /// A basic group.
    Group { id: i64, title: String },
    /// A channel or supergroup.
    Channel { id: i64, access_hash: Option<i64>, title: String, megagroup: bool },
    /// A channel the account was kicked from; the hash is still valid.
    ChannelForbidden { id: i64, access_hash: i64, title: String },
    /// Nothing is known about this chat except its ID.
    Empty { id: i64 },
}

impl Chat {
    pub fn id(&self) -> i64 {
        match self {
            Self::Group { id, .. }
            | Self::Channel { id, .. }
            | Self::ChannelForbidden { id, .. }
            | Self::Empty { id } => *id,
        }
    }
}

/// A datacenter address announced by `updateDcOptions`.
#[derive(Debug, Clone, PartialEq)]
pub struct DcOption {
    pub id:         i32,
    pub ip_address: String,
    pub port:       i32,
}

/// An update whose constructor is not part of the known variant set.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUpdate {
    /// Constructor ID of the inner update.
    pub constructor_id: u32,
}

// ─── UpdatePayload ────────────────────────────────────────────────────────────

/// Implemented by every typed payload so handlers can be registered per type.
pub trait UpdatePayload: Sized + Send + 'static {
    /// The tag of the [`Update`] variant wrapping this payload.
    const TAG: UpdateTag;

    /// Unwrap the payload if `update` is the matching variant.
    fn extract(update: Update) -> Option<Self>;
}

// ─── Variant set ──────────────────────────────────────────────────────────────

macro_rules! updates {
    ($(
        $(#[$doc:meta])*
        $variant:ident($payload:ident) { $($field:ident : $ty:ty),* $(,)? }
    )*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, PartialEq)]
            pub struct $payload {
                $(pub $field: $ty,)*
            }

            impl UpdatePayload for $payload {
                const TAG: UpdateTag = UpdateTag::$variant;

                fn extract(update: Update) -> Option<Self> {
                    match update {
                        Update::$variant(u) => Some(u),
                        _ => None,
                    }
                }
            }

            impl From<$payload> for Update {
                fn from(u: $payload) -> Self { Update::$variant(u) }
            }
        )*

        /// An update pushed by the server.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Update {
            $($(#[$doc])* $variant($payload),)*
            /// A constructor this client does not know about.
            Unknown(RawUpdate),
        }

        /// The variant tag of an [`Update`], without its payload.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum UpdateTag {
            $($variant,)*
        }

        impl UpdateTag {
            /// Every known tag, in declaration order.
            pub const ALL: &'static [UpdateTag] = &[$(UpdateTag::$variant,)*];

            /// Number of known tags.
            pub const COUNT: usize = Self::ALL.len();

            /// Position of this tag in [`UpdateTag::ALL`].
            pub fn index(self) -> usize { self as usize }

            pub fn name(self) -> &'static str {
                match self {
                    $(UpdateTag::$variant => stringify!($variant),)*
                }
            }
        }

        #[cfg(test)]
        impl UpdateTag {
            /// A placeholder update carrying this tag.
            pub(crate) fn sample(self) -> Update {
                match self {
                    $(UpdateTag::$variant => $payload {
                        $($field: <$ty as sample::Sample>::sample(),)*
                    }.into(),)*
                }
            }
        }

        impl Update {
            /// The tag of this update, or `None` for [`Update::Unknown`].
            pub fn tag(&self) -> Option<UpdateTag> {
                match self {
                    $(Update::$variant(_) => Some(UpdateTag::$variant),)*
                    Update::Unknown(_) => None,
                }
            }
        }
    };
}

updates! {
    /// A private message delivered in the short form.
    ShortMessage(UpdateShortMessage) {
        id: i32, user_id: i64, message: String, out: bool, pts: i32, pts_count: i32, date: i32,
    }
    /// A basic-group message delivered in the short form.
    ShortChatMessage(UpdateShortChatMessage) {
        id: i32, from_id: i64, chat_id: i64, message: String, out: bool, pts: i32, pts_count: i32, date: i32,
    }
    /// Confirmation of a message this account sent.
    ShortSentMessage(UpdateShortSentMessage) {
        id: i32, pts: i32, pts_count: i32, date: i32,
    }
    NewMessage(UpdateNewMessage) { message: Message, pts: i32, pts_count: i32 }
    ChatParticipants(UpdateChatParticipants) { chat_id: i64, participants: Vec<i64>, version: i32 }
    ChannelNewMessage(UpdateChannelNewMessage) { message: Message, pts: i32, pts_count: i32 }
    /// Something about the channel changed; refetch it.
    Channel(UpdateChannel) { channel_id: i64 }
    BotInlineQuery(UpdateBotInlineQuery) { query_id: i64, user_id: i64, query: String, offset: String }
    BotInlineSend(UpdateBotInlineSend) { user_id: i64, query: String, id: String }
    ChannelMessageViews(UpdateChannelMessageViews) { channel_id: i64, id: i32, views: i32 }
    ChannelPinnedMessage(UpdateChannelPinnedMessage) { channel_id: i64, id: i32 }
    /// Too many events happened in the channel; its difference must be fetched.
    ChannelTooLong(UpdateChannelTooLong) { channel_id: i64, pts: Option<i32> }
    ChatAdmin(UpdateChatAdmin) { chat_id: i64, enabled: bool, version: i32 }
    ChatParticipantAdd(UpdateChatParticipantAdd) { chat_id: i64, user_id: i64, inviter_id: i64, date: i32, version: i32 }
    ChatParticipantAdmin(UpdateChatParticipantAdmin) { chat_id: i64, user_id: i64, is_admin: bool, version: i32 }
    ChatParticipantDelete(UpdateChatParticipantDelete) { chat_id: i64, user_id: i64, version: i32 }
    ChatUserTyping(UpdateChatUserTyping) { chat_id: i64, user_id: i64 }
    ContactLink(UpdateContactLink) { user_id: i64, mutual: bool }
    ContactRegistered(UpdateContactRegistered) { user_id: i64, date: i32 }
    DcOptions(UpdateDcOptions) { dc_options: Vec<DcOption> }
    DeleteChannelMessages(UpdateDeleteChannelMessages) { channel_id: i64, messages: Vec<i32>, pts: i32, pts_count: i32 }
    DeleteMessages(UpdateDeleteMessages) { messages: Vec<i32>, pts: i32, pts_count: i32 }
    EditChannelMessage(UpdateEditChannelMessage) { message: Message, pts: i32, pts_count: i32 }
    /// Maps the client-side random ID of a sent message to its server ID.
    MessageId(UpdateMessageId) { id: i32, random_id: i64 }
    NewStickerSet(UpdateNewStickerSet) { set_id: i64 }
    NotifySettings(UpdateNotifySettings) { peer: Peer, mute_until: Option<i32> }
    Privacy(UpdatePrivacy) { key: String, rules: Vec<String> }
    ReadChannelInbox(UpdateReadChannelInbox) { channel_id: i64, max_id: i32, still_unread_count: i32 }
    ReadMessagesContents(UpdateReadMessagesContents) { messages: Vec<i32>, pts: i32, pts_count: i32 }
    ReadMessagesInbox(UpdateReadMessagesInbox) { peer: Peer, max_id: i32, pts: i32, pts_count: i32 }
    ReadMessagesOutbox(UpdateReadMessagesOutbox) { peer: Peer, max_id: i32, pts: i32, pts_count: i32 }
    SavedGifs(UpdateSavedGifs) {}
    ServiceNotification(UpdateServiceNotification) { kind: String, message: String, popup: bool }
    StickerSets(UpdateStickerSets) {}
    StickerSetsOrder(UpdateStickerSetsOrder) { order: Vec<i64> }
    UserBlocked(UpdateUserBlocked) { user_id: i64, blocked: bool }
    UserName(UpdateUserName) { user_id: i64, first_name: String, last_name: String, username: Option<String> }
    UserPhone(UpdateUserPhone) { user_id: i64, phone: String }
    UserPhoto(UpdateUserPhoto) { user_id: i64, date: i32, previous: bool }
    /// `expires` is the Unix time the online status lapses, `None` when offline.
    UserStatus(UpdateUserStatus) { user_id: i64, expires: Option<i32> }
    UserTyping(UpdateUserTyping) { user_id: i64 }
    WebPage(UpdateWebPage) { webpage_id: i64, pts: i32, pts_count: i32 }
    /// Synthetic update injected by the client itself.
    Fake(UpdateFake) { reason: String }
    BotCallbackQuery(UpdateBotCallbackQuery) {
        query_id: i64, user_id: i64, peer: Peer, msg_id: i32, chat_instance: i64, data: Option<Vec<u8>>,
    }
    EditMessage(UpdateEditMessage) { message: Message, pts: i32, pts_count: i32 }
    InlineBotCallbackQuery(UpdateInlineBotCallbackQuery) {
        query_id: i64, user_id: i64, chat_instance: i64, data: Option<Vec<u8>>,
    }
    Encryption(UpdateEncryption) { chat_id: i32, date: i32 }
    EncryptedChatTyping(UpdateEncryptedChatTyping) { chat_id: i32 }
    EncryptedMessagesRead(UpdateEncryptedMessagesRead) { chat_id: i32, max_date: i32, date: i32 }
    NewEncryptedMessage(UpdateNewEncryptedMessage) { chat_id: i32, qts: i32, bytes: Vec<u8> }
    Config(UpdateConfig) {}
    DraftMessage(UpdateDraftMessage) { peer: Peer, text: String }
    /// The account's pts was reset server-side; the client should resync.
    PtsChanged(UpdatePtsChanged) {}
    ReadChannelOutbox(UpdateReadChannelOutbox) { channel_id: i64, max_id: i32 }
    ReadFeaturedStickers(UpdateReadFeaturedStickers) {}
    RecentStickers(UpdateRecentStickers) {}
    ChannelWebPage(UpdateChannelWebPage) { channel_id: i64, webpage_id: i64, pts: i32, pts_count: i32 }
    PhoneCall(UpdatePhoneCall) { call_id: i64 }
    DialogPinned(UpdateDialogPinned) { peer: Peer, pinned: bool }
    PinnedDialogs(UpdatePinnedDialogs) { order: Vec<Peer> }
    BotWebhookJson(UpdateBotWebhookJson) { data: String }
    BotWebhookJsonQuery(UpdateBotWebhookJsonQuery) { query_id: i64, data: String, timeout: i32 }
    BotShippingQuery(UpdateBotShippingQuery) { query_id: i64, user_id: i64, payload: Vec<u8> }
    BotPrecheckoutQuery(UpdateBotPrecheckoutQuery) {
        query_id: i64, user_id: i64, payload: Vec<u8>, currency: String, total_amount: i64,
    }
}


// ─── PtsInfo ──────────────────────────────────────────────────────────────────

/// The state cursor an update carries, and the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtsInfo {
    pub pts:        i32,
    pub pts_count:  i32,
    /// `Some` when the update belongs to a channel stream.
    pub channel_id: Option<i64>,
}

impl Update {
    /// The pts this update advances to, for the variants that carry one.
    pub fn pts_info(&self) -> Option<PtsInfo> {
        use Update::*;
        let global = |pts, pts_count| Some(PtsInfo { pts, pts_count, channel_id: None });
        match self {
            ShortMessage(u)         => global(u.pts, u.pts_count),
            ShortChatMessage(u)     => global(u.pts, u.pts_count),
            ShortSentMessage(u)     => global(u.pts, u.pts_count),
            NewMessage(u)           => global(u.pts, u.pts_count),
            EditMessage(u)          => global(u.pts, u.pts_count),
            DeleteMessages(u)       => global(u.pts, u.pts_count),
            ReadMessagesContents(u) => global(u.pts, u.pts_count),
            ReadMessagesInbox(u)    => global(u.pts, u.pts_count),
            ReadMessagesOutbox(u)   => global(u.pts, u.pts_count),
            WebPage(u)              => global(u.pts, u.pts_count),
            ChannelNewMessage(u) => Some(PtsInfo {
                pts: u.pts, pts_count: u.pts_count, channel_id: u.message.channel_id(),
            }),
            EditChannelMessage(u) => Some(PtsInfo {
                pts: u.pts, pts_count: u.pts_count, channel_id: u.message.channel_id(),
            }),
            DeleteChannelMessages(u) => Some(PtsInfo {
                pts: u.pts, pts_count: u.pts_count, channel_id: Some(u.channel_id),
            }),
            ChannelWebPage(u) => Some(PtsInfo {
                pts: u.pts, pts_count: u.pts_count, channel_id: Some(u.channel_id),
            }),
            _ => None,
        }
    }

    /// The channel this update is scoped to, if any.
    pub fn channel_id(&self) -> Option<i64> {
        use Update::*;
        match self {
            Channel(u)              => Some(u.channel_id),
            ChannelMessageViews(u)  => Some(u.channel_id),
            ChannelPinnedMessage(u) => Some(u.channel_id),
            ChannelTooLong(u)       => Some(u.channel_id),
            ReadChannelInbox(u)     => Some(u.channel_id),
            ReadChannelOutbox(u)    => Some(u.channel_id),
            _ => self.pts_info().and_then(|p| p.channel_id),
        }
    }
}
