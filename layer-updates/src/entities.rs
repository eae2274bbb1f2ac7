//! User and chat ingestion.
//!
//! Differences and update batches carry the users and chats their updates
//! reference.  They are handed to a [`UserChatStore`] before any of those
//! updates is dispatched, so handlers can always resolve the peers they see.

use std::collections::HashMap;
use std::sync::{RwLock, PoisonError};

use crate::update::{Chat, User};

/// Receives every user/chat batch the core sees.
pub trait UserChatStore: Send + Sync {
    /// Store `users` first, then `chats`.
    fn ingest(&self, users: &[User], chats: &[Chat]);
}

// ─── EntityCache ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Entities {
    /// user_id → access_hash
    user_hashes:    HashMap<i64, i64>,
    /// channel_id → access_hash
    channel_hashes: HashMap<i64, i64>,
    users:          HashMap<i64, User>,
    chats:          HashMap<i64, Chat>,
}

impl Entities {
    fn cache_user(&mut self, user: &User) {
        if let Some(hash) = user.access_hash {
            self.user_hashes.insert(user.id, hash);
        }
        self.users.insert(user.id, user.clone());
    }

    fn cache_chat(&mut self, chat: &Chat) {
        match chat {
            Chat::Channel { id, access_hash: Some(hash), .. } => {
                self.channel_hashes.insert(*id, *hash);
            }
            Chat::ChannelForbidden { id, access_hash, .. } => {
                self.channel_hashes.insert(*id, *access_hash);
            }
            _ => {}
        }
        // `Empty` carries nothing worth replacing a known chat with.
        if !matches!(chat, Chat::Empty { .. }) || !self.chats.contains_key(&chat.id()) {
            self.chats.insert(chat.id(), chat.clone());
        }
    }
}

/// In-memory [`UserChatStore`] that remembers the latest copy of every user
/// and chat plus the access hashes needed to address them.
#[derive(Default)]
pub struct EntityCache {
    inner: RwLock<Entities>,
}

impl EntityCache {
    pub fn new() -> Self { Self::default() }

    pub fn user(&self, id: i64) -> Option<User> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).users.get(&id).cloned()
    }

    pub fn chat(&self, id: i64) -> Option<Chat> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).chats.get(&id).cloned()
    }

    pub fn user_access_hash(&self, id: i64) -> Option<i64> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).user_hashes.get(&id).copied()
    }

    pub fn channel_access_hash(&self, id: i64) -> Option<i64> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).channel_hashes.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        let e = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        e.users.len() + e.chats.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl UserChatStore for EntityCache {
    fn ingest(&self, users: &[User], chats: &[Chat]) {
        let mut e = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for u in users { e.cache_user(u); }
        for c in chats { e.cache_chat(c); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_hashes_and_objects() {
        let cache = EntityCache::new();
        cache.ingest(
            &[User { id: 1, access_hash: Some(111), ..Default::default() }],
            &[
                Chat::Channel { id: 5, access_hash: Some(555), title: "news".into(), megagroup: false },
                Chat::ChannelForbidden { id: 6, access_hash: 666, title: "gone".into() },
                Chat::Group { id: 7, title: "friends".into() },
            ],
        );
        assert_eq!(cache.user_access_hash(1), Some(111));
        assert_eq!(cache.channel_access_hash(5), Some(555));
        assert_eq!(cache.channel_access_hash(6), Some(666));
        assert_eq!(cache.channel_access_hash(7), None);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn empty_chat_does_not_clobber_known_one() {
        let cache = EntityCache::new();
        cache.ingest(&[], &[Chat::Group { id: 7, title: "friends".into() }]);
        cache.ingest(&[], &[Chat::Empty { id: 7 }]);
        assert_eq!(cache.chat(7), Some(Chat::Group { id: 7, title: "friends".into() }));
    }
}
