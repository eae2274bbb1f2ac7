//! Routing of updates to handler slots.
//!
//! A [`HandlerRegistry`] collects one callback per [`UpdateTag`]; the
//! [`Dispatcher`] freezes it into a table indexed by tag so each dispatch is
//! a single lookup.  Every known tag always has exactly one slot: tags the
//! application did not register map to an "ignored" slot, and
//! [`Update::Unknown`] goes to the "unsupported" slot, which only logs.
//!
//! ```rust,no_run
//! use layer_updates::{Dispatcher, HandlerRegistry};
//! use layer_updates::update::{UpdateNewMessage, UpdateUserTyping};
//!
//! let registry = HandlerRegistry::new()
//!     .on(|u: UpdateNewMessage, getting_difference| {
//!         println!("message {} (replayed: {getting_difference})", u.message.id);
//!     })
//!     .on(|u: UpdateUserTyping, _| println!("user {} is typing", u.user_id));
//! let dispatcher = Dispatcher::new(registry);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::envelope::UpdateEnvelope;
use crate::update::{RawUpdate, Update, UpdatePayload, UpdateTag};

type SlotFn        = Arc<dyn Fn(Update, bool) + Send + Sync>;
type UnsupportedFn = Arc<dyn Fn(RawUpdate) + Send + Sync>;

#[derive(Clone)]
enum Slot {
    /// No handler registered; the update is dropped after a trace line.
    Ignored,
    Handler(SlotFn),
}

// ─── HandlerRegistry ──────────────────────────────────────────────────────────

/// Builder for the tag → handler table.
#[derive(Clone)]
pub struct HandlerRegistry {
    slots:       Vec<Slot>,
    unsupported: UnsupportedFn,
}

impl Default for HandlerRegistry {
    fn default() -> Self { Self::new() }
}

impl HandlerRegistry {
    /// A registry where every tag is ignored and unknown variants are logged.
    pub fn new() -> Self {
        Self {
            slots:       vec![Slot::Ignored; UpdateTag::COUNT],
            unsupported: Arc::new(|raw: RawUpdate| {
                tracing::debug!(
                    "[layer-updates] Unsupported update: constructor {:#010x}",
                    raw.constructor_id
                );
            }),
        }
    }

    /// Register the handler for payload type `P`, replacing any previous one.
    ///
    /// The handler receives the payload and whether it is being replayed from
    /// a difference.
    pub fn on<P, F>(self, handler: F) -> Self
    where
        P: UpdatePayload,
        F: Fn(P, bool) + Send + Sync + 'static,
    {
        self.on_tag(P::TAG, move |update, getting_difference| {
            if let Some(payload) = P::extract(update) {
                handler(payload, getting_difference);
            }
        })
    }

    /// Register an untyped handler for `tag`, replacing any previous one.
    pub fn on_tag<F>(mut self, tag: UpdateTag, handler: F) -> Self
    where
        F: Fn(Update, bool) + Send + Sync + 'static,
    {
        self.slots[tag.index()] = Slot::Handler(Arc::new(handler));
        self
    }

    /// Register the same untyped handler for every known tag.
    pub fn on_every_tag<F>(mut self, handler: F) -> Self
    where
        F: Fn(Update, bool) + Send + Sync + 'static,
    {
        let handler: SlotFn = Arc::new(handler);
        for slot in &mut self.slots {
            *slot = Slot::Handler(handler.clone());
        }
        self
    }

    /// Replace the default slot that receives [`Update::Unknown`].
    pub fn on_unsupported<F>(mut self, handler: F) -> Self
    where
        F: Fn(RawUpdate) + Send + Sync + 'static,
    {
        self.unsupported = Arc::new(handler);
        self
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Stateless router from an update's tag to exactly one slot.
pub struct Dispatcher {
    table:       Box<[Slot]>,
    unsupported: UnsupportedFn,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        let table = registry.slots.into_boxed_slice();
        assert_eq!(table.len(), UpdateTag::COUNT, "dispatch table must cover every tag");
        Self { table, unsupported: registry.unsupported }
    }

    /// Invoke the slot for `envelope`'s payload.  Never fails.
    pub fn dispatch(&self, envelope: UpdateEnvelope) {
        let getting_difference = envelope.is_getting_differences();
        self.dispatch_update(envelope.into_payload(), getting_difference);
    }

    pub(crate) fn dispatch_update(&self, update: Update, getting_difference: bool) {
        let tag = match update.tag() {
            Some(tag) => tag,
            None => {
                if let Update::Unknown(raw) = update {
                    (self.unsupported)(raw);
                }
                return;
            }
        };
        match &self.table[tag.index()] {
            Slot::Handler(f) => f(update, getting_difference),
            Slot::Ignored    => tracing::trace!("[layer-updates] No handler for {}", tag.name()),
        }
    }

    /// `true` if the application registered a handler for `tag`.
    pub fn is_handled(&self, tag: UpdateTag) -> bool {
        matches!(self.table[tag.index()], Slot::Handler(_))
    }

    /// Number of slots in the table (one per known tag).
    pub fn slot_count(&self) -> usize { self.table.len() }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handled = UpdateTag::ALL.iter().filter(|t| self.is_handled(**t)).count();
        write!(f, "Dispatcher {{ slots: {}, handled: {handled} }}", self.table.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{UpdateChannelTooLong, UpdateUserTyping};
    use std::sync::Mutex;

    #[test]
    fn typed_handler_gets_payload_and_flag() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let d = Dispatcher::new(HandlerRegistry::new().on(move |u: UpdateChannelTooLong, gd| {
            s.lock().unwrap().push((u.channel_id, gd));
        }));

        d.dispatch(UpdateEnvelope::new(UpdateChannelTooLong { channel_id: 9, pts: None }.into()));
        d.dispatch(UpdateEnvelope::replayed(UpdateChannelTooLong { channel_id: 9, pts: None }.into()));
        assert_eq!(*seen.lock().unwrap(), vec![(9, false), (9, true)]);
        assert!(d.is_handled(UpdateTag::ChannelTooLong));
        assert!(!d.is_handled(UpdateTag::UserTyping));
    }

    #[test]
    fn unknown_goes_to_default_slot_only() {
        let unsupported = Arc::new(Mutex::new(Vec::new()));
        let tagged      = Arc::new(Mutex::new(0usize));
        let (u, t) = (unsupported.clone(), tagged.clone());
        let d = Dispatcher::new(
            HandlerRegistry::new()
                .on_every_tag(move |_, _| *t.lock().unwrap() += 1)
                .on_unsupported(move |raw| u.lock().unwrap().push(raw.constructor_id)),
        );

        d.dispatch(UpdateEnvelope::new(Update::Unknown(RawUpdate { constructor_id: 0x1234 })));
        assert_eq!(*unsupported.lock().unwrap(), vec![0x1234]);
        assert_eq!(*tagged.lock().unwrap(), 0);
    }

    #[test]
    fn every_tag_reaches_exactly_its_slot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new().on_unsupported(|raw| {
            panic!("known update routed to the default slot: {:#x}", raw.constructor_id)
        });
        for &slot in UpdateTag::ALL {
            let log = log.clone();
            registry = registry.on_tag(slot, move |u, _| log.lock().unwrap().push((slot, u.tag())));
        }
        let d = Dispatcher::new(registry);

        for &tag in UpdateTag::ALL {
            d.dispatch(UpdateEnvelope::new(tag.sample()));
            let log = log.lock().unwrap();
            assert_eq!(log.last(), Some(&(tag, Some(tag))), "{}", tag.name());
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), UpdateTag::COUNT);
        let slots: Vec<UpdateTag> = log.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, UpdateTag::ALL);
    }

    #[test]
    fn reregistering_replaces_slot() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (hits.clone(), hits.clone());
        let d = Dispatcher::new(
            HandlerRegistry::new()
                .on(move |_: UpdateUserTyping, _| a.lock().unwrap().push("first"))
                .on(move |_: UpdateUserTyping, _| b.lock().unwrap().push("second")),
        );
        d.dispatch(UpdateEnvelope::new(UpdateUserTyping { user_id: 1 }.into()));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
        assert_eq!(d.slot_count(), UpdateTag::COUNT);
    }
}
