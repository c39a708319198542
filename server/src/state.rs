//! The in-memory model: the server's single authoritative store.
//!
//! All indices are ordered maps keyed by id so that enumeration endpoints
//! and MAP responses are deterministic, which keeps a replayed server
//! byte-identical to the instance that wrote the log. The model is owned by
//! exactly one writer (the timeline worker); reads go through [`View`].
//!
//! [`View`]: crate::view::View

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ConversationHeader, ConversationPayload, Message, Time, User};
use crate::uid::Uuid;

/// Per-user status-page bookkeeping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserStatus {
    /// When the user last ran a status update. `ZERO` if never.
    pub last_update: Time,
    /// Unseen-message counts per conversation. Client-cooperative absolute
    /// values; absent reads 0.
    pub unseen: BTreeMap<Uuid, i32>,
    /// Last-seen time per conversation of interest.
    pub updated: BTreeMap<Uuid, Time>,
}

/// The server's indexed arena. Message links are id-to-id, never pointers.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Model {
    pub(crate) users: BTreeMap<Uuid, User>,
    pub(crate) conversations: BTreeMap<Uuid, ConversationHeader>,
    pub(crate) payloads: BTreeMap<Uuid, ConversationPayload>,
    pub(crate) messages: BTreeMap<Uuid, Message>,
    /// Conversations each user follows.
    pub(crate) conversation_interests: BTreeMap<Uuid, BTreeSet<Uuid>>,
    /// Users each user follows.
    pub(crate) user_interests: BTreeMap<Uuid, BTreeSet<Uuid>>,
    /// Access bits per `(conversation, user)`.
    pub(crate) access: BTreeMap<(Uuid, Uuid), i32>,
    pub(crate) status: BTreeMap<Uuid, UserStatus>,
}

impl Model {
    pub fn new() -> Model {
        Model::default()
    }

    /// Whether any entity kind already uses `id`. Ids are unique across
    /// kinds, so this is the duplicate check for replayed entities.
    pub fn contains_id(&self, id: Uuid) -> bool {
        self.users.contains_key(&id)
            || self.conversations.contains_key(&id)
            || self.messages.contains_key(&id)
    }

    pub fn has_user(&self, id: Uuid) -> bool {
        self.users.contains_key(&id)
    }

    pub fn has_conversation(&self, id: Uuid) -> bool {
        self.conversations.contains_key(&id)
    }

    pub fn has_message(&self, id: Uuid) -> bool {
        self.messages.contains_key(&id)
    }
}
