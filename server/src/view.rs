//! Read-only projections over the model.
//!
//! A `View` is a short-lived borrow; handlers construct one per request, so
//! the borrow checker enforces that reads never overlap a mutation.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ConversationHeader, ConversationPayload, Message, ServerInfo, Time, User};
use crate::state::Model;
use crate::uid::Uuid;

pub struct View<'a> {
    model: &'a Model,
}

impl<'a> View<'a> {
    pub fn new(model: &'a Model) -> View<'a> {
        View { model }
    }

    /// All users, in id order.
    pub fn users(&self) -> Vec<User> {
        self.model.users.values().cloned().collect()
    }

    /// All conversation headers, in id order.
    pub fn conversations(&self) -> Vec<ConversationHeader> {
        self.model.conversations.values().cloned().collect()
    }

    /// Payloads for the given ids; missing ids are omitted silently.
    pub fn conversation_payloads(&self, ids: &[Uuid]) -> Vec<ConversationPayload> {
        ids.iter()
            .filter_map(|id| self.model.payloads.get(id))
            .cloned()
            .collect()
    }

    /// Messages for the given ids; missing ids are omitted silently.
    pub fn messages(&self, ids: &[Uuid]) -> Vec<Message> {
        ids.iter()
            .filter_map(|id| self.model.messages.get(id))
            .cloned()
            .collect()
    }

    pub fn find_user(&self, id: Uuid) -> Option<&'a User> {
        self.model.users.get(&id)
    }

    pub fn find_conversation(&self, id: Uuid) -> Option<&'a ConversationHeader> {
        self.model.conversations.get(&id)
    }

    pub fn find_message(&self, id: Uuid) -> Option<&'a Message> {
        self.model.messages.get(&id)
    }

    /// The user's conversation-interest set; empty if the user is unknown.
    pub fn conversation_interests(&self, user: Uuid) -> Vec<Uuid> {
        self.model
            .conversation_interests
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The user's user-interest set; empty if the user is unknown.
    pub fn user_interests(&self, user: Uuid) -> Vec<Uuid> {
        self.model
            .user_interests
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Last recorded status-update time, `Time::ZERO` if never.
    pub fn last_status_update(&self, user: Uuid) -> Time {
        self.model
            .status
            .get(&user)
            .map(|s| s.last_update)
            .unwrap_or(Time::ZERO)
    }

    /// Unseen-message count for `(user, conversation)`, 0 if absent.
    pub fn unseen_messages_count(&self, user: Uuid, conversation: Uuid) -> i32 {
        self.model
            .status
            .get(&user)
            .and_then(|s| s.unseen.get(&conversation))
            .copied()
            .unwrap_or(0)
    }

    /// Conversations with news for `user`: every conversation in the user's
    /// conversation-interest set, plus every conversation owned by a user in
    /// their user-interest set, mapped to the creation time of its newest
    /// message strictly after the user's last status update. Conversations
    /// with no such message are omitted.
    pub fn updated_conversations(&self, user: Uuid) -> BTreeMap<Uuid, Time> {
        let threshold = self.last_status_update(user);

        let mut candidates: BTreeSet<Uuid> = self
            .model
            .conversation_interests
            .get(&user)
            .cloned()
            .unwrap_or_default();
        if let Some(followed) = self.model.user_interests.get(&user) {
            for header in self.model.conversations.values() {
                if followed.contains(&header.owner) {
                    candidates.insert(header.id);
                }
            }
        }

        let mut updated = BTreeMap::new();
        for conversation in candidates {
            if let Some(newest) = self.newest_message_after(conversation, threshold) {
                updated.insert(conversation, newest);
            }
        }
        updated
    }

    /// Access bits for `(conversation, user)`, 0 if absent.
    pub fn user_access_control(&self, conversation: Uuid, user: Uuid) -> i32 {
        self.model
            .access
            .get(&(conversation, user))
            .copied()
            .unwrap_or(0)
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo::current()
    }

    /// Walk the conversation's message list and return the newest creation
    /// time strictly after `threshold`, if any.
    fn newest_message_after(&self, conversation: Uuid, threshold: Time) -> Option<Time> {
        let payload = self.model.payloads.get(&conversation)?;
        let mut newest = None;
        let mut cursor = payload.first;
        while !cursor.is_null() {
            let message = self.model.messages.get(&cursor)?;
            if message.creation > threshold && newest.map_or(true, |t| message.creation > t) {
                newest = Some(message.creation);
            }
            cursor = message.next;
        }
        newest
    }
}
