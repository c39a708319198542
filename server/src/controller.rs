//! All model mutations.
//!
//! Every journaled operation appends exactly one transaction log record
//! before returning (conversation creation additionally journals its three
//! access-bit grants). Replay entry points accept externally supplied ids
//! and times, never journal, and advance the id generator past replayed
//! local ids. Status bookkeeping is deliberately unjournaled.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ServerError;
use crate::journal::{Journal, Record};
use crate::models::{access, ConversationHeader, ConversationPayload, Message, Time, User};
use crate::state::Model;
use crate::uid::{IdentityGen, Uuid};
use crate::view::View;

pub struct Controller {
    model: Model,
    ident: IdentityGen,
    journal: Journal,
}

impl Controller {
    pub fn new(generator: u32, journal: Journal) -> Controller {
        Controller {
            model: Model::new(),
            ident: IdentityGen::new(generator),
            journal,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn view(&self) -> View<'_> {
        View::new(&self.model)
    }

    fn append(&mut self, record: Record) -> Result<(), ServerError> {
        self.journal.append(&record).map_err(ServerError::Journal)
    }

    // ── Live entry points ──

    pub fn new_user(&mut self, name: &str) -> Result<User, ServerError> {
        let user = User {
            id: self.ident.next(),
            name: name.to_string(),
            creation: Time::now(),
        };
        self.model.users.insert(user.id, user.clone());
        self.append(Record::AddUser {
            id: user.id,
            name: user.name.clone(),
            creation: user.creation,
        })?;
        debug!("new user {} {:?}", user.id, user.name);
        Ok(user)
    }

    /// Create a conversation owned by `owner`, granting the owner CREATOR,
    /// OWNER, and MEMBER bits (one journal record per grant).
    pub fn new_conversation(
        &mut self,
        title: &str,
        owner: Uuid,
    ) -> Result<ConversationHeader, ServerError> {
        if !self.model.has_user(owner) {
            return Err(ServerError::UnknownEntity(owner));
        }
        let header = ConversationHeader {
            id: self.ident.next(),
            owner,
            title: title.to_string(),
            creation: Time::now(),
        };
        self.insert_conversation(header.clone());
        self.append(Record::AddConversation {
            id: header.id,
            owner: header.owner,
            title: header.title.clone(),
            creation: header.creation,
        })?;

        self.toggle_creator_bit(header.id, owner, true)?;
        self.toggle_owner_bit(header.id, owner, true)?;
        self.toggle_member_bit(header.id, owner, true)?;

        debug!("new conversation {} {:?}", header.id, header.title);
        Ok(header)
    }

    pub fn new_message(
        &mut self,
        author: Uuid,
        conversation: Uuid,
        content: &str,
    ) -> Result<Message, ServerError> {
        if !self.model.has_user(author) {
            return Err(ServerError::UnknownEntity(author));
        }
        if !self.model.has_conversation(conversation) {
            return Err(ServerError::UnknownEntity(conversation));
        }
        let id = self.ident.next();
        let creation = Time::now();
        let message = self.link_message(id, author, conversation, content, creation);
        self.append(Record::AddMessage {
            id,
            author,
            conversation,
            content: message.content.clone(),
            creation,
        })?;
        Ok(message)
    }

    pub fn new_user_interest(
        &mut self,
        user: Uuid,
        followed: Uuid,
    ) -> Result<Vec<Uuid>, ServerError> {
        self.model
            .user_interests
            .entry(user)
            .or_default()
            .insert(followed);
        self.append(Record::AddUserInterest { user, followed })?;
        Ok(self.view().user_interests(user))
    }

    pub fn remove_user_interest(
        &mut self,
        user: Uuid,
        followed: Uuid,
    ) -> Result<Vec<Uuid>, ServerError> {
        if let Some(set) = self.model.user_interests.get_mut(&user) {
            set.remove(&followed);
        }
        self.append(Record::RemoveUserInterest { user, followed })?;
        Ok(self.view().user_interests(user))
    }

    pub fn new_conversation_interest(
        &mut self,
        user: Uuid,
        conversation: Uuid,
    ) -> Result<Vec<Uuid>, ServerError> {
        self.model
            .conversation_interests
            .entry(user)
            .or_default()
            .insert(conversation);
        self.append(Record::AddConversationInterest { user, conversation })?;
        Ok(self.view().conversation_interests(user))
    }

    pub fn remove_conversation_interest(
        &mut self,
        user: Uuid,
        conversation: Uuid,
    ) -> Result<Vec<Uuid>, ServerError> {
        if let Some(set) = self.model.conversation_interests.get_mut(&user) {
            set.remove(&conversation);
        }
        self.append(Record::RemoveConversationInterest { user, conversation })?;
        Ok(self.view().conversation_interests(user))
    }

    pub fn toggle_member_bit(
        &mut self,
        conversation: Uuid,
        user: Uuid,
        flag: bool,
    ) -> Result<i32, ServerError> {
        let bits = self.set_bit(conversation, user, access::MEMBER, flag);
        self.append(if flag {
            Record::AddMember { conversation, user }
        } else {
            Record::RemoveMember { conversation, user }
        })?;
        Ok(bits)
    }

    pub fn toggle_owner_bit(
        &mut self,
        conversation: Uuid,
        user: Uuid,
        flag: bool,
    ) -> Result<i32, ServerError> {
        let bits = self.set_bit(conversation, user, access::OWNER, flag);
        self.append(if flag {
            Record::AddOwner { conversation, user }
        } else {
            Record::RemoveOwner { conversation, user }
        })?;
        Ok(bits)
    }

    pub fn toggle_creator_bit(
        &mut self,
        conversation: Uuid,
        user: Uuid,
        flag: bool,
    ) -> Result<i32, ServerError> {
        let bits = self.set_bit(conversation, user, access::CREATOR, flag);
        self.append(if flag {
            Record::AddCreator { conversation, user }
        } else {
            Record::RemoveCreator { conversation, user }
        })?;
        Ok(bits)
    }

    /// Flip the sticky REMOVED flag.
    pub fn toggle_removed_bit(&mut self, conversation: Uuid, user: Uuid) -> Result<i32, ServerError> {
        let entry = self.model.access.entry((conversation, user)).or_insert(0);
        *entry ^= access::REMOVED;
        let bits = *entry;
        self.append(Record::ToggleRemoved { conversation, user })?;
        Ok(bits)
    }

    // ── Status bookkeeping (unjournaled) ──

    /// Record a status-update time; returns the previous value.
    pub fn update_last_status_update(&mut self, user: Uuid, time: Time) -> Time {
        let entry = self.model.status.entry(user).or_default();
        std::mem::replace(&mut entry.last_update, time)
    }

    /// Store the client-supplied absolute unseen count; returns the new value.
    pub fn update_unseen_messages_count(
        &mut self,
        user: Uuid,
        conversation: Uuid,
        count: i32,
    ) -> i32 {
        let entry = self.model.status.entry(user).or_default();
        entry.unseen.insert(conversation, count);
        count
    }

    /// Record a last-seen time for a conversation of interest; returns the
    /// resulting map.
    pub fn new_updated_conversation(
        &mut self,
        user: Uuid,
        conversation: Uuid,
        time: Time,
    ) -> BTreeMap<Uuid, Time> {
        let entry = self.model.status.entry(user).or_default();
        entry.updated.insert(conversation, time);
        entry.updated.clone()
    }

    // ── Replay entry points (no journaling) ──

    /// Materialize a user with a supplied id and time (journal replay or
    /// relay bundle). Fails if the id is taken.
    pub fn replay_user(
        &mut self,
        id: Uuid,
        name: &str,
        creation: Time,
    ) -> Result<User, ServerError> {
        if self.model.contains_id(id) {
            return Err(ServerError::Duplicate(id));
        }
        self.ident.observe(id);
        let user = User {
            id,
            name: name.to_string(),
            creation,
        };
        self.model.users.insert(id, user.clone());
        Ok(user)
    }

    pub fn replay_conversation(
        &mut self,
        id: Uuid,
        title: &str,
        owner: Uuid,
        creation: Time,
    ) -> Result<ConversationHeader, ServerError> {
        if self.model.contains_id(id) {
            return Err(ServerError::Duplicate(id));
        }
        if !self.model.has_user(owner) {
            return Err(ServerError::UnknownEntity(owner));
        }
        self.ident.observe(id);
        let header = ConversationHeader {
            id,
            owner,
            title: title.to_string(),
            creation,
        };
        self.insert_conversation(header.clone());
        Ok(header)
    }

    pub fn replay_message(
        &mut self,
        id: Uuid,
        author: Uuid,
        conversation: Uuid,
        content: &str,
        creation: Time,
    ) -> Result<Message, ServerError> {
        if self.model.contains_id(id) {
            return Err(ServerError::Duplicate(id));
        }
        if !self.model.has_user(author) {
            return Err(ServerError::UnknownEntity(author));
        }
        if !self.model.has_conversation(conversation) {
            return Err(ServerError::UnknownEntity(conversation));
        }
        self.ident.observe(id);
        Ok(self.link_message(id, author, conversation, content, creation))
    }

    /// Apply one parsed transaction log record.
    pub fn replay(&mut self, record: Record) -> Result<(), ServerError> {
        match record {
            Record::AddUser { id, name, creation } => {
                self.replay_user(id, &name, creation)?;
            }
            Record::AddConversation {
                id,
                owner,
                title,
                creation,
            } => {
                self.replay_conversation(id, &title, owner, creation)?;
            }
            Record::AddMessage {
                id,
                author,
                conversation,
                content,
                creation,
            } => {
                self.replay_message(id, author, conversation, &content, creation)?;
            }
            Record::AddUserInterest { user, followed } => {
                self.model
                    .user_interests
                    .entry(user)
                    .or_default()
                    .insert(followed);
            }
            Record::RemoveUserInterest { user, followed } => {
                if let Some(set) = self.model.user_interests.get_mut(&user) {
                    set.remove(&followed);
                }
            }
            Record::AddConversationInterest { user, conversation } => {
                self.model
                    .conversation_interests
                    .entry(user)
                    .or_default()
                    .insert(conversation);
            }
            Record::RemoveConversationInterest { user, conversation } => {
                if let Some(set) = self.model.conversation_interests.get_mut(&user) {
                    set.remove(&conversation);
                }
            }
            Record::AddCreator { conversation, user } => {
                self.set_bit(conversation, user, access::CREATOR, true);
            }
            Record::RemoveCreator { conversation, user } => {
                self.set_bit(conversation, user, access::CREATOR, false);
            }
            Record::AddOwner { conversation, user } => {
                self.set_bit(conversation, user, access::OWNER, true);
            }
            Record::RemoveOwner { conversation, user } => {
                self.set_bit(conversation, user, access::OWNER, false);
            }
            Record::AddMember { conversation, user } => {
                self.set_bit(conversation, user, access::MEMBER, true);
            }
            Record::RemoveMember { conversation, user } => {
                self.set_bit(conversation, user, access::MEMBER, false);
            }
            Record::ToggleRemoved { conversation, user } => {
                let entry = self.model.access.entry((conversation, user)).or_insert(0);
                *entry ^= access::REMOVED;
            }
        }
        Ok(())
    }

    // ── Internal ──

    fn insert_conversation(&mut self, header: ConversationHeader) {
        self.model
            .payloads
            .insert(header.id, ConversationPayload::empty(header.id));
        self.model.conversations.insert(header.id, header);
    }

    /// Append a message to its conversation's linked list, updating the
    /// previous tail's `next` and the payload endpoints.
    fn link_message(
        &mut self,
        id: Uuid,
        author: Uuid,
        conversation: Uuid,
        content: &str,
        creation: Time,
    ) -> Message {
        let payload = self
            .model
            .payloads
            .entry(conversation)
            .or_insert_with(|| ConversationPayload::empty(conversation));
        let prev = payload.last;
        if payload.first.is_null() {
            payload.first = id;
        }
        payload.last = id;

        if !prev.is_null() {
            if let Some(tail) = self.model.messages.get_mut(&prev) {
                tail.next = id;
            }
        }

        let message = Message {
            id,
            author,
            conversation,
            content: content.to_string(),
            creation,
            prev,
            next: Uuid::NULL,
        };
        self.model.messages.insert(id, message.clone());
        message
    }

    fn set_bit(&mut self, conversation: Uuid, user: Uuid, bit: i32, flag: bool) -> i32 {
        let entry = self.model.access.entry((conversation, user)).or_insert(0);
        if flag {
            *entry |= bit;
        } else {
            *entry &= !bit;
        }
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal;

    fn controller() -> Controller {
        Controller::new(1, Journal::discard())
    }

    #[test]
    fn test_new_user_gets_sequential_ids() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let bob = c.new_user("bob").unwrap();
        assert_eq!(alice.id, Uuid::new(1, 1));
        assert_eq!(bob.id, Uuid::new(1, 2));
        assert_eq!(c.view().users().len(), 2);
    }

    #[test]
    fn test_new_conversation_requires_known_owner() {
        let mut c = controller();
        let err = c.new_conversation("general", Uuid::new(9, 9)).unwrap_err();
        assert!(matches!(err, ServerError::UnknownEntity(_)));
    }

    #[test]
    fn test_creating_a_conversation_grants_creator_owner_member() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let conv = c.new_conversation("general", alice.id).unwrap();

        let bits = c.view().user_access_control(conv.id, alice.id);
        assert_eq!(bits, access::CREATOR | access::OWNER | access::MEMBER);
        // Absent pair reads zero.
        assert_eq!(c.view().user_access_control(conv.id, Uuid::new(9, 9)), 0);
    }

    #[test]
    fn test_message_list_walks_in_append_order() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let conv = c.new_conversation("general", alice.id).unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(c.new_message(alice.id, conv.id, &format!("m{i}")).unwrap().id);
        }

        let payload = c.view().conversation_payloads(&[conv.id])[0].clone();
        assert_eq!(payload.first, ids[0]);
        assert_eq!(payload.last, ids[4]);

        let mut walked = Vec::new();
        let mut cursor = payload.first;
        while !cursor.is_null() {
            let message = c.view().find_message(cursor).unwrap().clone();
            walked.push(message.id);
            cursor = message.next;
        }
        assert_eq!(walked, ids);

        let last = c.view().find_message(payload.last).unwrap();
        assert!(last.next.is_null());
        let first = c.view().find_message(payload.first).unwrap();
        assert!(first.prev.is_null());
    }

    #[test]
    fn test_new_message_requires_known_author_and_conversation() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let conv = c.new_conversation("general", alice.id).unwrap();

        assert!(matches!(
            c.new_message(Uuid::new(9, 9), conv.id, "hi"),
            Err(ServerError::UnknownEntity(_))
        ));
        assert!(matches!(
            c.new_message(alice.id, Uuid::new(9, 9), "hi"),
            Err(ServerError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_interest_add_remove_is_idempotent() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let bob = c.new_user("bob").unwrap();

        let once = c.new_user_interest(alice.id, bob.id).unwrap();
        let twice = c.new_user_interest(alice.id, bob.id).unwrap();
        assert_eq!(once, vec![bob.id]);
        assert_eq!(once, twice);

        let removed = c.remove_user_interest(alice.id, bob.id).unwrap();
        let removed_again = c.remove_user_interest(alice.id, bob.id).unwrap();
        assert!(removed.is_empty());
        assert_eq!(removed, removed_again);

        let conv = c.new_conversation("general", alice.id).unwrap();
        let once = c.new_conversation_interest(alice.id, conv.id).unwrap();
        let twice = c.new_conversation_interest(alice.id, conv.id).unwrap();
        assert_eq!(once, vec![conv.id]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_toggle_removed_twice_restores_bits() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let conv = c.new_conversation("general", alice.id).unwrap();

        let before = c.view().user_access_control(conv.id, alice.id);
        let flipped = c.toggle_removed_bit(conv.id, alice.id).unwrap();
        assert_eq!(flipped, before | access::REMOVED);
        let restored = c.toggle_removed_bit(conv.id, alice.id).unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_unseen_count_is_absolute_replacement() {
        let mut c = controller();
        let user = Uuid::new(1, 1);
        let conv = Uuid::new(1, 2);
        assert_eq!(c.view().unseen_messages_count(user, conv), 0);
        assert_eq!(c.update_unseen_messages_count(user, conv, 5), 5);
        assert_eq!(c.update_unseen_messages_count(user, conv, 2), 2);
        assert_eq!(c.view().unseen_messages_count(user, conv), 2);
    }

    #[test]
    fn test_last_status_update_returns_previous() {
        let mut c = controller();
        let user = Uuid::new(1, 1);
        assert_eq!(c.view().last_status_update(user), Time::ZERO);
        assert_eq!(
            c.update_last_status_update(user, Time::from_ms(100)),
            Time::ZERO
        );
        assert_eq!(
            c.update_last_status_update(user, Time::from_ms(200)),
            Time::from_ms(100)
        );
    }

    #[test]
    fn test_updated_conversations_projection() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        let bob = c.new_user("bob").unwrap();
        let followed = c.new_conversation("followed", bob.id).unwrap();
        let owned = c.new_conversation("bobs corner", bob.id).unwrap();
        let quiet = c.new_conversation("quiet", bob.id).unwrap();

        c.new_conversation_interest(alice.id, followed.id).unwrap();
        c.new_conversation_interest(alice.id, quiet.id).unwrap();
        c.new_user_interest(alice.id, bob.id).unwrap();

        c.update_last_status_update(alice.id, Time::from_ms(1000));

        // Replay entry points let the test pin message times.
        c.replay_message(
            Uuid::new(7, 1),
            bob.id,
            followed.id,
            "old news",
            Time::from_ms(500),
        )
        .unwrap();
        c.replay_message(
            Uuid::new(7, 2),
            bob.id,
            followed.id,
            "fresh",
            Time::from_ms(1500),
        )
        .unwrap();
        c.replay_message(
            Uuid::new(7, 3),
            bob.id,
            followed.id,
            "fresher",
            Time::from_ms(2000),
        )
        .unwrap();
        c.replay_message(
            Uuid::new(7, 4),
            bob.id,
            owned.id,
            "via user interest",
            Time::from_ms(1700),
        )
        .unwrap();

        let updated = c.view().updated_conversations(alice.id);
        assert_eq!(updated.len(), 2);
        // Newest message wins; pre-threshold conversations are omitted.
        assert_eq!(updated.get(&followed.id), Some(&Time::from_ms(2000)));
        assert_eq!(updated.get(&owned.id), Some(&Time::from_ms(1700)));
        assert_eq!(updated.get(&quiet.id), None);
    }

    #[test]
    fn test_replay_rejects_duplicates() {
        let mut c = controller();
        let alice = c.new_user("alice").unwrap();
        assert!(matches!(
            c.replay_user(alice.id, "imposter", Time::from_ms(1)),
            Err(ServerError::Duplicate(_))
        ));
    }

    #[test]
    fn test_replay_advances_id_generator() {
        let mut c = controller();
        c.replay_user(Uuid::new(1, 40), "restored", Time::from_ms(1))
            .unwrap();
        let fresh = c.new_user("fresh").unwrap();
        assert_eq!(fresh.id, Uuid::new(1, 41));
    }

    #[test]
    fn test_journal_lines_for_conversation_setup() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("transaction_log.txt");

        let mut c = Controller::new(1, Journal::open(&path).unwrap());
        let alice = c.new_user("alice").unwrap();
        let conv = c.new_conversation("general", alice.id).unwrap();
        c.new_message(alice.id, conv.id, "hi").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("ADD-USER [1.1] alice "));
        assert!(lines[1].starts_with("ADD-CONVERSATION [1.2] [1.1] general "));
        assert_eq!(lines[2], "ADD-CONVO-CREATOR [1.2] [1.1]");
        assert_eq!(lines[3], "ADD-CONVO-OWNER [1.2] [1.1]");
        assert_eq!(lines[4], "ADD-CONVO-MEMBER [1.2] [1.1]");
        assert!(lines[5].starts_with("ADD-MESSAGE [1.3] [1.1] [1.2] hi "));
    }

    #[test]
    fn test_replay_reproduces_live_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("transaction_log.txt");

        let mut live = Controller::new(1, Journal::open(&path).unwrap());
        let alice = live.new_user("alice").unwrap();
        let bob = live.new_user("mad hatter").unwrap();
        let conv = live.new_conversation("tea party", alice.id).unwrap();
        live.new_message(alice.id, conv.id, "it's time").unwrap();
        live.new_message(bob.id, conv.id, "no room! no room!").unwrap();
        live.new_user_interest(bob.id, alice.id).unwrap();
        live.new_conversation_interest(bob.id, conv.id).unwrap();
        live.remove_user_interest(bob.id, alice.id).unwrap();
        live.toggle_member_bit(conv.id, bob.id, true).unwrap();
        live.toggle_removed_bit(conv.id, bob.id).unwrap();

        let mut restored = Controller::new(1, Journal::discard());
        journal::replay_file(&path, &mut restored).unwrap();
        assert_eq!(restored.model(), live.model());

        // Fresh ids on the restored side skip everything replayed.
        let next = restored.new_user("fresh").unwrap();
        assert_eq!(next.id, Uuid::new(1, 6));
    }
}
