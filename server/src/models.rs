//! Data model types shared between the store, the wire protocol, and the
//! transaction log.
//!
//! Wire field order is fixed per type and shared with unchanged clients;
//! `encode`/`decode` on each type are the single source of truth for it.

use std::fmt;

use tokio::io::AsyncRead;

use crate::uid::Uuid;
use crate::wire::{self, WireError};

/// A millisecond instant. `ZERO` doubles as "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub fn now() -> Time {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Time(ms)
    }

    pub fn from_ms(ms: i64) -> Time {
        Time(ms)
    }

    pub fn as_ms(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque relay credential. Never interpreted locally.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Secret {
        Secret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log credential bytes.
        write!(f, "Secret(<{} bytes>)", self.0.len())
    }
}

/// Access-control bits per `(conversation, user)` pair. Absent entry reads 0.
pub mod access {
    pub const MEMBER: i32 = 1 << 0;
    pub const OWNER: i32 = 1 << 1;
    pub const CREATOR: i32 = 1 << 2;
    pub const REMOVED: i32 = 1 << 3;
}

/// A chat user. Created once, never mutated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub creation: Time,
}

impl User {
    pub fn encode(buf: &mut Vec<u8>, user: &User) {
        wire::put_uuid(buf, user.id);
        wire::put_string(buf, &user.name);
        wire::put_time(buf, user.creation);
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<User, WireError> {
        Ok(User {
            id: wire::read_uuid(reader).await?,
            name: wire::read_string(reader).await?,
            creation: wire::read_time(reader).await?,
        })
    }
}

/// The immutable part of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHeader {
    pub id: Uuid,
    pub owner: Uuid,
    pub title: String,
    pub creation: Time,
}

impl ConversationHeader {
    pub fn encode(buf: &mut Vec<u8>, header: &ConversationHeader) {
        wire::put_uuid(buf, header.id);
        wire::put_uuid(buf, header.owner);
        wire::put_string(buf, &header.title);
        wire::put_time(buf, header.creation);
    }

    pub async fn decode<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<ConversationHeader, WireError> {
        Ok(ConversationHeader {
            id: wire::read_uuid(reader).await?,
            owner: wire::read_uuid(reader).await?,
            title: wire::read_string(reader).await?,
            creation: wire::read_time(reader).await?,
        })
    }
}

/// The mutable part of a conversation: endpoints of its message list.
/// `first == NULL` iff the conversation has never received a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPayload {
    pub id: Uuid,
    pub first: Uuid,
    pub last: Uuid,
}

impl ConversationPayload {
    pub fn empty(id: Uuid) -> ConversationPayload {
        ConversationPayload {
            id,
            first: Uuid::NULL,
            last: Uuid::NULL,
        }
    }

    pub fn encode(buf: &mut Vec<u8>, payload: &ConversationPayload) {
        wire::put_uuid(buf, payload.id);
        wire::put_uuid(buf, payload.first);
        wire::put_uuid(buf, payload.last);
    }

    pub async fn decode<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<ConversationPayload, WireError> {
        Ok(ConversationPayload {
            id: wire::read_uuid(reader).await?,
            first: wire::read_uuid(reader).await?,
            last: wire::read_uuid(reader).await?,
        })
    }
}

/// One message in a conversation's doubly-linked list. Links are ids, not
/// pointers; `NULL` terminates both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub author: Uuid,
    pub conversation: Uuid,
    pub content: String,
    pub creation: Time,
    pub prev: Uuid,
    pub next: Uuid,
}

impl Message {
    pub fn encode(buf: &mut Vec<u8>, message: &Message) {
        wire::put_uuid(buf, message.id);
        wire::put_uuid(buf, message.author);
        wire::put_uuid(buf, message.conversation);
        wire::put_string(buf, &message.content);
        wire::put_time(buf, message.creation);
        wire::put_uuid(buf, message.prev);
        wire::put_uuid(buf, message.next);
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, WireError> {
        Ok(Message {
            id: wire::read_uuid(reader).await?,
            author: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
            content: wire::read_string(reader).await?,
            creation: wire::read_time(reader).await?,
            prev: wire::read_uuid(reader).await?,
            next: wire::read_uuid(reader).await?,
        })
    }
}

/// Fixed server-build identity reported by SERVER_INFO. Bumped manually on
/// protocol-visible changes.
pub const SERVER_VERSION: Uuid = Uuid::new(0, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: Uuid,
}

impl ServerInfo {
    pub fn current() -> ServerInfo {
        ServerInfo {
            version: SERVER_VERSION,
        }
    }
}
