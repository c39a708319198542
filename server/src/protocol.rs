//! Request/response protocol: opcode constants, tagged request and response
//! kinds, and their wire forms.
//!
//! Every exchange is one request and one response on a fresh connection; a
//! message is an INTEGER opcode followed by the body for that opcode. The
//! numeric constants are shared with clients and never renumbered:
//! `NO_MESSAGE` is 0, then request/response pairs count up in table order
//! (requests odd, responses even).

use std::collections::BTreeMap;

use tokio::io::AsyncRead;

use crate::models::{ConversationHeader, ConversationPayload, Message, ServerInfo, Time, User};
use crate::uid::Uuid;
use crate::wire::{self, WireError};

pub mod code {
    //! Wire opcode constants.
    pub const NO_MESSAGE: i32 = 0;

    pub const NEW_MESSAGE_REQUEST: i32 = 1;
    pub const NEW_MESSAGE_RESPONSE: i32 = 2;
    pub const NEW_USER_REQUEST: i32 = 3;
    pub const NEW_USER_RESPONSE: i32 = 4;
    pub const NEW_CONVERSATION_REQUEST: i32 = 5;
    pub const NEW_CONVERSATION_RESPONSE: i32 = 6;
    pub const GET_USERS_REQUEST: i32 = 7;
    pub const GET_USERS_RESPONSE: i32 = 8;
    pub const GET_ALL_CONVERSATIONS_REQUEST: i32 = 9;
    pub const GET_ALL_CONVERSATIONS_RESPONSE: i32 = 10;
    pub const GET_CONVERSATIONS_BY_ID_REQUEST: i32 = 11;
    pub const GET_CONVERSATIONS_BY_ID_RESPONSE: i32 = 12;
    pub const GET_MESSAGES_BY_ID_REQUEST: i32 = 13;
    pub const GET_MESSAGES_BY_ID_RESPONSE: i32 = 14;
    pub const SERVER_INFO_REQUEST: i32 = 15;
    pub const SERVER_INFO_RESPONSE: i32 = 16;
    pub const GET_CONVERSATION_INTERESTS_REQUEST: i32 = 17;
    pub const GET_CONVERSATION_INTERESTS_RESPONSE: i32 = 18;
    pub const NEW_CONVERSATION_INTEREST_REQUEST: i32 = 19;
    pub const NEW_CONVERSATION_INTEREST_RESPONSE: i32 = 20;
    pub const REMOVE_CONVERSATION_INTEREST_REQUEST: i32 = 21;
    pub const REMOVE_CONVERSATION_INTEREST_RESPONSE: i32 = 22;
    pub const GET_USER_INTERESTS_REQUEST: i32 = 23;
    pub const GET_USER_INTERESTS_RESPONSE: i32 = 24;
    pub const NEW_USER_INTEREST_REQUEST: i32 = 25;
    pub const NEW_USER_INTEREST_RESPONSE: i32 = 26;
    pub const REMOVE_USER_INTEREST_REQUEST: i32 = 27;
    pub const REMOVE_USER_INTEREST_RESPONSE: i32 = 28;
    pub const NEW_UPDATED_CONVERSATION_REQUEST: i32 = 29;
    pub const NEW_UPDATED_CONVERSATION_RESPONSE: i32 = 30;
    pub const GET_UPDATED_CONVERSATIONS_REQUEST: i32 = 31;
    pub const GET_UPDATED_CONVERSATIONS_RESPONSE: i32 = 32;
    pub const UPDATE_USER_LAST_STATUS_UPDATE_REQUEST: i32 = 33;
    pub const UPDATE_USER_LAST_STATUS_UPDATE_RESPONSE: i32 = 34;
    pub const GET_USER_LAST_STATUS_UPDATE_REQUEST: i32 = 35;
    pub const GET_USER_LAST_STATUS_UPDATE_RESPONSE: i32 = 36;
    pub const GET_USER_MESSAGE_COUNT_REQUEST: i32 = 37;
    pub const GET_USER_MESSAGE_COUNT_RESPONSE: i32 = 38;
    pub const UPDATE_USER_MESSAGE_COUNT_REQUEST: i32 = 39;
    pub const UPDATE_USER_MESSAGE_COUNT_RESPONSE: i32 = 40;
    pub const TOGGLE_MEMBER_BIT_REQUEST: i32 = 41;
    pub const TOGGLE_MEMBER_BIT_RESPONSE: i32 = 42;
    pub const TOGGLE_OWNER_BIT_REQUEST: i32 = 43;
    pub const TOGGLE_OWNER_BIT_RESPONSE: i32 = 44;
    pub const TOGGLE_CREATOR_BIT_REQUEST: i32 = 45;
    pub const TOGGLE_CREATOR_BIT_RESPONSE: i32 = 46;
    pub const TOGGLE_REMOVED_BIT_REQUEST: i32 = 47;
    pub const TOGGLE_REMOVED_BIT_RESPONSE: i32 = 48;
    pub const GET_USER_ACCESS_CONTROL_REQUEST: i32 = 49;
    pub const GET_USER_ACCESS_CONTROL_RESPONSE: i32 = 50;
}

/// One decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    // ── Entity creation ──
    NewMessage {
        author: Uuid,
        conversation: Uuid,
        content: String,
    },
    NewUser { name: String },
    NewConversation { title: String, owner: Uuid },

    // ── Enumeration and lookup ──
    GetUsers,
    GetAllConversations,
    GetConversationsById { ids: Vec<Uuid> },
    GetMessagesById { ids: Vec<Uuid> },
    ServerInfo,

    // ── Interests ──
    GetConversationInterests { user: Uuid },
    NewConversationInterest { user: Uuid, conversation: Uuid },
    RemoveConversationInterest { user: Uuid, conversation: Uuid },
    GetUserInterests { user: Uuid },
    NewUserInterest { user: Uuid, followed: Uuid },
    RemoveUserInterest { user: Uuid, followed: Uuid },

    // ── Status ──
    NewUpdatedConversation {
        user: Uuid,
        conversation: Uuid,
        time: Time,
    },
    GetUpdatedConversations { user: Uuid },
    UpdateLastStatusUpdate { user: Uuid, time: Time },
    GetLastStatusUpdate { user: Uuid },
    GetUnseenMessageCount { user: Uuid, conversation: Uuid },
    UpdateUnseenMessageCount {
        user: Uuid,
        conversation: Uuid,
        count: i32,
    },

    // ── Access control ──
    ToggleMemberBit {
        conversation: Uuid,
        user: Uuid,
        flag: bool,
    },
    ToggleOwnerBit {
        conversation: Uuid,
        user: Uuid,
        flag: bool,
    },
    ToggleCreatorBit {
        conversation: Uuid,
        user: Uuid,
        flag: bool,
    },
    ToggleRemovedBit { conversation: Uuid, user: Uuid },
    GetUserAccessControl { conversation: Uuid, user: Uuid },
}

/// One response, paired with the request kind that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    NewMessage(Option<Message>),
    NewUser(Option<User>),
    NewConversation(Option<ConversationHeader>),
    Users(Vec<User>),
    AllConversations(Vec<ConversationHeader>),
    ConversationsById(Vec<ConversationPayload>),
    MessagesById(Vec<Message>),
    ServerInfo(ServerInfo),
    ConversationInterests(Vec<Uuid>),
    NewConversationInterest(Vec<Uuid>),
    RemoveConversationInterest(Vec<Uuid>),
    UserInterests(Vec<Uuid>),
    NewUserInterest(Vec<Uuid>),
    RemoveUserInterest(Vec<Uuid>),
    NewUpdatedConversation(BTreeMap<Uuid, Time>),
    UpdatedConversations(BTreeMap<Uuid, Time>),
    UpdateLastStatusUpdate(Time),
    LastStatusUpdate(Time),
    UnseenMessageCount(i32),
    UpdateUnseenMessageCount(i32),
    MemberBit(i32),
    OwnerBit(i32),
    CreatorBit(i32),
    RemovedBit(i32),
    AccessControl(i32),
}

/// What came off a connection: a decodable request, or an opcode we don't
/// know (answered with `NO_MESSAGE`).
#[derive(Debug)]
pub enum Inbound {
    Request(Request),
    Unknown(i32),
}

/// Read one request (opcode + body) off a connection.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Inbound, WireError> {
    let opcode = wire::read_i32(reader).await?;
    let request = match opcode {
        code::NEW_MESSAGE_REQUEST => Request::NewMessage {
            author: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
            content: wire::read_string(reader).await?,
        },
        code::NEW_USER_REQUEST => Request::NewUser {
            name: wire::read_string(reader).await?,
        },
        code::NEW_CONVERSATION_REQUEST => Request::NewConversation {
            title: wire::read_string(reader).await?,
            owner: wire::read_uuid(reader).await?,
        },
        code::GET_USERS_REQUEST => Request::GetUsers,
        code::GET_ALL_CONVERSATIONS_REQUEST => Request::GetAllConversations,
        code::GET_CONVERSATIONS_BY_ID_REQUEST => Request::GetConversationsById {
            ids: wire::read_uuid_collection(reader).await?,
        },
        code::GET_MESSAGES_BY_ID_REQUEST => Request::GetMessagesById {
            ids: wire::read_uuid_collection(reader).await?,
        },
        code::SERVER_INFO_REQUEST => Request::ServerInfo,
        code::GET_CONVERSATION_INTERESTS_REQUEST => Request::GetConversationInterests {
            user: wire::read_uuid(reader).await?,
        },
        code::NEW_CONVERSATION_INTEREST_REQUEST => Request::NewConversationInterest {
            user: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
        },
        code::REMOVE_CONVERSATION_INTEREST_REQUEST => Request::RemoveConversationInterest {
            user: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
        },
        code::GET_USER_INTERESTS_REQUEST => Request::GetUserInterests {
            user: wire::read_uuid(reader).await?,
        },
        code::NEW_USER_INTEREST_REQUEST => Request::NewUserInterest {
            user: wire::read_uuid(reader).await?,
            followed: wire::read_uuid(reader).await?,
        },
        code::REMOVE_USER_INTEREST_REQUEST => Request::RemoveUserInterest {
            user: wire::read_uuid(reader).await?,
            followed: wire::read_uuid(reader).await?,
        },
        code::NEW_UPDATED_CONVERSATION_REQUEST => Request::NewUpdatedConversation {
            user: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
            time: wire::read_time(reader).await?,
        },
        code::GET_UPDATED_CONVERSATIONS_REQUEST => Request::GetUpdatedConversations {
            user: wire::read_uuid(reader).await?,
        },
        code::UPDATE_USER_LAST_STATUS_UPDATE_REQUEST => Request::UpdateLastStatusUpdate {
            user: wire::read_uuid(reader).await?,
            time: wire::read_time(reader).await?,
        },
        code::GET_USER_LAST_STATUS_UPDATE_REQUEST => Request::GetLastStatusUpdate {
            user: wire::read_uuid(reader).await?,
        },
        code::GET_USER_MESSAGE_COUNT_REQUEST => Request::GetUnseenMessageCount {
            user: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
        },
        code::UPDATE_USER_MESSAGE_COUNT_REQUEST => Request::UpdateUnseenMessageCount {
            user: wire::read_uuid(reader).await?,
            conversation: wire::read_uuid(reader).await?,
            count: wire::read_i32(reader).await?,
        },
        code::TOGGLE_MEMBER_BIT_REQUEST => Request::ToggleMemberBit {
            conversation: wire::read_uuid(reader).await?,
            user: wire::read_uuid(reader).await?,
            flag: wire::read_bool(reader).await?,
        },
        code::TOGGLE_OWNER_BIT_REQUEST => Request::ToggleOwnerBit {
            conversation: wire::read_uuid(reader).await?,
            user: wire::read_uuid(reader).await?,
            flag: wire::read_bool(reader).await?,
        },
        code::TOGGLE_CREATOR_BIT_REQUEST => Request::ToggleCreatorBit {
            conversation: wire::read_uuid(reader).await?,
            user: wire::read_uuid(reader).await?,
            flag: wire::read_bool(reader).await?,
        },
        code::TOGGLE_REMOVED_BIT_REQUEST => Request::ToggleRemovedBit {
            conversation: wire::read_uuid(reader).await?,
            user: wire::read_uuid(reader).await?,
        },
        code::GET_USER_ACCESS_CONTROL_REQUEST => Request::GetUserAccessControl {
            conversation: wire::read_uuid(reader).await?,
            user: wire::read_uuid(reader).await?,
        },
        other => return Ok(Inbound::Unknown(other)),
    };
    Ok(Inbound::Request(request))
}

fn put_uuid_collection(buf: &mut Vec<u8>, ids: &[Uuid]) {
    wire::put_collection(buf, ids, |b, id| wire::put_uuid(b, *id));
}

fn put_time_map(buf: &mut Vec<u8>, map: &BTreeMap<Uuid, Time>) {
    wire::put_map(
        buf,
        map,
        |b, k| wire::put_uuid(b, *k),
        |b, v| wire::put_time(b, *v),
    );
}

/// Encode a response (opcode + body) into one buffer, written with a single
/// syscall by the dispatcher.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut buf = Vec::new();
    match response {
        Response::NewMessage(message) => {
            wire::put_i32(&mut buf, code::NEW_MESSAGE_RESPONSE);
            wire::put_nullable(&mut buf, message.as_ref(), Message::encode);
        }
        Response::NewUser(user) => {
            wire::put_i32(&mut buf, code::NEW_USER_RESPONSE);
            wire::put_nullable(&mut buf, user.as_ref(), User::encode);
        }
        Response::NewConversation(header) => {
            wire::put_i32(&mut buf, code::NEW_CONVERSATION_RESPONSE);
            wire::put_nullable(&mut buf, header.as_ref(), ConversationHeader::encode);
        }
        Response::Users(users) => {
            wire::put_i32(&mut buf, code::GET_USERS_RESPONSE);
            wire::put_collection(&mut buf, users, User::encode);
        }
        Response::AllConversations(headers) => {
            wire::put_i32(&mut buf, code::GET_ALL_CONVERSATIONS_RESPONSE);
            wire::put_collection(&mut buf, headers, ConversationHeader::encode);
        }
        Response::ConversationsById(payloads) => {
            wire::put_i32(&mut buf, code::GET_CONVERSATIONS_BY_ID_RESPONSE);
            wire::put_collection(&mut buf, payloads, ConversationPayload::encode);
        }
        Response::MessagesById(messages) => {
            wire::put_i32(&mut buf, code::GET_MESSAGES_BY_ID_RESPONSE);
            wire::put_collection(&mut buf, messages, Message::encode);
        }
        Response::ServerInfo(info) => {
            wire::put_i32(&mut buf, code::SERVER_INFO_RESPONSE);
            wire::put_uuid(&mut buf, info.version);
        }
        Response::ConversationInterests(ids) => {
            wire::put_i32(&mut buf, code::GET_CONVERSATION_INTERESTS_RESPONSE);
            put_uuid_collection(&mut buf, ids);
        }
        Response::NewConversationInterest(ids) => {
            wire::put_i32(&mut buf, code::NEW_CONVERSATION_INTEREST_RESPONSE);
            put_uuid_collection(&mut buf, ids);
        }
        Response::RemoveConversationInterest(ids) => {
            wire::put_i32(&mut buf, code::REMOVE_CONVERSATION_INTEREST_RESPONSE);
            put_uuid_collection(&mut buf, ids);
        }
        Response::UserInterests(ids) => {
            wire::put_i32(&mut buf, code::GET_USER_INTERESTS_RESPONSE);
            put_uuid_collection(&mut buf, ids);
        }
        Response::NewUserInterest(ids) => {
            wire::put_i32(&mut buf, code::NEW_USER_INTEREST_RESPONSE);
            put_uuid_collection(&mut buf, ids);
        }
        Response::RemoveUserInterest(ids) => {
            wire::put_i32(&mut buf, code::REMOVE_USER_INTEREST_RESPONSE);
            put_uuid_collection(&mut buf, ids);
        }
        Response::NewUpdatedConversation(map) => {
            wire::put_i32(&mut buf, code::NEW_UPDATED_CONVERSATION_RESPONSE);
            put_time_map(&mut buf, map);
        }
        Response::UpdatedConversations(map) => {
            wire::put_i32(&mut buf, code::GET_UPDATED_CONVERSATIONS_RESPONSE);
            put_time_map(&mut buf, map);
        }
        Response::UpdateLastStatusUpdate(time) => {
            wire::put_i32(&mut buf, code::UPDATE_USER_LAST_STATUS_UPDATE_RESPONSE);
            wire::put_time(&mut buf, *time);
        }
        Response::LastStatusUpdate(time) => {
            wire::put_i32(&mut buf, code::GET_USER_LAST_STATUS_UPDATE_RESPONSE);
            wire::put_time(&mut buf, *time);
        }
        Response::UnseenMessageCount(count) => {
            wire::put_i32(&mut buf, code::GET_USER_MESSAGE_COUNT_RESPONSE);
            wire::put_i32(&mut buf, *count);
        }
        Response::UpdateUnseenMessageCount(count) => {
            wire::put_i32(&mut buf, code::UPDATE_USER_MESSAGE_COUNT_RESPONSE);
            wire::put_i32(&mut buf, *count);
        }
        Response::MemberBit(bits) => {
            wire::put_i32(&mut buf, code::TOGGLE_MEMBER_BIT_RESPONSE);
            wire::put_i32(&mut buf, *bits);
        }
        Response::OwnerBit(bits) => {
            wire::put_i32(&mut buf, code::TOGGLE_OWNER_BIT_RESPONSE);
            wire::put_i32(&mut buf, *bits);
        }
        Response::CreatorBit(bits) => {
            wire::put_i32(&mut buf, code::TOGGLE_CREATOR_BIT_RESPONSE);
            wire::put_i32(&mut buf, *bits);
        }
        Response::RemovedBit(bits) => {
            wire::put_i32(&mut buf, code::TOGGLE_REMOVED_BIT_RESPONSE);
            wire::put_i32(&mut buf, *bits);
        }
        Response::AccessControl(bits) => {
            wire::put_i32(&mut buf, code::GET_USER_ACCESS_CONTROL_RESPONSE);
            wire::put_i32(&mut buf, *bits);
        }
    }
    buf
}

/// The one-INTEGER body sent for an unknown opcode.
pub fn encode_no_message() -> Vec<u8> {
    let mut buf = Vec::new();
    wire::put_i32(&mut buf, code::NO_MESSAGE);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_new_user_request() {
        let mut buf = Vec::new();
        wire::put_i32(&mut buf, code::NEW_USER_REQUEST);
        wire::put_string(&mut buf, "alice");

        match read_request(&mut Cursor::new(buf)).await.unwrap() {
            Inbound::Request(Request::NewUser { name }) => assert_eq!(name, "alice"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_toggle_member_request() {
        let mut buf = Vec::new();
        wire::put_i32(&mut buf, code::TOGGLE_MEMBER_BIT_REQUEST);
        wire::put_uuid(&mut buf, Uuid::new(1, 2));
        wire::put_uuid(&mut buf, Uuid::new(1, 1));
        wire::put_bool(&mut buf, true);

        match read_request(&mut Cursor::new(buf)).await.unwrap() {
            Inbound::Request(Request::ToggleMemberBit {
                conversation,
                user,
                flag,
            }) => {
                assert_eq!(conversation, Uuid::new(1, 2));
                assert_eq!(user, Uuid::new(1, 1));
                assert!(flag);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_opcode_is_reported_not_failed() {
        let mut buf = Vec::new();
        wire::put_i32(&mut buf, 0x7EADBEEF);

        match read_request(&mut Cursor::new(buf)).await.unwrap() {
            Inbound::Unknown(opcode) => assert_eq!(opcode, 0x7EADBEEF),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_wire_error() {
        let mut buf = Vec::new();
        wire::put_i32(&mut buf, code::NEW_USER_REQUEST);
        // Body missing entirely.
        assert!(read_request(&mut Cursor::new(buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_nullable_absent_response_is_flag_only() {
        let bytes = encode_response(&Response::NewUser(None));
        let mut r = Cursor::new(bytes);
        assert_eq!(wire::read_i32(&mut r).await.unwrap(), code::NEW_USER_RESPONSE);
        assert!(!wire::read_bool(&mut r).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_info_response_layout() {
        let info = ServerInfo::current();
        let bytes = encode_response(&Response::ServerInfo(info));
        let mut r = Cursor::new(bytes);
        assert_eq!(
            wire::read_i32(&mut r).await.unwrap(),
            code::SERVER_INFO_RESPONSE
        );
        assert_eq!(wire::read_uuid(&mut r).await.unwrap(), info.version);
    }

    #[tokio::test]
    async fn test_updated_conversations_response_is_ordered() {
        let mut map = BTreeMap::new();
        map.insert(Uuid::new(1, 5), Time::from_ms(50));
        map.insert(Uuid::new(1, 2), Time::from_ms(20));

        let bytes = encode_response(&Response::UpdatedConversations(map));
        let mut r = Cursor::new(bytes);
        assert_eq!(
            wire::read_i32(&mut r).await.unwrap(),
            code::GET_UPDATED_CONVERSATIONS_RESPONSE
        );
        assert_eq!(wire::read_i32(&mut r).await.unwrap(), 2);
        // Map entries come out in key order.
        assert_eq!(wire::read_uuid(&mut r).await.unwrap(), Uuid::new(1, 2));
        assert_eq!(wire::read_time(&mut r).await.unwrap(), Time::from_ms(20));
        assert_eq!(wire::read_uuid(&mut r).await.unwrap(), Uuid::new(1, 5));
        assert_eq!(wire::read_time(&mut r).await.unwrap(), Time::from_ms(50));
    }
}
