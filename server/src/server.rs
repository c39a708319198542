//! The server: per-connection dispatch, request handlers, and the relay
//! pump.
//!
//! A connection carries exactly one request/response pair. The connection's
//! own tokio task does the socket i/o; the parsed request is handed to the
//! timeline worker, which owns the model, runs the handler, and sends the
//! response back over a oneshot. Mutations therefore stay totally ordered
//! and atomic with their journal append even though many sockets are in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::error::ServerError;
use crate::models::Secret;
use crate::protocol::{self, Inbound, Request, Response};
use crate::relay::{Bundle, Component, Relay};
use crate::timeline::Timeline;
use crate::uid::Uuid;

/// How often the pump polls the relay.
const RELAY_REFRESH: Duration = Duration::from_millis(5000);
/// Upper bound on bundles fetched per poll.
const RELAY_BATCH: usize = 32;

/// Everything the timeline worker owns.
pub struct Core {
    pub controller: Controller,
    pub relay: Arc<dyn Relay>,
    /// Relay-facing server identity. Sequence 0 is never minted for an
    /// entity, so this cannot collide with one.
    pub id: Uuid,
    pub secret: Secret,
    /// Id of the last relay bundle applied.
    pub last_seen: Uuid,
}

pub struct Server {
    timeline: Timeline<Core>,
}

impl Server {
    /// Start the timeline worker around `controller` and kick off the
    /// relay pump.
    pub fn start(
        generator: u32,
        controller: Controller,
        relay: Arc<dyn Relay>,
        secret: Secret,
    ) -> Server {
        let core = Core {
            controller,
            relay,
            id: Uuid::new(generator, 0),
            secret,
            last_seen: Uuid::NULL,
        };
        let timeline = Timeline::spawn(core);
        timeline.schedule_now(relay_tick);
        Server { timeline }
    }

    /// Service one accepted connection: read a request, run its handler on
    /// the timeline, write the response, close. The socket is closed on
    /// every path.
    pub fn handle_connection(&self, stream: TcpStream) {
        let timeline = self.timeline.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let peer = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string());
            debug!("handling connection from {}", peer);

            let bytes = match protocol::read_request(&mut stream).await {
                Ok(Inbound::Request(request)) => {
                    let (tx, rx) = oneshot::channel();
                    timeline.schedule_now(move |core, timeline| {
                        let response = apply(core, timeline, request);
                        let _ = tx.send(response);
                    });
                    match rx.await {
                        Ok(response) => protocol::encode_response(&response),
                        // Worker is gone; we're shutting down.
                        Err(_) => return,
                    }
                }
                Ok(Inbound::Unknown(opcode)) => {
                    info!("rejecting unknown opcode {:#x} from {}", opcode, peer);
                    protocol::encode_no_message()
                }
                Err(e) => {
                    warn!("dropping connection from {}: {}", peer, ServerError::Wire(e));
                    return;
                }
            };

            if let Err(e) = stream.write_all(&bytes).await {
                warn!("failed to answer {}: {}", peer, ServerError::Connection(e));
            }
            let _ = stream.shutdown().await;
        });
    }
}

/// A failed journal append means the model has diverged from durable
/// state; nothing sensible can be served after that.
fn fatal(e: ServerError) -> ! {
    error!("{}; aborting", e);
    std::process::exit(1);
}

fn must<T>(result: Result<T, ServerError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => fatal(e),
    }
}

/// Map a create-operation failure to a NULLABLE-absent body, except that
/// journal failures abort.
fn absent<T>(e: ServerError) -> Option<T> {
    if matches!(e, ServerError::Journal(_)) {
        fatal(e);
    }
    info!("rejected create request: {}", e);
    None
}

/// Run one request against the model. Executes on the timeline worker.
fn apply(core: &mut Core, timeline: &Timeline<Core>, request: Request) -> Response {
    match request {
        Request::NewMessage {
            author,
            conversation,
            content,
        } => match core.controller.new_message(author, conversation, &content) {
            Ok(message) => {
                schedule_relay_write(timeline, author, conversation, message.id);
                Response::NewMessage(Some(message))
            }
            Err(e) => Response::NewMessage(absent(e)),
        },
        Request::NewUser { name } => match core.controller.new_user(&name) {
            Ok(user) => Response::NewUser(Some(user)),
            Err(e) => Response::NewUser(absent(e)),
        },
        Request::NewConversation { title, owner } => {
            match core.controller.new_conversation(&title, owner) {
                Ok(header) => Response::NewConversation(Some(header)),
                Err(e) => Response::NewConversation(absent(e)),
            }
        }

        Request::GetUsers => Response::Users(core.controller.view().users()),
        Request::GetAllConversations => {
            Response::AllConversations(core.controller.view().conversations())
        }
        Request::GetConversationsById { ids } => {
            Response::ConversationsById(core.controller.view().conversation_payloads(&ids))
        }
        Request::GetMessagesById { ids } => {
            Response::MessagesById(core.controller.view().messages(&ids))
        }
        Request::ServerInfo => Response::ServerInfo(core.controller.view().info()),

        Request::GetConversationInterests { user } => {
            Response::ConversationInterests(core.controller.view().conversation_interests(user))
        }
        Request::NewConversationInterest { user, conversation } => {
            Response::NewConversationInterest(must(
                core.controller.new_conversation_interest(user, conversation),
            ))
        }
        Request::RemoveConversationInterest { user, conversation } => {
            Response::RemoveConversationInterest(must(
                core.controller.remove_conversation_interest(user, conversation),
            ))
        }
        Request::GetUserInterests { user } => {
            Response::UserInterests(core.controller.view().user_interests(user))
        }
        Request::NewUserInterest { user, followed } => {
            Response::NewUserInterest(must(core.controller.new_user_interest(user, followed)))
        }
        Request::RemoveUserInterest { user, followed } => {
            Response::RemoveUserInterest(must(core.controller.remove_user_interest(user, followed)))
        }

        Request::NewUpdatedConversation {
            user,
            conversation,
            time,
        } => Response::NewUpdatedConversation(
            core.controller.new_updated_conversation(user, conversation, time),
        ),
        Request::GetUpdatedConversations { user } => {
            Response::UpdatedConversations(core.controller.view().updated_conversations(user))
        }
        Request::UpdateLastStatusUpdate { user, time } => {
            Response::UpdateLastStatusUpdate(core.controller.update_last_status_update(user, time))
        }
        Request::GetLastStatusUpdate { user } => {
            Response::LastStatusUpdate(core.controller.view().last_status_update(user))
        }
        Request::GetUnseenMessageCount { user, conversation } => {
            Response::UnseenMessageCount(
                core.controller.view().unseen_messages_count(user, conversation),
            )
        }
        Request::UpdateUnseenMessageCount {
            user,
            conversation,
            count,
        } => Response::UpdateUnseenMessageCount(
            core.controller.update_unseen_messages_count(user, conversation, count),
        ),

        Request::ToggleMemberBit {
            conversation,
            user,
            flag,
        } => Response::MemberBit(must(core.controller.toggle_member_bit(conversation, user, flag))),
        Request::ToggleOwnerBit {
            conversation,
            user,
            flag,
        } => Response::OwnerBit(must(core.controller.toggle_owner_bit(conversation, user, flag))),
        Request::ToggleCreatorBit {
            conversation,
            user,
            flag,
        } => Response::CreatorBit(must(core.controller.toggle_creator_bit(conversation, user, flag))),
        Request::ToggleRemovedBit { conversation, user } => {
            Response::RemovedBit(must(core.controller.toggle_removed_bit(conversation, user)))
        }
        Request::GetUserAccessControl { conversation, user } => {
            Response::AccessControl(core.controller.view().user_access_control(conversation, user))
        }
    }
}

/// Queue a best-effort publish of a locally authored message. Runs as its
/// own timeline task so it snapshots the entities after the mutation that
/// created them has fully committed.
fn schedule_relay_write(
    timeline: &Timeline<Core>,
    user_id: Uuid,
    conversation_id: Uuid,
    message_id: Uuid,
) {
    timeline.schedule_now(move |core, _| {
        let view = core.controller.view();
        let (Some(user), Some(conversation), Some(message)) = (
            view.find_user(user_id).cloned(),
            view.find_conversation(conversation_id).cloned(),
            view.find_message(message_id).cloned(),
        ) else {
            return;
        };

        let relay = core.relay.clone();
        let server = core.id;
        let secret = core.secret.clone();
        tokio::spawn(async move {
            let result = relay
                .write(
                    server,
                    &secret,
                    Component::pack(user.id, &user.name, user.creation),
                    Component::pack(conversation.id, &conversation.title, conversation.creation),
                    Component::pack(message.id, &message.content, message.creation),
                )
                .await;
            if let Err(e) = result {
                // Best effort: the message stays in the local model.
                warn!("relay write failed: {}", e);
            }
        });
    });
}

/// One pump cycle: fetch bundles off the worker, apply them on it, then
/// reschedule. Runs first thing at startup and every `RELAY_REFRESH` after.
fn relay_tick(core: &mut Core, timeline: &Timeline<Core>) {
    let relay = core.relay.clone();
    let server = core.id;
    let secret = core.secret.clone();
    let since = core.last_seen;
    let timeline = timeline.clone();

    tokio::spawn(async move {
        debug!("reading update from relay");
        match relay.read(server, &secret, since, RELAY_BATCH).await {
            Ok(bundles) if !bundles.is_empty() => {
                timeline.schedule_now(move |core, _| apply_bundles(core, bundles));
            }
            Ok(_) => {}
            Err(e) => warn!("failed to read update from relay: {}", e),
        }
        timeline.schedule_in(RELAY_REFRESH, relay_tick);
    });
}

fn apply_bundles(core: &mut Core, bundles: Vec<Bundle>) {
    for bundle in bundles {
        if let Err(e) = apply_bundle(core, &bundle) {
            warn!("failed to apply relay bundle {}: {}", bundle.id, e);
        }
        core.last_seen = bundle.id;
    }
}

/// Materialize whichever bundle components the model is missing.
fn apply_bundle(core: &mut Core, bundle: &Bundle) -> Result<(), ServerError> {
    let user = &bundle.user;
    let conversation = &bundle.conversation;
    let message = &bundle.message;

    if !core.controller.model().has_user(user.id) {
        core.controller.replay_user(user.id, &user.text, user.time)?;
    }
    if !core.controller.model().has_conversation(conversation.id) {
        // The relay does not say who created the conversation; the first
        // user seen posting in it owns this server's copy.
        core.controller.replay_conversation(
            conversation.id,
            &conversation.text,
            user.id,
            conversation.time,
        )?;
    }
    if !core.controller.model().has_message(message.id) {
        core.controller.replay_message(
            message.id,
            user.id,
            conversation.id,
            &message.text,
            message.time,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::models::Time;
    use crate::relay::{MemoryRelay, NoRelay};

    fn test_core() -> Core {
        Core {
            controller: Controller::new(1, Journal::discard()),
            relay: Arc::new(NoRelay),
            id: Uuid::new(1, 0),
            secret: Secret::new(Vec::new()),
            last_seen: Uuid::NULL,
        }
    }

    fn bundle(seq: u32) -> Bundle {
        Bundle {
            id: Uuid::new(9, seq),
            user: Component::pack(Uuid::new(2, 1), "remote", Time::from_ms(10)),
            conversation: Component::pack(Uuid::new(2, 2), "federated", Time::from_ms(20)),
            message: Component::pack(Uuid::new(2, seq + 10), "over the wire", Time::from_ms(30)),
        }
    }

    #[tokio::test]
    async fn test_apply_bundle_materializes_missing_entities() {
        let mut core = test_core();
        apply_bundles(&mut core, vec![bundle(1)]);

        let view = core.controller.view();
        let user = view.find_user(Uuid::new(2, 1)).unwrap();
        assert_eq!(user.name, "remote");
        let header = view.find_conversation(Uuid::new(2, 2)).unwrap();
        assert_eq!(header.title, "federated");
        // First poster owns the local copy.
        assert_eq!(header.owner, Uuid::new(2, 1));
        let message = view.find_message(Uuid::new(2, 11)).unwrap();
        assert_eq!(message.content, "over the wire");
        assert_eq!(core.last_seen, Uuid::new(9, 1));
    }

    #[tokio::test]
    async fn test_applying_the_same_bundle_twice_is_a_noop() {
        let mut core = test_core();
        apply_bundles(&mut core, vec![bundle(1)]);
        apply_bundles(&mut core, vec![bundle(1)]);

        let view = core.controller.view();
        assert_eq!(view.users().len(), 1);
        assert_eq!(view.conversations().len(), 1);
        assert_eq!(view.messages(&[Uuid::new(2, 11)]).len(), 1);
    }

    #[tokio::test]
    async fn test_apply_new_user_and_reject_unknown_author() {
        let mut core = test_core();
        let timeline = Timeline::spawn(test_core());

        let response = apply(&mut core, &timeline, Request::NewUser { name: "alice".into() });
        let Response::NewUser(Some(user)) = response else {
            panic!("expected a user");
        };
        assert_eq!(user.id, Uuid::new(1, 1));

        let response = apply(
            &mut core,
            &timeline,
            Request::NewMessage {
                author: Uuid::new(8, 8),
                conversation: Uuid::new(8, 9),
                content: "ghost".into(),
            },
        );
        assert_eq!(response, Response::NewMessage(None));
    }

    #[tokio::test]
    async fn test_pump_pulls_bundles_from_the_relay() {
        let relay = Arc::new(MemoryRelay::new());
        let secret = Secret::new(Vec::new());
        relay
            .write(
                Uuid::new(7, 0),
                &secret,
                Component::pack(Uuid::new(7, 1), "peer user", Time::from_ms(1)),
                Component::pack(Uuid::new(7, 2), "peer conv", Time::from_ms(2)),
                Component::pack(Uuid::new(7, 3), "hello from afar", Time::from_ms(3)),
            )
            .await
            .unwrap();

        let core = Core {
            controller: Controller::new(1, Journal::discard()),
            relay: relay.clone(),
            id: Uuid::new(1, 0),
            secret,
            last_seen: Uuid::NULL,
        };
        let timeline = Timeline::spawn(core);
        timeline.schedule_now(relay_tick);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, rx) = oneshot::channel();
        timeline.schedule_now(move |core, _| {
            let view = core.controller.view();
            let _ = tx.send((
                view.find_message(Uuid::new(7, 3)).cloned(),
                core.last_seen,
            ));
        });
        let (message, last_seen) = rx.await.unwrap();
        assert_eq!(message.unwrap().content, "hello from afar");
        assert!(!last_seen.is_null());
    }
}
