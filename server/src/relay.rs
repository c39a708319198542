//! The federation relay port.
//!
//! The relay transport is an external service; the server only consumes
//! this trait. `read` pulls event bundles published since a bundle id, and
//! `write` publishes a locally authored message together with its author
//! and conversation so a peer can materialize whatever it is missing.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ServerError;
use crate::models::{Secret, Time};
use crate::uid::{IdentityGen, Uuid};

/// One entity in a bundle: id plus its display text and creation time.
/// `text` is a user name, a conversation title, or a message body depending
/// on which slot the component sits in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub id: Uuid,
    pub text: String,
    pub time: Time,
}

impl Component {
    pub fn pack(id: Uuid, text: &str, time: Time) -> Component {
        Component {
            id,
            text: text.to_string(),
            time,
        }
    }
}

/// A relay-delivered event: the message plus the user and conversation it
/// belongs to, each to be materialized locally if absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub id: Uuid,
    pub user: Component,
    pub conversation: Component,
    pub message: Component,
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Fetch up to `max` bundles published after `since` (`NULL` for the
    /// beginning of the stream), oldest first.
    async fn read(
        &self,
        server: Uuid,
        secret: &Secret,
        since: Uuid,
        max: usize,
    ) -> Result<Vec<Bundle>, ServerError>;

    /// Publish a locally authored message. Best effort: the caller keeps
    /// the message either way.
    async fn write(
        &self,
        server: Uuid,
        secret: &Secret,
        user: Component,
        conversation: Component,
        message: Component,
    ) -> Result<(), ServerError>;
}

/// Relay for servers that don't federate: reads are empty, writes vanish.
pub struct NoRelay;

#[async_trait]
impl Relay for NoRelay {
    async fn read(
        &self,
        _server: Uuid,
        _secret: &Secret,
        _since: Uuid,
        _max: usize,
    ) -> Result<Vec<Bundle>, ServerError> {
        Ok(Vec::new())
    }

    async fn write(
        &self,
        _server: Uuid,
        _secret: &Secret,
        _user: Component,
        _conversation: Component,
        _message: Component,
    ) -> Result<(), ServerError> {
        Ok(())
    }
}

/// In-process relay: a shared bundle log with its own id generator.
/// Used by tests and by same-process federation of two servers.
pub struct MemoryRelay {
    inner: Mutex<MemoryRelayState>,
}

struct MemoryRelayState {
    ident: IdentityGen,
    bundles: Vec<Bundle>,
}

/// Generator number reserved for relay bundle ids.
const RELAY_GENERATOR: u32 = u32::MAX;

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> MemoryRelay {
        MemoryRelay {
            inner: Mutex::new(MemoryRelayState {
                ident: IdentityGen::new(RELAY_GENERATOR),
                bundles: Vec::new(),
            }),
        }
    }

    /// Number of bundles published so far.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.bundles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.bundles.is_empty()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn read(
        &self,
        _server: Uuid,
        _secret: &Secret,
        since: Uuid,
        max: usize,
    ) -> Result<Vec<Bundle>, ServerError> {
        let state = self.inner.lock().await;
        let start = if since.is_null() {
            0
        } else {
            match state.bundles.iter().position(|b| b.id == since) {
                Some(index) => index + 1,
                // Unknown cursor: replay from the beginning; bundle
                // application is idempotent on the receiving side.
                None => 0,
            }
        };
        Ok(state.bundles.iter().skip(start).take(max).cloned().collect())
    }

    async fn write(
        &self,
        _server: Uuid,
        _secret: &Secret,
        user: Component,
        conversation: Component,
        message: Component,
    ) -> Result<(), ServerError> {
        let mut state = self.inner.lock().await;
        let id = state.ident.next();
        state.bundles.push(Bundle {
            id,
            user,
            conversation,
            message,
        });
        Ok(())
    }
}
