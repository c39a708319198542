//! Error kinds shared across the server.

use thiserror::Error;

use crate::uid::Uuid;
use crate::wire::WireError;

/// Errors that can occur while servicing requests, replaying the journal,
/// or talking to the relay.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed bytes on a connection. Surfaces as an aborted connection.
    #[error("malformed wire data: {0}")]
    Wire(#[from] WireError),

    /// A create operation referenced a user or conversation we don't have.
    /// Handlers answer these with a NULLABLE-absent body.
    #[error("unknown entity: {0}")]
    UnknownEntity(Uuid),

    /// Replay supplied an id that already exists. The live API never
    /// generates this; the replayer logs and skips.
    #[error("duplicate id: {0}")]
    Duplicate(Uuid),

    /// The transaction log could not be appended. Fatal: the in-memory
    /// model has diverged from durable state.
    #[error("transaction log append failed: {0}")]
    Journal(#[source] std::io::Error),

    /// Transient relay failure; the pump logs and retries at the next tick.
    #[error("relay failure: {0}")]
    Relay(String),

    /// Per-connection i/o failure; the handling task closes the socket.
    #[error("connection i/o: {0}")]
    Connection(#[source] std::io::Error),
}
