use crate::registry::ConnectionId;
use shared::ProtocolError;
use thiserror::Error;

/// Per-connection failures; none of these are fatal to the process
#[derive(Debug, Error)]
pub enum HubError {
    #[error("A master device is already connected")]
    RoleConflict,
    #[error("connection {0} did not select a role in time")]
    RoleSelectionTimeout(ConnectionId),
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),
    #[error("message from unregistered connection {0}")]
    UnregisteredSender(ConnectionId),
    #[error("transport error on connection {0}: {1}")]
    Transport(ConnectionId, String),
}
