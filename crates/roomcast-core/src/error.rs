//! Engine error type.

use roomcast_protocol::ProtocolError;
use roomcast_transport::TransportError;
use thiserror::Error;

use crate::auth::AuthError;
use crate::store::LogError;
use crate::subscription::SubscriptionError;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid session.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The room name is not usable.
    #[error("Invalid room: {0}")]
    InvalidRoom(&'static str),

    /// The message log refused the operation.
    #[error(transparent)]
    Persistence(#[from] LogError),

    /// The room's transport subscription could not be opened.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// A transient record could not be published.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A record could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl EngineError {
    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Auth(AuthError::Unauthenticated) => "unauthenticated",
            EngineError::Auth(AuthError::InvalidSession(_)) => "invalid_session",
            EngineError::Auth(AuthError::Issue(_)) => "session_issue",
            EngineError::InvalidRoom(_) => "invalid_room",
            EngineError::Persistence(_) => "persistence",
            EngineError::Subscription(_) => "subscription",
            EngineError::Transport(_) => "transport",
            EngineError::Protocol(_) => "protocol",
        }
    }
}
