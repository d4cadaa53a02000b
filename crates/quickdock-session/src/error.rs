//! Session and hub errors.

use quickdock_core::EngineError;
use thiserror::Error;

/// Exec session or log stream error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Session already closed")]
    AlreadyClosed,
}

/// Why a subscription stopped yielding snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("Subscriber could not keep up and was dropped")]
    SubscriberOverloaded,
    #[error("Subscription closed")]
    Closed,
}
