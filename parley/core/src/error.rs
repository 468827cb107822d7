//! Error Types
//!
//! Typed failures for every layer of the core. Each enum maps to one class of
//! failure with its own recovery policy:
//!
//! - [`TransportError`]: a connection dropped. Triggers cleanup, never retried.
//! - [`ProviderError`]: a recognizer, generator or synthesizer failed. Degraded
//!   locally (silent payload or an error message to the affected clients).
//! - [`ProtocolError`]: an inbound message could not be decoded. Logged and
//!   ignored, the connection stays open.
//! - [`GroupError`]: an invalid group operation. Reported to the initiator as a
//!   structured result, no state change.
//! - [`TurnError`]: everything a conversation body can fail with, including
//!   cancellation (expected control flow, never shown as an error).

use thiserror::Error;

use crate::session::ClientId;

/// Failure sending to a client connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The client is gone (unregistered or its channel closed)
    #[error("client {0} is not connected")]
    Closed(ClientId),
    /// The client's outbound channel is full
    #[error("outbound channel for client {0} is full")]
    Full(ClientId),
}

/// Failure inside an external capability (recognizer, generator, synthesizer)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The capability is switched off for this session
    #[error("{0} is disabled")]
    Disabled(&'static str),
    /// The backend could not be reached
    #[error("request to {backend} failed: {reason}")]
    Request {
        /// Backend name
        backend: &'static str,
        /// Underlying failure
        reason: String,
    },
    /// The backend answered with an error
    #[error("{backend} returned an error: {reason}")]
    Backend {
        /// Backend name
        backend: &'static str,
        /// Error text from the backend
        reason: String,
    },
    /// A streamed response broke off mid-way
    #[error("stream from {backend} failed: {reason}")]
    Stream {
        /// Backend name
        backend: &'static str,
        /// Underlying failure
        reason: String,
    },
}

impl ProviderError {
    /// Whether this failure is the expected result of a switched-off capability
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled(_))
    }
}

/// Inbound message decode failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not a JSON object, or fields of the wrong shape
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The object carries no `type` string
    #[error("message has no type field")]
    MissingType,
    /// The `type` is not one the server understands
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Rejected group operation
///
/// The `Display` text is sent verbatim to the initiator in a
/// `group-operation-result`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// The invitee is not a connected client
    #[error("Invitee {0} does not exist")]
    UnknownInvitee(ClientId),
    /// The invitee already belongs to a group
    #[error("Invitee {0} is already in a group")]
    AlreadyGrouped(ClientId),
    /// A client tried to invite themself
    #[error("Cannot invite yourself")]
    SelfInvite,
    /// The initiator is not a connected client
    #[error("Client {0} is not connected")]
    UnknownClient(ClientId),
    /// The removal target is not in any group
    #[error("Target {0} is not in any group")]
    NotInGroup(ClientId),
    /// The remover is neither the owner nor the target
    #[error("Only group owner or self can remove members")]
    NotPermitted,
}

/// Why a conversation turn stopped early
#[derive(Debug, Clone, Error)]
pub enum TurnError {
    /// A provider failed in a way the turn cannot degrade around
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The speaker's connection went away
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The owning task was cancelled
    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Cancellation is control flow, not a failure worth reporting
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_error_messages_are_user_facing() {
        let invitee = ClientId::from("bob");
        assert_eq!(
            GroupError::UnknownInvitee(invitee.clone()).to_string(),
            "Invitee bob does not exist"
        );
        assert_eq!(
            GroupError::AlreadyGrouped(invitee).to_string(),
            "Invitee bob is already in a group"
        );
        assert_eq!(
            GroupError::NotPermitted.to_string(),
            "Only group owner or self can remove members"
        );
    }

    #[test]
    fn test_turn_error_from_provider() {
        let err: TurnError = ProviderError::Disabled("recognizer").into();
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "recognizer is disabled");
        assert!(TurnError::Cancelled.is_cancelled());
    }
}
