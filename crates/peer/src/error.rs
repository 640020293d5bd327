//! Peer-engine error taxonomy.
//!
//! Mirrors `codec::Error` at one layer up: a hand-rolled enum the dispatch
//! path matches on to decide a log severity, never a panic and never
//! `anyhow` (that lives only at the demo binary boundary).

use std::fmt;

/// Why an inbound message was rejected. Every variant is a reject, never a
/// disconnect — see the error handling section of the core design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The wire `MessageTypeIdentifier` does not name a registered or
    /// reserved type.
    UnknownMessageType,
    /// The message's direction flags do not include the sender's side.
    DirectionMismatch,
    /// The sender does not hold authority over the targeted bound object
    /// and the type does not allow bypassing that check.
    AuthorityDenied,
    /// The message targets a `BoundObjectIdentifier` with no live owner
    /// handle.
    UnknownBoundObject,
    /// Argument or property decoding ran past the payload or left more
    /// than the permitted trailing bits.
    MalformedArguments,
    /// A property-stream body claimed zero objects.
    EmptyPropertyStream,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Rejection::UnknownMessageType => "unknown message type",
            Rejection::DirectionMismatch => "message direction not receivable here",
            Rejection::AuthorityDenied => "sender lacks authority over bound object",
            Rejection::UnknownBoundObject => "bound object does not exist locally",
            Rejection::MalformedArguments => "argument or property decoding failed",
            Rejection::EmptyPropertyStream => "property stream carried zero objects",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Rejection {}

impl From<codec::Error> for Rejection {
    fn from(_: codec::Error) -> Self {
        Rejection::MalformedArguments
    }
}

/// Why an outbound send was refused locally, before anything touched the
/// transport. Distinct from `Rejection`, which is about inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No `MessageType` registered for the requested function GUID.
    Unregistered,
    /// The caller does not hold authority over the target bound object.
    NoAuthority,
    /// The message type's direction flags forbid sending from here.
    DirectionMismatch,
    /// The target bound object identifier is invalid or not locally known.
    UnknownBoundObject,
    /// There is no live connection to send through yet.
    NotConnected,
    /// The underlying transport reported a send failure.
    TransportFailure,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SendError::Unregistered => "message type not registered",
            SendError::NoAuthority => "no authority over bound object",
            SendError::DirectionMismatch => "message type cannot be sent from here",
            SendError::UnknownBoundObject => "bound object not known locally",
            SendError::NotConnected => "no live connection to send through",
            SendError::TransportFailure => "transport send failed",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for SendError {}
