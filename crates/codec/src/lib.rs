//! Wire codec for the networking core: bit-granular cursors, owned message
//! buffers, salted identifiers and the reserved protocol message shapes.
//!
//! This crate only knows about the *wire*. It has no notion of a socket, a
//! scheduler, or a scene graph — those live one layer up, in `netcode-peer`.
//! Splitting the codec out this way mirrors a common split between a
//! sans-io attribute codec and the service crate that drives sockets.

pub mod argument;
pub mod bitview;
pub mod buffer;
pub mod identifiers;
pub mod message_type;
pub mod property;

use std::str::Utf8Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied bit width or value is out of range for the type
    /// being packed (e.g. > 64 bits requested from `read_bits`).
    InvalidInput,
    /// The cursor ran out of bits before a read or write completed.
    UnexpectedEnd,
    /// More than the permitted 7 bits remained unused in the final byte
    /// after a message was expected to be fully consumed.
    TrailingBits,
    /// A `MessageTypeIdentifier` on the wire did not match any registered
    /// or reserved type.
    UnknownMessageType,
    /// A string argument's bytes were not valid UTF-8.
    Utf8Error,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Self {
        Self::Utf8Error
    }
}
