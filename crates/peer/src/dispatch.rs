//! Per-message-type dispatch closures.
//!
//! Rather than a positional six-register argument file,
//! every registered [`MessageType`](codec::message_type::MessageType) owns a
//! boxed closure captured at registration time. The entity/component scene
//! graph the original dispatch routes through is an external collaborator
//! this crate doesn't have, so the `Component`/`DataComponent` kinds
//! fold into [`Handler::Object`]: the opaque owner handle bound to a
//! `BoundObjectIdentifier` already stands in for "however deep into the
//! scene graph the embedding application wants to resolve it".

use codec::bitview::BitReader;
use codec::identifiers::ClientIdentifier;

use crate::error::Rejection;
use crate::registry::OwnerHandle;
use crate::transport::RemotePeerId;

/// Everything a handler needs about who sent a message and on which
/// channel, independent of the message's own payload.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext {
    pub remote: RemotePeerId,
    pub channel: u8,
    /// `Some` on the host, naming which connected client sent this;
    /// `None` on the client, where the only possible sender is the host.
    pub sender_client: Option<ClientIdentifier>,
}

type PlainFn = dyn Fn(&DispatchContext, &mut BitReader) -> Result<(), Rejection> + Send + Sync;
type ObjectFn =
    dyn Fn(&DispatchContext, &OwnerHandle, &mut BitReader) -> Result<(), Rejection> + Send + Sync;

/// The closure a registered message type invokes once direction and
/// authority checks have already passed.
pub enum Handler {
    /// Not tied to a bound object: `(peer context, remaining payload)`.
    Plain(Box<PlainFn>),
    /// Targets a bound object's opaque owner handle, already resolved:
    /// `(peer context, owner handle, remaining payload)`.
    Object(Box<ObjectFn>),
}

impl Handler {
    pub fn is_object_targeted(&self) -> bool {
        matches!(self, Handler::Object(_))
    }
}
