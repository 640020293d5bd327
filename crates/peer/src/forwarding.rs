//! Message forwarding: host-mediated client-to-client relay with
//! authority re-validation, so a client can't launder an unauthorised
//! message through the host onto another client.

use codec::bitview::{BitReader, BitWriter};
use codec::identifiers::{BoundObjectIdentifier, ClientIdentifier, MessageTypeIdentifier};
use codec::message_type::{DefaultMessageType, MessageFlags};

use crate::dispatch::Handler;
use crate::error::Rejection;
use crate::registry::{BoundObjectRegistry, MessageTypeRegistry};

fn read_message_type_identifier(reader: &mut BitReader) -> Result<MessageTypeIdentifier, Rejection> {
    MessageTypeIdentifier::unpack(reader, 0).map_err(|_| Rejection::MalformedArguments)
}

fn read_bound_object_identifier(reader: &mut BitReader) -> Result<BoundObjectIdentifier, Rejection> {
    BoundObjectIdentifier::unpack(reader, 0).map_err(|_| Rejection::MalformedArguments)
}

/// Who a forwarded message should ultimately reach, decided by which of
/// the two request message types wrapped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardScope {
    /// `RequestForwardMessageToOtherClients`: every other connected client.
    OtherClients,
    /// `RequestForwardMessageToAllRemotes`: every other client, plus the
    /// host itself unless the source is also a host-local client.
    AllRemotes,
}

/// Re-validates the sender's authority over the inner message exactly as
/// [`crate::host::HostPeer`]'s normal dispatch would, without invoking its
/// handler. Returns the inner payload bytes (still positioned at the start
/// of the inner message) on success.
///
/// This is the "copy the bit view to a temporary cursor" + "preprocess the
/// inner message ... to re-validate the sender's authority" step of the
/// forwarding protocol; the actual relay send and the host-local dispatch
/// the `AllRemotes` variant also performs are orchestrated by `HostPeer`
/// because they need its client registry and transport handle.
pub fn revalidate_inner_message(
    message_types: &MessageTypeRegistry,
    objects: &BoundObjectRegistry,
    sender: ClientIdentifier,
    channel: u8,
    inner: &[u8],
) -> Result<(), Rejection> {
    let mut reader = BitReader::new(inner);

    let type_identifier = read_message_type_identifier(&mut reader)?;

    if (type_identifier.slot().unwrap_or(0) as u32) < DefaultMessageType::COUNT {
        // Protocol-reserved types are never forwardable between clients.
        return Err(Rejection::UnknownMessageType);
    }

    let registration = message_types
        .lookup(type_identifier)
        .ok_or(Rejection::UnknownMessageType)?;

    if !registration
        .message_type
        .flags
        .contains(MessageFlags::CLIENT_TO_CLIENT)
    {
        return Err(Rejection::DirectionMismatch);
    }

    if let Handler::Object(_) = &registration.handler {
        let obj = read_bound_object_identifier(&mut reader)?;
        if !objects.contains(obj) {
            return Err(Rejection::UnknownBoundObject);
        }

        if !crate::authority::host_can_handle(objects, obj, sender, registration.message_type.flags) {
            return Err(Rejection::AuthorityDenied);
        }
    }

    let _ = channel;
    Ok(())
}

/// Builds the `ReceivedForwardedMessage` wrapper a target client will
/// unwrap and dispatch directly.
pub fn wrap_forwarded(inner: &[u8]) -> Vec<u8> {
    wrap_with(DefaultMessageType::ReceivedForwardedMessage, inner)
}

/// Prefixes `inner` with `kind`'s identifier, treating the rest as an
/// opaque bit stream. Shared by the host's `ReceivedForwardedMessage`
/// wrapping and the client's `RequestForwardMessageTo*` envelope — both
/// sides of one hop through the same relay protocol.
pub fn wrap_with(kind: DefaultMessageType, inner: &[u8]) -> Vec<u8> {
    let total_bits = codec::identifiers::MessageTypeIdentifier::BITS as usize + inner.len() * 8;
    let mut bytes = vec![0u8; total_bits.div_ceil(8)];
    {
        let mut writer = BitWriter::new(&mut bytes);
        let _ = kind.identifier().pack(&mut writer);
        for byte in inner {
            let _ = writer.write_bits(*byte as u64, 8);
        }
    }
    bytes
}

/// Who, besides the sender, the forward protocol must deliver to: used by
/// `HostPeer` to build its fan-out list.
pub fn targets<'a>(
    all_clients: impl Iterator<Item = ClientIdentifier> + 'a,
    sender: ClientIdentifier,
) -> impl Iterator<Item = ClientIdentifier> + 'a {
    all_clients.filter(move |c| *c != sender)
}
