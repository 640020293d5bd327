//! Reserved wire-level message types and the wire-relevant description of a
//! registered [`MessageType`].
//!
//! This module only covers the shape of a message type as it exists on the
//! wire (flags, GUID, fixed size) plus the thirteen protocol messages every
//! peer understands before any application type is registered. The dispatch
//! trampoline a registered type invokes lives one layer up, in the peer
//! engine, because it needs to know about bound objects and components this
//! crate doesn't.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bitview::{BitReader, BitWriter};
use crate::identifiers::{BoundObjectIdentifier, ClientIdentifier, MessageTypeIdentifier, SequenceNumber};
use crate::Error;

/// A stable identifier for a reflected function or networked type, fingerprinted
/// ahead of time rather than looked up by name at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub u64);

impl Guid {
    pub const BITS: u32 = 64;

    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        w.write_bits(self.0, Self::BITS)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self(r.read_bits(Self::BITS)?))
    }
}

/// Reserved, protocol-assigned message type indices. Values `0..COUNT` are
/// never handed out to application-registered types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum DefaultMessageType {
    LocalPeerConnected = 0,
    RegisterNewMessageType = 1,
    RegisterPropertyStreamMessage = 2,
    BatchMessages = 3,
    ObjectBound = 4,
    ConfirmPropagatedPropertyReceipt = 5,
    BoundObjectAuthorityGivenToLocalClient = 6,
    BoundObjectAuthorityRevokedFromLocalClient = 7,
    RequestForwardMessageToOtherClients = 8,
    RequestForwardMessageToAllRemotes = 9,
    ReceivedForwardedMessage = 10,
    RequestTimeSync = 11,
    ReceivedTimeSyncResponse = 12,
}

impl DefaultMessageType {
    pub const COUNT: u32 = 13;

    pub fn identifier(self) -> MessageTypeIdentifier {
        MessageTypeIdentifier::from_slot(u16::from(self) as usize, 0)
    }
}

/// Direction and behavior flags carried by a registered message type.
///
/// # Test
///
/// ```
/// use netcode_codec::message_type::MessageFlags;
///
/// let flags = MessageFlags::CLIENT_TO_HOST | MessageFlags::ALLOW_WITHOUT_AUTHORITY;
/// assert!(flags.contains(MessageFlags::CLIENT_TO_HOST));
/// assert!(!flags.contains(MessageFlags::HOST_TO_CLIENT));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u16);

impl MessageFlags {
    pub const HOST_TO_CLIENT: Self = Self(1 << 0);
    pub const CLIENT_TO_HOST: Self = Self(1 << 1);
    pub const CLIENT_TO_CLIENT: Self = Self(1 << 2);
    pub const ALLOW_WITHOUT_AUTHORITY: Self = Self(1 << 3);
    pub const DYNAMIC_SIZE: Self = Self(1 << 4);
    pub const PROPAGATE_CLIENT_TO_HOST: Self = Self(1 << 5);
    pub const PROPAGATE_CLIENT_TO_CLIENT: Self = Self(1 << 6);
    pub const SENT_WITH_NETWORKED_FUNCTIONS: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What an object-function message resolves its first register against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Plain message, not tied to a bound object.
    Plain,
    /// Targets a whole bound object (an opaque owner handle).
    Object,
    /// Targets one component of a bound object.
    Component,
    /// Targets one data-component of a bound object's component.
    DataComponent,
    /// A batched property delta for a property-stream type.
    StreamedProperty,
}

impl MessageKind {
    pub fn is_object_function(self) -> bool {
        !matches!(self, MessageKind::Plain)
    }
}

/// Wire-relevant description of a registered message type. Immutable once
/// built; the peer engine pairs this with a dispatch closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub identifier: MessageTypeIdentifier,
    pub function_guid: Guid,
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub fixed_compressed_bits: u32,
}

// --- Reserved message payloads -------------------------------------------------

pub struct LocalPeerConnected {
    pub client_identifier: ClientIdentifier,
    pub client_bound_object: BoundObjectIdentifier,
    pub host_timestamp: i64,
}

impl LocalPeerConnected {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        self.client_identifier.pack(w)?;
        self.client_bound_object.pack(w)?;
        w.write_bits(self.host_timestamp as u64, 64)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            client_identifier: ClientIdentifier::unpack(r, 0)?,
            client_bound_object: BoundObjectIdentifier::unpack(r, 0)?,
            host_timestamp: r.read_bits(64)? as i64,
        })
    }
}

pub struct RegisterNewMessageType {
    pub message_type: MessageTypeIdentifier,
    pub function_guid: Guid,
    pub fixed_compressed_data_size_bits: u16,
}

impl RegisterNewMessageType {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        self.message_type.pack(w)?;
        self.function_guid.pack(w)?;
        w.write_bits(self.fixed_compressed_data_size_bits as u64, 16)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            message_type: MessageTypeIdentifier::unpack(r, 0)?,
            function_guid: Guid::unpack(r)?,
            fixed_compressed_data_size_bits: r.read_bits(16)? as u16,
        })
    }
}

pub struct RegisterPropertyStreamMessageHeader {
    pub message_type: MessageTypeIdentifier,
    pub type_guid: Guid,
    pub property_count: u16,
}

impl RegisterPropertyStreamMessageHeader {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        self.message_type.pack(w)?;
        self.type_guid.pack(w)?;
        w.write_bits(self.property_count as u64, 16)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            message_type: MessageTypeIdentifier::unpack(r, 0)?,
            type_guid: Guid::unpack(r)?,
            property_count: r.read_bits(16)? as u16,
        })
    }
}

pub struct BatchMessagesHeader {
    pub message_count: u16,
}

impl BatchMessagesHeader {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        w.write_bits(self.message_count as u64, 16)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            message_count: r.read_bits(16)? as u16,
        })
    }
}

pub struct ObjectBound {
    pub bound_object: BoundObjectIdentifier,
    pub persistent_guid: Guid,
}

impl ObjectBound {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        self.bound_object.pack(w)?;
        self.persistent_guid.pack(w)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            bound_object: BoundObjectIdentifier::unpack(r, 0)?,
            persistent_guid: Guid::unpack(r)?,
        })
    }
}

pub struct ConfirmPropagatedPropertyReceipt {
    pub sequence_number: SequenceNumber,
    pub message_type: MessageTypeIdentifier,
}

impl ConfirmPropagatedPropertyReceipt {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        self.sequence_number.pack(w)?;
        self.message_type.pack(w)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            sequence_number: SequenceNumber::unpack(r)?,
            message_type: MessageTypeIdentifier::unpack(r, 0)?,
        })
    }
}

pub struct BoundObjectAuthorityMessage {
    pub bound_object: BoundObjectIdentifier,
}

impl BoundObjectAuthorityMessage {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        self.bound_object.pack(w)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            bound_object: BoundObjectIdentifier::unpack(r, 0)?,
        })
    }
}

pub struct RequestTimeSync {
    pub host_timestamp: i64,
    pub client_received_timestamp: i64,
    pub client_sent_timestamp: i64,
}

impl RequestTimeSync {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        w.write_bits(self.host_timestamp as u64, 64)?;
        w.write_bits(self.client_received_timestamp as u64, 64)?;
        w.write_bits(self.client_sent_timestamp as u64, 64)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            host_timestamp: r.read_bits(64)? as i64,
            client_received_timestamp: r.read_bits(64)? as i64,
            client_sent_timestamp: r.read_bits(64)? as i64,
        })
    }
}

pub struct ReceivedTimeSyncResponse {
    pub time_offset_nanoseconds: i64,
}

impl ReceivedTimeSyncResponse {
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        w.write_bits(self.time_offset_nanoseconds as u64, 64)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self {
            time_offset_nanoseconds: r.read_bits(64)? as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_message_type_round_trips_through_its_identifier() {
        let id = DefaultMessageType::BatchMessages.identifier();
        assert_eq!(id.slot(), Some(DefaultMessageType::BatchMessages as usize));
    }

    #[test]
    fn local_peer_connected_round_trips() {
        let msg = LocalPeerConnected {
            client_identifier: ClientIdentifier::from_slot(0, 0),
            client_bound_object: BoundObjectIdentifier::from_slot(3, 0),
            host_timestamp: 123_456_789,
        };

        let mut buf = [0u8; 16];
        msg.pack(&mut BitWriter::new(&mut buf)).unwrap();

        let decoded = LocalPeerConnected::unpack(&mut BitReader::new(&buf)).unwrap();
        assert_eq!(decoded.client_identifier.slot(), Some(0));
        assert_eq!(decoded.client_bound_object.slot(), Some(3));
        assert_eq!(decoded.host_timestamp, 123_456_789);
    }
}
