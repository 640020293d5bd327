//! `MessageTypeRegistry` and `BoundObjectRegistry`: the two lookup tables
//! every peer carries regardless of whether it's a host or a client.

use std::any::Any;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::RwLock;

use codec::identifiers::{BoundObjectIdentifier, ClientIdentifier, MessageTypeIdentifier};
use codec::message_type::{Guid, MessageType};

use crate::dispatch::Handler;

/// A registered message type paired with the closure that dispatches it.
/// Immutable once inserted — re-registration under the same identifier is a
/// caller bug, not a runtime path this crate defends against.
pub struct Registration {
    pub message_type: MessageType,
    pub handler: Handler,
}

/// Maps `MessageTypeIdentifier -> Registration` and `Guid -> MessageTypeIdentifier`
/// so that both directions of the lookup are O(1).
///
/// Reserved protocol types (`0..DefaultMessageType::COUNT`) are never stored
/// here — they're dispatched directly by the peer tick loop. Values in that
/// range are protocol-reserved and never available for application use.
#[derive(Default)]
pub struct MessageTypeRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_identifier: HashMap<MessageTypeIdentifier, Arc<Registration>>,
    by_guid: HashMap<Guid, MessageTypeIdentifier>,
    next_slot: usize,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new type at the next free session-scoped slot, starting
    /// past the reserved `DefaultMessageType` range. Returns the identifier
    /// assigned.
    pub fn register(
        &self,
        function_guid: Guid,
        build: impl FnOnce(MessageTypeIdentifier) -> Registration,
    ) -> MessageTypeIdentifier {
        let mut inner = self.inner.write();
        let slot = inner.next_slot;
        inner.next_slot += 1;

        let identifier = MessageTypeIdentifier::from_slot(
            slot + codec::message_type::DefaultMessageType::COUNT as usize,
            0,
        );

        let registration = build(identifier);
        inner.by_guid.insert(function_guid, identifier);
        inner.by_identifier.insert(identifier, Arc::new(registration));
        identifier
    }

    pub fn lookup(&self, identifier: MessageTypeIdentifier) -> Option<Arc<Registration>> {
        self.inner.read().by_identifier.get(&identifier).cloned()
    }

    /// `FindMessageIdentifier<Function>()` from the client API.
    pub fn identifier_for_guid(&self, guid: Guid) -> Option<MessageTypeIdentifier> {
        self.inner.read().by_guid.get(&guid).copied()
    }

    pub fn iter_registered(&self) -> Vec<(MessageTypeIdentifier, Arc<Registration>)> {
        self.inner
            .read()
            .by_identifier
            .iter()
            .map(|(id, reg)| (*id, reg.clone()))
            .collect()
    }

    /// Records a registration at an identifier the HOST already assigned,
    /// rather than allocating a new one locally. The client side of the
    /// registration protocol learns every session-scoped identifier
    /// this way, from `RegisterNewMessageType`/`RegisterPropertyStreamMessage`
    /// — it never allocates its own.
    pub fn register_at(&self, identifier: MessageTypeIdentifier, function_guid: Guid, registration: Registration) {
        let mut inner = self.inner.write();
        inner.by_guid.insert(function_guid, identifier);
        inner.by_identifier.insert(identifier, Arc::new(registration));
    }

    /// Drops every learned registration. Used on disconnect: a client's
    /// entire message-type table is handshake-derived, so a reconnect starts
    /// from a clean slate rather than risking stale identifiers from a
    /// previous session (a reconnect unregisters all non-default message types).
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.by_identifier.clear();
        inner.by_guid.clear();
        inner.next_slot = 0;
    }
}

/// An opaque owner handle: a pointer plus type tag standing in for whatever
/// object a `BoundObjectIdentifier` names. The entity/component scene graph
/// that would normally back this is an external collaborator, so this crate
/// only stores and returns whatever the embedding application handed it at
/// bind time.
pub type OwnerHandle = Arc<dyn Any + Send + Sync>;

struct BoundObjectEntry {
    owner: OwnerHandle,
    persistent_guid: Option<Guid>,
}

/// Maps `BoundObjectIdentifier -> owner handle` and `persistent Guid ->
/// BoundObjectIdentifier`, plus the authority bitmask/delegate map from
/// entity.
#[derive(Default)]
pub struct BoundObjectRegistry {
    inner: RwLock<BoundObjectInner>,
}

#[derive(Default)]
struct BoundObjectInner {
    objects: HashMap<BoundObjectIdentifier, BoundObjectEntry>,
    by_guid: HashMap<Guid, BoundObjectIdentifier>,
    /// Host-only: `None` means the host holds authority (the default);
    /// `Some(client)` names the delegate.
    authority_delegate: HashMap<BoundObjectIdentifier, ClientIdentifier>,
    next_slot: usize,
}

impl BoundObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `BindObject(persistentGuid, object)`. Returns the newly assigned
    /// identifier, authoritative to the host by default.
    pub fn bind(&self, persistent_guid: Option<Guid>, owner: OwnerHandle) -> BoundObjectIdentifier {
        let mut inner = self.inner.write();
        let slot = inner.next_slot;
        inner.next_slot += 1;
        let identifier = BoundObjectIdentifier::from_slot(slot, 0);

        inner.objects.insert(
            identifier,
            BoundObjectEntry {
                owner,
                persistent_guid,
            },
        );

        if let Some(guid) = persistent_guid {
            inner.by_guid.insert(guid, identifier);
        }

        identifier
    }

    /// Mirrors an `ObjectBound` message on the client: the host already
    /// assigned `identifier`, so the client records it directly rather
    /// than allocating its own slot.
    pub fn bind_at(&self, identifier: BoundObjectIdentifier, persistent_guid: Guid, owner: OwnerHandle) {
        let mut inner = self.inner.write();
        inner.objects.insert(
            identifier,
            BoundObjectEntry {
                owner,
                persistent_guid: Some(persistent_guid),
            },
        );
        inner.by_guid.insert(persistent_guid, identifier);
    }

    pub fn resolve(&self, identifier: BoundObjectIdentifier) -> Option<OwnerHandle> {
        self.inner.read().objects.get(&identifier).map(|e| e.owner.clone())
    }

    pub fn identifier_for_guid(&self, guid: Guid) -> Option<BoundObjectIdentifier> {
        self.inner.read().by_guid.get(&guid).copied()
    }

    pub fn persistent_guids(&self) -> Vec<(BoundObjectIdentifier, Guid)> {
        self.inner
            .read()
            .objects
            .iter()
            .filter_map(|(id, entry)| entry.persistent_guid.map(|g| (*id, g)))
            .collect()
    }

    pub fn contains(&self, identifier: BoundObjectIdentifier) -> bool {
        self.inner.read().objects.contains_key(&identifier)
    }

    /// `HasAuthorityOfBoundObject` on the host side: true unless delegated
    /// away.
    pub fn host_has_authority(&self, identifier: BoundObjectIdentifier) -> bool {
        !self.inner.read().authority_delegate.contains_key(&identifier)
    }

    pub fn authority_delegate(&self, identifier: BoundObjectIdentifier) -> Option<ClientIdentifier> {
        self.inner.read().authority_delegate.get(&identifier).copied()
    }

    /// Records `m_boundObjectsAuthorityClients[obj] = newClient` and clears
    /// the host bit. Pure bookkeeping; the host.rs orchestration layer is
    /// responsible for sending the revoke/give messages in order first.
    pub fn set_authority_delegate(&self, identifier: BoundObjectIdentifier, client: ClientIdentifier) {
        self.inner.write().authority_delegate.insert(identifier, client);
    }

    /// `RevokeBoundObjectAuthority`'s bookkeeping half: sets the host bit
    /// back.
    pub fn clear_authority_delegate(&self, identifier: BoundObjectIdentifier) {
        self.inner.write().authority_delegate.remove(&identifier);
    }

    pub fn remove(&self, identifier: BoundObjectIdentifier) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.objects.remove(&identifier) {
            if let Some(guid) = entry.persistent_guid {
                inner.by_guid.remove(&guid);
            }
        }
        inner.authority_delegate.remove(&identifier);
    }

    /// Drops every binding and authority delegate. A client's bound-object
    /// table is entirely host-assigned, so a fresh connection after a
    /// disconnect starts empty rather than resolving stale identifiers.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.objects.clear();
        inner.by_guid.clear();
        inner.authority_delegate.clear();
        inner.next_slot = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_an_object_assigns_the_first_slot_to_one() {
        let registry = BoundObjectRegistry::new();
        let id = registry.bind(Some(Guid(1)), Arc::new(()));
        assert_eq!(id.slot(), Some(0));
        assert!(registry.contains(id));
    }

    #[test]
    fn host_holds_authority_until_delegated() {
        let registry = BoundObjectRegistry::new();
        let id = registry.bind(Some(Guid(1)), Arc::new(()));
        assert!(registry.host_has_authority(id));

        registry.set_authority_delegate(id, ClientIdentifier::from_slot(0, 1));
        assert!(!registry.host_has_authority(id));
        assert_eq!(registry.authority_delegate(id), Some(ClientIdentifier::from_slot(0, 1)));

        registry.clear_authority_delegate(id);
        assert!(registry.host_has_authority(id));
    }

    #[test]
    fn message_type_registration_skips_the_reserved_range() {
        let registry = MessageTypeRegistry::new();
        let id = registry.register(Guid(42), |identifier| Registration {
            message_type: MessageType {
                identifier,
                function_guid: Guid(42),
                kind: codec::message_type::MessageKind::Plain,
                flags: codec::message_type::MessageFlags::CLIENT_TO_HOST,
                fixed_compressed_bits: 0,
            },
            handler: crate::dispatch::Handler::Plain(Box::new(|_, _| Ok(()))),
        });

        assert_eq!(
            id.slot(),
            Some(codec::message_type::DefaultMessageType::COUNT as usize)
        );
        assert_eq!(registry.identifier_for_guid(Guid(42)), Some(id));
    }
}
