//! Authority checks. Delegation itself — which requires sending
//! revoke/give messages in order — is orchestrated by [`crate::host::HostPeer`];
//! this module holds the pure predicate both the host and the client
//! dispatch paths consult.

use codec::identifiers::{BoundObjectIdentifier, ClientIdentifier};
use codec::message_type::MessageFlags;

use crate::registry::BoundObjectRegistry;

/// `CanHandleBoundObjectMessage(obj, sender, msgTypeFlags)`.
///
/// Host side: accepted iff the type allows bypassing authority, or the host
/// has delegated authority on `obj` to exactly `sender`. Client side is not
/// modeled here — every message from the host is accepted (see
/// [`ClientPeer`](crate::client::ClientPeer), which never calls this).
pub fn host_can_handle(
    objects: &BoundObjectRegistry,
    obj: BoundObjectIdentifier,
    sender: ClientIdentifier,
    flags: MessageFlags,
) -> bool {
    if flags.contains(MessageFlags::ALLOW_WITHOUT_AUTHORITY) {
        return true;
    }

    !objects.host_has_authority(obj) && objects.authority_delegate(obj) == Some(sender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::message_type::MessageFlags;

    #[test]
    fn delegate_client_is_allowed_non_bypass_messages() {
        let objects = BoundObjectRegistry::new();
        let obj = objects.bind(None, std::sync::Arc::new(()));
        let client = ClientIdentifier::from_slot(0, 1);
        objects.set_authority_delegate(obj, client);

        assert!(host_can_handle(&objects, obj, client, MessageFlags::default()));
    }

    #[test]
    fn a_different_client_is_rejected_without_the_bypass_flag() {
        let objects = BoundObjectRegistry::new();
        let obj = objects.bind(None, std::sync::Arc::new(()));
        let delegate = ClientIdentifier::from_slot(0, 1);
        let other = ClientIdentifier::from_slot(1, 1);
        objects.set_authority_delegate(obj, delegate);

        assert!(!host_can_handle(&objects, obj, other, MessageFlags::default()));
    }

    #[test]
    fn bypass_flag_allows_anyone_even_without_delegation() {
        let objects = BoundObjectRegistry::new();
        let obj = objects.bind(None, std::sync::Arc::new(()));
        let client = ClientIdentifier::from_slot(0, 1);

        assert!(host_can_handle(
            &objects,
            obj,
            client,
            MessageFlags::ALLOW_WITHOUT_AUTHORITY
        ));
    }
}
