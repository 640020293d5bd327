//! Session hooks: a small helper for application code that wants to queue
//! sends made against a [`BoundObjectIdentifier`](codec::identifiers::BoundObjectIdentifier)
//! before one has been assigned, rather than block the caller or drop the
//! message. This is the only persistent queue anywhere in the send path —
//! everything else either sends immediately or is rejected outright.

use parking_lot::Mutex;

use codec::bitview::BitWriter;
use codec::identifiers::{BoundObjectIdentifier, MessageTypeIdentifier};

use crate::transport::ChannelFlags;

type PackFn = dyn FnOnce(&mut BitWriter) + Send;

/// One send that was attempted before its owning component had a resolved
/// identifier.
pub struct QueuedSend {
    pub message_type: MessageTypeIdentifier,
    pub channel: u8,
    pub channel_flags: ChannelFlags,
    pub bits: usize,
    pub pack: Box<PackFn>,
}

/// Binds an application-side component to a not-yet-assigned bound object,
/// buffering sends attempted against it until [`resolve`](Self::resolve)
/// is called from an `ObjectBound` handler.
#[derive(Default)]
pub struct BoundComponent {
    identifier: Mutex<Option<BoundObjectIdentifier>>,
    queued: Mutex<Vec<QueuedSend>>,
}

impl BoundComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identifier(&self) -> Option<BoundObjectIdentifier> {
        *self.identifier.lock()
    }

    pub fn is_bound(&self) -> bool {
        self.identifier.lock().is_some()
    }

    /// Marks the component bound and hands back every send that was queued
    /// while it waited, in the order they were made, for the caller to
    /// replay through its own send path.
    pub fn resolve(&self, identifier: BoundObjectIdentifier) -> Vec<QueuedSend> {
        *self.identifier.lock() = Some(identifier);
        std::mem::take(&mut *self.queued.lock())
    }

    /// Returns the resolved identifier if one exists; otherwise queues the
    /// send for replay and returns `None`.
    pub fn send_or_queue(
        &self,
        message_type: MessageTypeIdentifier,
        channel: u8,
        channel_flags: ChannelFlags,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter) + Send + 'static,
    ) -> Option<BoundObjectIdentifier> {
        let current = *self.identifier.lock();
        if current.is_some() {
            return current;
        }

        self.queued.lock().push(QueuedSend {
            message_type,
            channel,
            channel_flags,
            bits,
            pack: Box::new(pack),
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn a_send_before_resolution_is_queued_and_handed_back_in_order() {
        let component = BoundComponent::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result = component.send_or_queue(MessageTypeIdentifier::from_slot(13, 0), 2, ChannelFlags::Reliable, 0, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            assert!(result.is_none());
        }

        let queued = component.resolve(BoundObjectIdentifier::from_slot(0, 1));
        assert_eq!(queued.len(), 3);
        assert!(component.is_bound());
    }

    #[test]
    fn a_send_after_resolution_is_not_queued() {
        let component = BoundComponent::new();
        let identifier = BoundObjectIdentifier::from_slot(4, 1);
        component.resolve(identifier);

        let result = component.send_or_queue(MessageTypeIdentifier::from_slot(13, 0), 2, ChannelFlags::Reliable, 0, |_| {});
        assert_eq!(result, Some(identifier));
        assert!(component.resolve(identifier).is_empty());
    }
}
