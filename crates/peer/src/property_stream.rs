//! Propagated-property streaming: rate-limited, delta-masked,
//! sequence-numbered replication of a registered type's networked
//! properties, with explicit acknowledgement and per-peer invalidation
//! queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::HashMap;
use parking_lot::{Mutex, RwLock};

use codec::bitview::{BitReader, BitWriter};
use codec::identifiers::{BoundObjectIdentifier, PropertyIndex, SequenceNumber};
use codec::message_type::{Guid, MessageFlags, MessageTypeIdentifier};
use codec::property::PropertyMask;

use crate::registry::OwnerHandle;

/// How many unacknowledged sequences may be in flight per (peer, type)
/// before `GetNewSequenceNumber` refuses to allocate another. Not named by
/// anywhere as a fixed constant; chosen generously relative to the default
/// 120 Hz tick rate so a multi-second stall is needed to exhaust it.
pub const SEND_WINDOW_SIZE: u16 = 1024;

/// Outcome of applying an acknowledgement to a [`SendWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Older than (or equal to) the last acknowledged sequence: ignore.
    Rejected,
    /// Progressed the window, but later sequences are still unacknowledged.
    Accepted,
    /// Every sequence sent so far is now acknowledged.
    AcceptedLastSentSequence,
}

/// Per-(peer, message-type) sequence allocator and acknowledgement tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendWindow {
    next_sequence: SequenceNumber,
    last_sent_sequence: SequenceNumber,
    last_acked_sequence: SequenceNumber,
    has_sent: bool,
    has_acked: bool,
}

impl SendWindow {
    /// Allocates the next sequence number to send, or `None` if
    /// `SEND_WINDOW_SIZE` unacknowledged sequences are already in flight.
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_peer::property_stream::SendWindow;
    ///
    /// let mut window = SendWindow::default();
    /// let first = window.allocate_sequence().unwrap();
    /// assert_eq!(first.0, 0);
    /// ```
    pub fn allocate_sequence(&mut self) -> Option<SequenceNumber> {
        let in_flight = self.next_sequence.0.wrapping_sub(self.last_acked_sequence.0);
        if self.has_sent && in_flight >= SEND_WINDOW_SIZE {
            return None;
        }

        let seq = self.next_sequence;
        self.next_sequence = seq.wrapping_next();
        Some(seq)
    }

    pub fn on_sequence_sent(&mut self, seq: SequenceNumber) {
        self.last_sent_sequence = seq;
        self.has_sent = true;
    }

    /// `sendWindow.OnSequenceAcknowledged`.
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_peer::property_stream::{AckOutcome, SendWindow};
    ///
    /// let mut window = SendWindow::default();
    /// let seq = window.allocate_sequence().unwrap();
    /// window.on_sequence_sent(seq);
    /// assert_eq!(window.on_sequence_acknowledged(seq), AckOutcome::AcceptedLastSentSequence);
    /// ```
    pub fn on_sequence_acknowledged(&mut self, seq: SequenceNumber) -> AckOutcome {
        if self.has_acked && !seq.is_newer_than(self.last_acked_sequence) {
            return AckOutcome::Rejected;
        }

        self.last_acked_sequence = seq;
        self.has_acked = true;

        if seq == self.last_sent_sequence {
            AckOutcome::AcceptedLastSentSequence
        } else {
            AckOutcome::Accepted
        }
    }
}

/// One registered property-stream type's per-peer dirty state.
pub struct TypeInfo {
    pub changed: bool,
    pub last_send: Option<Instant>,
    pub send_window: SendWindow,
    pub object_masks: HashMap<BoundObjectIdentifier, PropertyMask>,
}

impl Default for TypeInfo {
    fn default() -> Self {
        Self {
            changed: false,
            last_send: None,
            send_window: SendWindow::default(),
            object_masks: HashMap::default(),
        }
    }
}

/// One remote peer's invalidation state across every property-stream type:
/// the host holds one of these per connected client, the client holds
/// exactly one (for the host).
#[derive(Default)]
pub struct PerPeerPropagatedPropertyData {
    has_pending: AtomicBool,
    types: RwLock<HashMap<MessageTypeIdentifier, Arc<Mutex<TypeInfo>>>>,
}

impl PerPeerPropagatedPropertyData {
    pub fn has_pending_data_to_send(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    fn type_info(&self, message_type: MessageTypeIdentifier) -> Arc<Mutex<TypeInfo>> {
        if let Some(existing) = self.types.read().get(&message_type) {
            return existing.clone();
        }

        self.types
            .write()
            .entry(message_type)
            .or_insert_with(|| Arc::new(Mutex::new(TypeInfo::default())))
            .clone()
    }

    /// `Invalidate(messageTypeId, boundObjectId, propertyMask)`.
    pub fn invalidate(
        &self,
        message_type: MessageTypeIdentifier,
        bound_object: BoundObjectIdentifier,
        mask: PropertyMask,
    ) {
        let info = self.type_info(message_type);
        let mut info = info.lock();
        let entry = info.object_masks.entry(bound_object).or_insert(PropertyMask::EMPTY);
        *entry = entry.union(mask);
        info.changed = true;
        self.has_pending.store(true, Ordering::Release);
    }

    /// `FlushProperties(messageTypeId)`: zero the last-send time so the
    /// next tick does not wait out the rate limit.
    pub fn flush(&self, message_type: MessageTypeIdentifier) {
        if let Some(info) = self.types.read().get(&message_type) {
            info.lock().last_send = None;
        }
    }

    /// Drains every type whose rate-limit window has elapsed and which has
    /// dirty bits, allocating a sequence number and handing back the
    /// (object, mask) pairs to encode. Types the window can't allocate for
    /// (full) are skipped this tick, matching "MAY fail if window is full
    /// — then skip".
    pub fn due_for_send(
        &self,
        now: Instant,
        update_period: Duration,
    ) -> Vec<(MessageTypeIdentifier, SequenceNumber, Vec<(BoundObjectIdentifier, PropertyMask)>)> {
        let mut out = Vec::new();

        for (id, info) in self.types.read().iter() {
            let mut info = info.lock();
            if let Some(last) = info.last_send {
                if now.duration_since(last) < update_period {
                    continue;
                }
            }

            if !info.changed {
                continue;
            }

            let Some(seq) = info.send_window.allocate_sequence() else {
                continue;
            };

            let objects: Vec<_> = info.object_masks.iter().map(|(o, m)| (*o, *m)).collect();
            info.last_send = Some(now);
            info.changed = false;
            info.send_window.on_sequence_sent(seq);
            out.push((*id, seq, objects));
        }

        out
    }

    /// `ProcessConfirmationReceipt`.
    pub fn process_confirmation(&self, message_type: MessageTypeIdentifier, seq: SequenceNumber) {
        let info = match self.types.read().get(&message_type).cloned() {
            Some(info) => info,
            None => return,
        };

        let mut remove_entry = false;
        {
            let mut info = info.lock();
            match info.send_window.on_sequence_acknowledged(seq) {
                AckOutcome::Rejected => {}
                AckOutcome::Accepted => {}
                AckOutcome::AcceptedLastSentSequence => {
                    if !info.changed {
                        remove_entry = true;
                    }
                }
            }
        }

        if remove_entry {
            self.types.write().remove(&message_type);
        }

        if self.types.read().is_empty() {
            self.has_pending.store(false, Ordering::Release);
        }
    }

    /// Drops every type's dirty state. Used on disconnect: a fresh
    /// connection starts with nothing owed, rather than replaying whatever
    /// was pending against the previous session.
    pub fn clear(&self) {
        self.types.write().clear();
        self.has_pending.store(false, Ordering::Release);
    }
}

/// One reflected property within a property-stream type: its local index
/// (= its bit in the [`PropertyMask`]), flags, and a get/set pair working
/// against the opaque owner handle.
pub struct PropertyDescriptor {
    pub guid: Guid,
    pub flags: MessageFlags,
    pub encode: Box<dyn Fn(&OwnerHandle, &mut BitWriter) -> Result<(), codec::Error> + Send + Sync>,
    pub decode: Box<dyn Fn(&OwnerHandle, &mut BitReader) -> Result<(), codec::Error> + Send + Sync>,
}

/// A registered property-stream `MessageType`: the type GUID, the ordered
/// property list (index == bit position), and the identifier it was
/// assigned.
pub struct PropertyStreamType {
    pub identifier: MessageTypeIdentifier,
    pub type_guid: Guid,
    pub properties: Vec<PropertyDescriptor>,
}

impl PropertyStreamType {
    pub fn property_count(&self) -> u8 {
        self.properties.len() as u8
    }

    pub fn mask_bits(&self) -> u32 {
        PropertyMask::bits_for_count(self.property_count())
    }

    pub fn index_of(&self, guid: Guid) -> Option<PropertyIndex> {
        self.properties
            .iter()
            .position(|p| p.guid == guid)
            .map(|i| PropertyIndex(i as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_then_confirm_with_no_intervening_dirt_removes_the_entry() {
        let peer = PerPeerPropagatedPropertyData::default();
        let msg_type = MessageTypeIdentifier::from_slot(0, 0);
        let obj = BoundObjectIdentifier::from_slot(0, 0);

        peer.invalidate(msg_type, obj, PropertyMask::EMPTY);
        assert!(peer.has_pending_data_to_send());

        let sent = peer.due_for_send(Instant::now(), Duration::from_millis(0));
        assert_eq!(sent.len(), 1);
        let (_, seq, _) = sent[0];

        peer.process_confirmation(msg_type, seq);
        assert!(!peer.has_pending_data_to_send());
    }

    #[test]
    fn reinvalidating_between_send_and_ack_survives_the_ack() {
        let peer = PerPeerPropagatedPropertyData::default();
        let msg_type = MessageTypeIdentifier::from_slot(0, 0);
        let obj = BoundObjectIdentifier::from_slot(0, 0);

        peer.invalidate(msg_type, obj, PropertyMask::EMPTY);
        let sent = peer.due_for_send(Instant::now(), Duration::from_millis(0));
        let (_, seq, _) = sent[0];

        peer.invalidate(msg_type, obj, PropertyMask::EMPTY);
        peer.process_confirmation(msg_type, seq);

        // Still dirty: a second send pass must find work.
        assert!(peer.has_pending_data_to_send());
        let sent_again = peer.due_for_send(Instant::now(), Duration::from_millis(0));
        assert_eq!(sent_again.len(), 1);
    }

    #[test]
    fn sequence_acknowledgement_classifies_rejected_accepted_and_drained() {
        let mut window = SendWindow::default();
        let s0 = window.allocate_sequence().unwrap();
        window.on_sequence_sent(s0);
        let s1 = window.allocate_sequence().unwrap();
        window.on_sequence_sent(s1);

        assert_eq!(window.on_sequence_acknowledged(s0), AckOutcome::Accepted);
        assert_eq!(window.on_sequence_acknowledged(s0), AckOutcome::Rejected);
        assert_eq!(window.on_sequence_acknowledged(s1), AckOutcome::AcceptedLastSentSequence);
    }

    #[test]
    fn rate_limited_types_are_skipped_until_the_period_elapses() {
        let peer = PerPeerPropagatedPropertyData::default();
        let msg_type = MessageTypeIdentifier::from_slot(0, 0);
        let obj = BoundObjectIdentifier::from_slot(0, 0);

        peer.invalidate(msg_type, obj, PropertyMask::EMPTY);
        let now = Instant::now();
        let first = peer.due_for_send(now, Duration::from_secs(1));
        assert_eq!(first.len(), 1);

        peer.invalidate(msg_type, obj, PropertyMask::EMPTY);
        let too_soon = peer.due_for_send(now, Duration::from_secs(1));
        assert!(too_soon.is_empty());
    }
}
