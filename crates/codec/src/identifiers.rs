//! Salted, generationally versioned identifiers.
//!
//! Every identifier the core hands out packs a 1-based slot index (0 means
//! invalid) together with a generation, so a stale handle to a reused slot
//! fails a liveness check instead of silently resolving to the wrong object.
//! Only the index crosses the wire; the generation is a local safety net on
//! whichever side allocated the slot and is never serialized (see
//! `DESIGN.md`).

use std::fmt;
use std::marker::PhantomData;

use crate::bitview::{BitReader, BitWriter};
use crate::Error;

/// Per-kind fixed compressed wire width, in bits, of the slot index.
pub trait IdentifierKind {
    const BITS: u32;
    const NAME: &'static str;
}

pub struct ClientKind;
impl IdentifierKind for ClientKind {
    const BITS: u32 = 10;
    const NAME: &'static str = "ClientIdentifier";
}

pub struct BoundObjectKind;
impl IdentifierKind for BoundObjectKind {
    const BITS: u32 = 20;
    const NAME: &'static str = "BoundObjectIdentifier";
}

pub struct MessageTypeKind;
impl IdentifierKind for MessageTypeKind {
    const BITS: u32 = 12;
    const NAME: &'static str = "MessageTypeIdentifier";
}

/// A salted, generationally versioned index. `index()` is 1-based; 0 (the
/// `Default` value) is the universal invalid identifier.
pub struct Identifier<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<K>,
}

impl<K> Clone for Identifier<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Identifier<K> {}

impl<K> PartialEq for Identifier<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Identifier<K> {}

impl<K> std::hash::Hash for Identifier<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<K> Default for Identifier<K> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<K: IdentifierKind> fmt::Debug for Identifier<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}({}#{})", K::NAME, self.index, self.generation)
        } else {
            write!(f, "{}(invalid)", K::NAME)
        }
    }
}

impl<K> Identifier<K> {
    pub const INVALID: Self = Self {
        index: 0,
        generation: 0,
        _kind: PhantomData,
    };

    /// Builds the identifier for 0-based slot `slot` at the given generation.
    pub fn from_slot(slot: usize, generation: u32) -> Self {
        Self {
            index: slot as u32 + 1,
            generation,
            _kind: PhantomData,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.index != 0
    }

    /// The 0-based slot this identifier names, if valid.
    pub fn slot(&self) -> Option<usize> {
        self.is_valid().then(|| (self.index - 1) as usize)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<K: IdentifierKind> Identifier<K> {
    /// Fixed compressed size in bits of the wire-transmitted index.
    pub const BITS: u32 = K::BITS;

    /// Packs only the index; the generation never crosses the wire.
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_codec::bitview::{BitReader, BitWriter};
    /// use netcode_codec::identifiers::{ClientIdentifier};
    ///
    /// let id = ClientIdentifier::from_slot(0, 7);
    ///
    /// let mut buf = [0u8; 2];
    /// let mut w = BitWriter::new(&mut buf);
    /// id.pack(&mut w).unwrap();
    ///
    /// let mut r = BitReader::new(&buf);
    /// let back = ClientIdentifier::unpack(&mut r, 3).unwrap();
    /// assert_eq!(back.slot(), Some(0));
    /// assert_eq!(back.generation(), 3);
    /// ```
    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        w.write_bits(self.index as u64, Self::BITS)
    }

    /// Unpacks the index from the wire and pairs it with a generation the
    /// caller already knows locally (looked up from its own registry).
    pub fn unpack(r: &mut BitReader, generation: u32) -> Result<Self, Error> {
        let index = r.read_bits(Self::BITS)? as u32;

        Ok(Self {
            index,
            generation,
            _kind: PhantomData,
        })
    }
}

pub type ClientIdentifier = Identifier<ClientKind>;
pub type BoundObjectIdentifier = Identifier<BoundObjectKind>;
pub type MessageTypeIdentifier = Identifier<MessageTypeKind>;

/// A property's 0-based local index inside one property-stream message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyIndex(pub u8);

impl PropertyIndex {
    pub fn as_bit(&self) -> u32 {
        self.0 as u32
    }
}

/// A 16-bit sequence number with modulo-2^16 "newer than" ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceNumber(pub u16);

impl SequenceNumber {
    pub const ZERO: Self = Self(0);

    pub fn wrapping_next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// `self` is newer than `other` iff `(self - other) mod 2^16 < 2^15`.
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_codec::identifiers::SequenceNumber;
    ///
    /// assert!(SequenceNumber(1).is_newer_than(SequenceNumber(0)));
    /// assert!(SequenceNumber(0).is_newer_than(SequenceNumber(0xFFFF)));
    /// assert!(!SequenceNumber(0xFFFF).is_newer_than(SequenceNumber(0)));
    /// ```
    pub fn is_newer_than(self, other: Self) -> bool {
        let delta = self.0.wrapping_sub(other.0);
        delta != 0 && delta < 0x8000
    }

    pub fn pack(&self, w: &mut BitWriter) -> Result<(), Error> {
        w.write_bits(self.0 as u64, 16)
    }

    pub fn unpack(r: &mut BitReader) -> Result<Self, Error> {
        Ok(Self(r.read_bits(16)? as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_identifier_is_the_zero_value() {
        let id = ClientIdentifier::default();
        assert!(!id.is_valid());
        assert_eq!(id.slot(), None);
    }

    #[test]
    fn first_valid_slot_is_one() {
        let id = ClientIdentifier::from_slot(0, 1);
        assert!(id.is_valid());
        assert_eq!(id.slot(), Some(0));
    }

    #[test]
    fn sequence_wraps_correctly_across_the_0xffff_boundary() {
        assert!(SequenceNumber(0).is_newer_than(SequenceNumber(0xFFFF)));
        assert!(!SequenceNumber(0xFFFF).is_newer_than(SequenceNumber(0)));
    }

}
