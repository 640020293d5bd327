//! Property masks: which of a propagated-property message's fields are
//! dirty for a given peer.
//!
//! A property's local index (0-based) inside its message type is its bit
//! position in a [`PropertyMask`]. A stream message carrying 5 properties
//! needs a 5-bit mask; [`PropertyMask::bits_for_count`] is how a registrant
//! turns its property count into that wire width once, at registration
//! time, rather than recomputing it every tick.

use crate::bitview::{BitReader, BitWriter};
use crate::identifiers::PropertyIndex;
use crate::Error;

/// Up to 64 properties' worth of dirty bits for one bound object's one
/// property-stream message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropertyMask(u64);

impl PropertyMask {
    pub const EMPTY: Self = Self(0);

    /// Wire width, in bits, of a mask covering `count` properties (0..=64).
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_codec::property::PropertyMask;
    ///
    /// assert_eq!(PropertyMask::bits_for_count(5), 5);
    /// assert_eq!(PropertyMask::bits_for_count(0), 0);
    /// ```
    pub fn bits_for_count(count: u8) -> u32 {
        count as u32
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn set(&mut self, index: PropertyIndex) {
        self.0 |= 1 << index.as_bit();
    }

    pub fn clear(&mut self, index: PropertyIndex) {
        self.0 &= !(1 << index.as_bit());
    }

    pub fn is_set(&self, index: PropertyIndex) -> bool {
        (self.0 >> index.as_bit()) & 1 != 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn iter_set(&self, count: u8) -> impl Iterator<Item = PropertyIndex> + '_ {
        (0..count).filter_map(move |i| self.is_set(PropertyIndex(i)).then_some(PropertyIndex(i)))
    }

    /// Packs the low `count` bits of the mask.
    ///
    /// # Test
    ///
    /// ```
    /// use netcode_codec::bitview::{BitReader, BitWriter};
    /// use netcode_codec::identifiers::PropertyIndex;
    /// use netcode_codec::property::PropertyMask;
    ///
    /// let mut mask = PropertyMask::EMPTY;
    /// mask.set(PropertyIndex(0));
    /// mask.set(PropertyIndex(3));
    ///
    /// let mut buf = [0u8; 1];
    /// mask.pack(&mut BitWriter::new(&mut buf), 5).unwrap();
    ///
    /// let back = PropertyMask::unpack(&mut BitReader::new(&buf), 5).unwrap();
    /// assert_eq!(back, mask);
    /// ```
    pub fn pack(&self, w: &mut BitWriter, count: u8) -> Result<(), Error> {
        w.write_bits(self.0, PropertyMask::bits_for_count(count))
    }

    pub fn unpack(r: &mut BitReader, count: u8) -> Result<Self, Error> {
        Ok(Self(r.read_bits(PropertyMask::bits_for_count(count))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_and_clearing_a_bit_round_trips() {
        let mut mask = PropertyMask::EMPTY;
        let idx = PropertyIndex(2);
        assert!(!mask.is_set(idx));

        mask.set(idx);
        assert!(mask.is_set(idx));

        mask.clear(idx);
        assert!(!mask.is_set(idx));
    }

    #[test]
    fn iter_set_yields_only_dirty_indices_within_count() {
        let mut mask = PropertyMask::EMPTY;
        mask.set(PropertyIndex(1));
        mask.set(PropertyIndex(4));

        let set: Vec<_> = mask.iter_set(5).map(|p| p.0).collect();
        assert_eq!(set, vec![1, 4]);
    }

    #[test]
    fn union_combines_dirty_bits_from_both_masks() {
        let mut a = PropertyMask::EMPTY;
        a.set(PropertyIndex(0));
        let mut b = PropertyMask::EMPTY;
        b.set(PropertyIndex(1));

        let u = a.union(b);
        assert!(u.is_set(PropertyIndex(0)));
        assert!(u.is_set(PropertyIndex(1)));
    }
}
