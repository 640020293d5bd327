//! Argument and property type descriptors.
//!
//! Every function argument and every propagated property is, on the wire,
//! a value that knows how to compress/decompress itself under a given
//! [`MessageFlags`](crate::message_type::MessageFlags) projection — the same
//! `f32` field might be sent full-precision to a function call
//! (`SENT_WITH_NETWORKED_FUNCTIONS`) and quantized when streamed as a
//! property (`PROPAGATE_CLIENT_TO_HOST`). The [`Wire`] trait is the
//! an argument type descriptor: fixed size where known, a dynamic size
//! calculator otherwise, and a `pack`/`unpack` pair.

use crate::bitview::{BitReader, BitWriter};
use crate::message_type::MessageFlags;
use crate::Error;

/// A value that can be compressed onto / decompressed off of the wire under
/// a given flag-set projection.
///
/// `FIXED_BITS` is `Some(n)` for types whose compressed size never depends
/// on the value or the flag set (integers, bools, fixed-size identifiers).
/// Dynamically sized types (strings, byte blobs) return `None` and instead
/// implement [`Wire::dynamic_bits`] honestly.
pub trait Wire: Sized {
    const FIXED_BITS: Option<u32>;

    /// Exact bit size this value will occupy under `flags`. Types with a
    /// `FIXED_BITS` still must implement this (it just ignores `flags` and
    /// returns the constant) so that callers computing a message's total
    /// size never have to special-case dynamic vs. fixed.
    fn dynamic_bits(&self, _flags: MessageFlags) -> u32 {
        Self::FIXED_BITS.expect("dynamic_bits must be overridden for dynamically sized types")
    }

    fn pack(&self, w: &mut BitWriter, flags: MessageFlags) -> Result<(), Error>;

    fn unpack(r: &mut BitReader, flags: MessageFlags) -> Result<Self, Error>;
}

impl Wire for bool {
    const FIXED_BITS: Option<u32> = Some(1);

    fn pack(&self, w: &mut BitWriter, _flags: MessageFlags) -> Result<(), Error> {
        w.write_bool(*self)
    }

    fn unpack(r: &mut BitReader, _flags: MessageFlags) -> Result<Self, Error> {
        r.read_bool()
    }
}

macro_rules! impl_wire_int {
    ($ty:ty, $bits:expr) => {
        impl Wire for $ty {
            const FIXED_BITS: Option<u32> = Some($bits);

            fn pack(&self, w: &mut BitWriter, _flags: MessageFlags) -> Result<(), Error> {
                w.write_bits(*self as u64, $bits)
            }

            fn unpack(r: &mut BitReader, _flags: MessageFlags) -> Result<Self, Error> {
                Ok(r.read_bits($bits)? as $ty)
            }
        }
    };
}

impl_wire_int!(u8, 8);
impl_wire_int!(u16, 16);
impl_wire_int!(u32, 32);
impl_wire_int!(u64, 64);
impl_wire_int!(i8, 8);
impl_wire_int!(i16, 16);
impl_wire_int!(i32, 32);

impl Wire for i64 {
    const FIXED_BITS: Option<u32> = Some(64);

    fn pack(&self, w: &mut BitWriter, _flags: MessageFlags) -> Result<(), Error> {
        w.write_bits(*self as u64, 64)
    }

    fn unpack(r: &mut BitReader, _flags: MessageFlags) -> Result<Self, Error> {
        Ok(r.read_bits(64)? as i64)
    }
}

impl Wire for f32 {
    const FIXED_BITS: Option<u32> = Some(32);

    fn pack(&self, w: &mut BitWriter, _flags: MessageFlags) -> Result<(), Error> {
        w.write_bits(self.to_bits() as u64, 32)
    }

    fn unpack(r: &mut BitReader, _flags: MessageFlags) -> Result<Self, Error> {
        Ok(f32::from_bits(r.read_bits(32)? as u32))
    }
}

impl Wire for f64 {
    const FIXED_BITS: Option<u32> = Some(64);

    fn pack(&self, w: &mut BitWriter, _flags: MessageFlags) -> Result<(), Error> {
        w.write_bits(self.to_bits(), 64)
    }

    fn unpack(r: &mut BitReader, _flags: MessageFlags) -> Result<Self, Error> {
        Ok(f64::from_bits(r.read_bits(64)?))
    }
}

/// A three-component vector, a canonical example of a replicated property
/// type (`Math::Vector3 position`).
///
/// # Test
///
/// ```
/// use netcode_codec::argument::{Vector3, Wire};
/// use netcode_codec::bitview::{BitReader, BitWriter};
/// use netcode_codec::message_type::MessageFlags;
///
/// let v = Vector3 { x: 1.0, y: 2.0, z: 3.0 };
/// let mut buf = [0u8; 12];
/// v.pack(&mut BitWriter::new(&mut buf), MessageFlags::PROPAGATE_CLIENT_TO_HOST).unwrap();
///
/// let back = Vector3::unpack(&mut BitReader::new(&buf), MessageFlags::PROPAGATE_CLIENT_TO_HOST).unwrap();
/// assert_eq!(v, back);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Wire for Vector3 {
    const FIXED_BITS: Option<u32> = Some(96);

    fn pack(&self, w: &mut BitWriter, flags: MessageFlags) -> Result<(), Error> {
        self.x.pack(w, flags)?;
        self.y.pack(w, flags)?;
        self.z.pack(w, flags)
    }

    fn unpack(r: &mut BitReader, flags: MessageFlags) -> Result<Self, Error> {
        Ok(Self {
            x: f32::unpack(r, flags)?,
            y: f32::unpack(r, flags)?,
            z: f32::unpack(r, flags)?,
        })
    }
}

/// A dynamically sized UTF-8 string: a 16-bit length prefix followed by the
/// raw bytes, unpadded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireString(pub String);

impl Wire for WireString {
    const FIXED_BITS: Option<u32> = None;

    fn dynamic_bits(&self, _flags: MessageFlags) -> u32 {
        16 + (self.0.len() as u32) * 8
    }

    fn pack(&self, w: &mut BitWriter, _flags: MessageFlags) -> Result<(), Error> {
        let bytes = self.0.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(Error::InvalidInput);
        }

        w.write_bits(bytes.len() as u64, 16)?;
        for byte in bytes {
            w.write_bits(*byte as u64, 8)?;
        }

        Ok(())
    }

    fn unpack(r: &mut BitReader, _flags: MessageFlags) -> Result<Self, Error> {
        let len = r.read_bits(16)? as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(r.read_bits(8)? as u8);
        }

        Ok(Self(
            String::from_utf8(bytes).map_err(|e| Error::from(e.utf8_error()))?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_through_a_flag_projection() {
        let mut buf = [0u8; 4];
        42i32
            .pack(&mut BitWriter::new(&mut buf), MessageFlags::CLIENT_TO_HOST)
            .unwrap();

        let back = i32::unpack(&mut BitReader::new(&buf), MessageFlags::CLIENT_TO_HOST).unwrap();
        assert_eq!(back, 42);
    }

    #[test]
    fn strings_round_trip_with_their_length_prefix() {
        let value = WireString("hi".to_string());
        let mut buf = [0u8; 8];
        value
            .pack(&mut BitWriter::new(&mut buf), MessageFlags::default())
            .unwrap();

        let back = WireString::unpack(&mut BitReader::new(&buf), MessageFlags::default()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn under_read_dynamic_argument_is_rejected() {
        let buf = [0u8, 0xff];
        // Claims a 255-byte string in a 2-byte buffer: must fail, not panic
        // or silently truncate.
        assert!(WireString::unpack(&mut BitReader::new(&buf), MessageFlags::default()).is_err());
    }
}
