//! Owned byte storage for an encoded message, sized and zero-initialised up
//! front so the bit writer never needs to grow it mid-encode.

use crate::bitview::BitWriter;

/// A zero-initialised byte buffer sized to hold exactly `bit_count` bits.
pub struct MessageBuffer {
    bytes: Vec<u8>,
    bit_count: usize,
}

impl MessageBuffer {
    /// # Test
    ///
    /// ```
    /// use netcode_codec::buffer::MessageBuffer;
    ///
    /// let buf = MessageBuffer::with_bit_count(13);
    /// assert_eq!(buf.as_bytes().len(), 2);
    /// ```
    pub fn with_bit_count(bit_count: usize) -> Self {
        Self {
            bytes: vec![0u8; bit_count.div_ceil(8)],
            bit_count,
        }
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn writer(&mut self) -> BitWriter<'_> {
        BitWriter::new(&mut self.bytes)
    }
}

/// A [`MessageBuffer`] paired with how much of it the writer actually used,
/// ready to be handed to a transport. There is no free-callback here:
/// `Vec<u8>`'s own allocator return is the equivalent, and `into_vec` hands
/// ownership straight to whatever queues it for the transport (see
/// `netcode_peer::transport::Transport::send`) without a bespoke arena or
/// reference-counted buffer pool.
pub struct EncodedMessageBuffer {
    buffer: MessageBuffer,
    written_bits: usize,
}

impl EncodedMessageBuffer {
    pub fn new(buffer: MessageBuffer, written_bits: usize) -> Self {
        Self {
            buffer,
            written_bits,
        }
    }

    pub fn written_bits(&self) -> usize {
        self.written_bits
    }

    /// The encoded bytes, trimmed to just what was written (rounded up to a
    /// byte boundary — at most 7 unused trailing bits per the wire format).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_bytes()[..self.written_bits.div_ceil(8)]
    }

    pub fn into_vec(self) -> Vec<u8> {
        let len = self.written_bits.div_ceil(8);
        let mut bytes = self.buffer.bytes;
        bytes.truncate(len);
        bytes
    }
}
