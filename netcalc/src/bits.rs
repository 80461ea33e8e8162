//! Bit-level cursor types used by the datagram codec.
//!
//! Fields are written most-significant bit first with no padding between
//! them.  [`BitWriter::finish`] zero-pads the final partial byte.

/// Appends fixed-width fields to a growing byte buffer.
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            bit_len: 0,
        }
    }

    /// Append the low `width` bits of `value`, MSB first.
    ///
    /// Bits of `value` above `width` are ignored.
    pub fn write_bits(&mut self, value: u64, width: u32) {
        debug_assert!(width <= 64);
        for i in (0..width).rev() {
            let bit = (value >> i) & 1 == 1;
            self.push_bit(bit);
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.push_bit(value);
    }

    /// IEEE 754 binary64, big-endian.
    pub fn write_f64(&mut self, value: f64) {
        self.write_bits(value.to_bits(), 64);
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Consume the writer, returning the bytes with the last byte zero-padded.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn push_bit(&mut self, bit: bool) {
        let offset = self.bit_len % 8;
        if offset == 0 {
            self.buf.push(0);
        }
        if bit {
            let last = self.buf.len() - 1;
            self.buf[last] |= 0x80 >> offset;
        }
        self.bit_len += 1;
    }
}

/// Reads fixed-width fields from a byte slice.
///
/// Every read returns `None` once the slice runs out, leaving the cursor
/// where it was.
#[derive(Debug)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.buf.len() * 8 - self.pos
    }

    /// Bytes touched so far, counting a partially read byte as consumed.
    pub fn consumed_bytes(&self) -> usize {
        self.pos.div_ceil(8)
    }

    pub fn read_bits(&mut self, width: u32) -> Option<u64> {
        debug_assert!(width <= 64);
        if self.remaining_bits() < width as usize {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..width {
            let byte = self.buf[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        Some(value)
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.read_bits(64).map(f64::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_packed_msb_first_without_padding() {
        let mut w = BitWriter::default();
        w.write_bits(0b01, 2);
        w.write_bits(0b010, 3);
        w.write_bits(0xABCD, 16);
        assert_eq!(w.bit_len(), 21);
        // 01 010 1010101111001101 000 (pad)
        assert_eq!(w.finish(), vec![0b0101_0101, 0b0101_1110, 0b0110_1000]);
    }

    #[test]
    fn finish_pads_last_byte_with_zeros() {
        let mut w = BitWriter::default();
        w.write_bool(true);
        assert_eq!(w.finish(), vec![0x80]);
    }

    #[test]
    fn reader_returns_written_values() {
        let mut w = BitWriter::with_capacity(16);
        w.write_bits(3, 2);
        w.write_f64(-1.5);
        w.write_bits(0xDEAD_BEEF, 32);
        w.write_bool(true);
        let bytes = w.finish();

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(2), Some(3));
        assert_eq!(r.read_f64(), Some(-1.5));
        assert_eq!(r.read_bits(32), Some(0xDEAD_BEEF));
        assert_eq!(r.read_bool(), Some(true));
        assert_eq!(r.consumed_bytes(), bytes.len());
    }

    #[test]
    fn read_past_end_returns_none_and_keeps_position() {
        let bytes = [0xFF];
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(5), Some(0b11111));
        assert_eq!(r.read_bits(4), None);
        assert_eq!(r.remaining_bits(), 3);
        assert_eq!(r.read_bits(3), Some(0b111));
    }

    #[test]
    fn consumed_bytes_rounds_up() {
        let bytes = [0u8; 4];
        let mut r = BitReader::new(&bytes);
        r.read_bits(9);
        assert_eq!(r.consumed_bytes(), 2);
    }
}
