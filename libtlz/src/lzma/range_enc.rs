//! Range encoder: the arithmetic-coding mirror of the range decoder.

use std::io::Write;

use super::{
    BitModel, LenModel, BIT_MODEL_TOTAL_BITS, LEN_LOW_SYMBOLS, LEN_MID_SYMBOLS, MIN_MATCH_LEN,
};
use crate::Result;

/// Carries `low`/`range` and the carry-propagation cache. The first byte
/// it emits is always zero (the initial cache), as the format requires.
pub(crate) struct RangeEncoder<W> {
    low: u64,
    partial_member_pos: u64,
    range: u32,
    ff_count: u64,
    cache: u8,
    pending: Vec<u8>,
    out: W,
}

impl<W: Write> RangeEncoder<W> {
    pub fn new(out: W) -> RangeEncoder<W> {
        RangeEncoder {
            low: 0,
            partial_member_pos: 0,
            range: 0xFFFF_FFFF,
            ff_count: 0,
            cache: 0,
            pending: Vec::with_capacity(65536),
            out,
        }
    }

    /// Bytes of the member emitted so far, including buffered ones.
    pub fn member_position(&self) -> u64 {
        self.partial_member_pos + self.pending.len() as u64 + self.ff_count
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    #[inline]
    fn put_byte(&mut self, b: u8) {
        self.pending.push(b);
    }

    /// Write raw bytes (header, trailer) through the same position
    /// accounting.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Drain buffered bytes to the sink.
    pub fn drain(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.out.write_all(&self.pending)?;
            self.partial_member_pos += self.pending.len() as u64;
            self.pending.clear();
        }
        Ok(())
    }

    #[inline]
    fn shift_low(&mut self) {
        let carry = self.low > 0xFFFF_FFFF;
        if carry || self.low < 0xFF00_0000 {
            let c = u8::from(carry);
            self.put_byte(self.cache.wrapping_add(c));
            while self.ff_count > 0 {
                self.ff_count -= 1;
                self.put_byte(0xFFu8.wrapping_add(c));
            }
            self.cache = (self.low >> 24) as u8;
        } else {
            self.ff_count += 1;
        }
        self.low = (self.low & 0x00FF_FFFF) << 8;
    }

    /// Encode `num_bits` equiprobable bits, most significant first.
    pub fn encode(&mut self, symbol: u32, num_bits: u32) {
        for i in (0..num_bits).rev() {
            self.range >>= 1;
            if (symbol >> i) & 1 != 0 {
                self.low += u64::from(self.range);
            }
            if self.range <= 0x00FF_FFFF {
                self.range <<= 8;
                self.shift_low();
            }
        }
    }

    #[inline]
    pub fn encode_bit(&mut self, bm: &mut BitModel, bit: u32) {
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * u32::from(bm.probability);
        if bit == 0 {
            self.range = bound;
            bm.update_0();
        } else {
            self.low += u64::from(bound);
            self.range -= bound;
            bm.update_1();
        }
        if self.range <= 0x00FF_FFFF {
            self.range <<= 8;
            self.shift_low();
        }
    }

    /// Encode `num_bits` of `symbol` through a binary tree of bit models,
    /// most significant bit first.
    pub fn encode_tree(&mut self, bm: &mut [BitModel], symbol: u32, num_bits: u32) {
        let mut model = 1usize;
        for i in (0..num_bits).rev() {
            let bit = (symbol >> i) & 1;
            self.encode_bit(&mut bm[model], bit);
            model = (model << 1) | bit as usize;
        }
    }

    /// Reversed-tree variant: least significant bit first.
    pub fn encode_tree_reversed(&mut self, bm: &mut [BitModel], mut symbol: u32, num_bits: u32) {
        let mut model = 1usize;
        for _ in 0..num_bits {
            let bit = symbol & 1;
            symbol >>= 1;
            self.encode_bit(&mut bm[model], bit);
            model = (model << 1) | bit as usize;
        }
    }

    /// Literal encode keyed on the byte at distance `rep0`.
    pub fn encode_matched(&mut self, bm: &mut [BitModel; 0x300], symbol: u32, mut match_byte: u32) {
        let mut model: u32 = 1;
        let mut sym = symbol | 0x100;
        loop {
            match_byte <<= 1;
            let match_bit = match_byte & 0x100;
            sym <<= 1;
            let bit = (sym >> 8) & 1;
            self.encode_bit(&mut bm[(0x100 + match_bit + model) as usize], bit);
            model = (model << 1) | bit;
            if match_bit != (sym & 0x100) {
                // diverged: finish with the plain tree
                while model < 0x100 {
                    sym <<= 1;
                    let bit = (sym >> 8) & 1;
                    self.encode_bit(&mut bm[model as usize], bit);
                    model = (model << 1) | bit;
                }
                break;
            }
            if model >= 0x100 {
                break;
            }
        }
    }

    /// Encode a match length in `[2, 273]`.
    pub fn encode_len(&mut self, lm: &mut LenModel, len: usize, pos_state: usize) {
        let mut l = len - MIN_MATCH_LEN;
        if l < LEN_LOW_SYMBOLS {
            self.encode_bit(&mut lm.choice1, 0);
            self.encode_tree(&mut lm.bm_low[pos_state], l as u32, 3);
            return;
        }
        self.encode_bit(&mut lm.choice1, 1);
        l -= LEN_LOW_SYMBOLS;
        if l < LEN_MID_SYMBOLS {
            self.encode_bit(&mut lm.choice2, 0);
            self.encode_tree(&mut lm.bm_mid[pos_state], l as u32, 3);
            return;
        }
        self.encode_bit(&mut lm.choice2, 1);
        l -= LEN_MID_SYMBOLS;
        self.encode_tree(&mut lm.bm_high, l as u32, 8);
    }

    /// Flush the last five bytes of `low`.
    pub fn flush(&mut self) {
        for _ in 0..5 {
            self.shift_low();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma::RangeDecoder;

    #[test]
    fn bit_round_trip() {
        let mut buf = Vec::new();
        let bits = [1u32, 0, 0, 1, 1, 1, 0, 1, 0, 0, 0, 1, 1, 0, 1, 0];
        {
            let mut enc = RangeEncoder::new(&mut buf);
            let mut bm = BitModel::default();
            for &b in &bits {
                enc.encode_bit(&mut bm, b);
            }
            enc.encode(0x2A, 6);
            enc.flush();
            enc.drain().unwrap();
        }
        assert_eq!(buf[0], 0);
        let mut dec = RangeDecoder::new(&buf[..]);
        dec.load(false).unwrap();
        let mut bm = BitModel::default();
        for &b in &bits {
            assert_eq!(dec.decode_bit(&mut bm), b);
        }
        assert_eq!(dec.decode(6), 0x2A);
    }

    #[test]
    fn tree_round_trip() {
        let mut buf = Vec::new();
        {
            let mut enc = RangeEncoder::new(&mut buf);
            let mut bm = [BitModel::default(); 64];
            let mut bm_rev = [BitModel::default(); 16];
            for sym in [0u32, 5, 63, 32, 17] {
                enc.encode_tree(&mut bm, sym, 6);
            }
            for sym in [0u32, 15, 9, 6] {
                enc.encode_tree_reversed(&mut bm_rev, sym, 4);
            }
            enc.flush();
            enc.drain().unwrap();
        }
        let mut dec = RangeDecoder::new(&buf[..]);
        dec.load(false).unwrap();
        let mut bm = [BitModel::default(); 64];
        let mut bm_rev = [BitModel::default(); 16];
        for sym in [0u32, 5, 63, 32, 17] {
            assert_eq!(dec.decode_tree6(&mut bm), sym);
        }
        for sym in [0u32, 15, 9, 6] {
            assert_eq!(dec.decode_tree_reversed(&mut bm_rev, 4), sym);
        }
    }

    #[test]
    fn len_round_trip() {
        let mut buf = Vec::new();
        let lens = [2usize, 3, 9, 10, 17, 18, 100, 273];
        {
            let mut enc = RangeEncoder::new(&mut buf);
            let mut lm = LenModel::default();
            for &l in &lens {
                enc.encode_len(&mut lm, l, 1);
            }
            enc.flush();
            enc.drain().unwrap();
        }
        let mut dec = RangeDecoder::new(&buf[..]);
        dec.load(false).unwrap();
        let mut lm = LenModel::default();
        for &l in &lens {
            assert_eq!(dec.decode_len(&mut lm, 1), l);
        }
    }

    #[test]
    fn matched_round_trip() {
        let mut buf = Vec::new();
        let pairs = [(0x41u32, 0x41u32), (0x41, 0x43), (0xFF, 0x00), (0x00, 0xFF)];
        {
            let mut enc = RangeEncoder::new(&mut buf);
            let mut bm = [BitModel::default(); 0x300];
            for &(sym, mb) in &pairs {
                enc.encode_matched(&mut bm, sym, mb);
            }
            enc.flush();
            enc.drain().unwrap();
        }
        let mut dec = RangeDecoder::new(&buf[..]);
        dec.load(false).unwrap();
        let mut bm = [BitModel::default(); 0x300];
        for &(sym, mb) in &pairs {
            assert_eq!(dec.decode_matched(&mut bm, mb), sym);
        }
    }
}
