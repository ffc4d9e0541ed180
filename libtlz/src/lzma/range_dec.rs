//! Range decoder: bit-level input over a buffered byte stream.

use std::io::Read;

use super::{
    BitModel, LenModel, BIT_MODEL_TOTAL_BITS, LEN_LOW_SYMBOLS, LEN_MID_SYMBOLS, MIN_MATCH_LEN,
};
use crate::io::read_exact_or_eof;
use crate::{Error, Result};

const BUFFER_SIZE: usize = 16384;

/// Carries the 32-bit `range`/`code` pair of the arithmetic coder and a
/// buffered view of the compressed stream.
///
/// Once the backing stream is exhausted, byte reads return `0xFF` so that
/// a member truncated inside the End-Of-Stream marker decodes up to the
/// truncation point instead of failing spuriously. An I/O error from the
/// backing stream is latched and surfaced by [`RangeDecoder::take_io_error`].
pub struct RangeDecoder<R> {
    partial_member_pos: u64,
    buffer: Vec<u8>,
    pos: usize,
    stream_pos: usize,
    code: u32,
    range: u32,
    reader: R,
    at_stream_end: bool,
    io_error: Option<std::io::Error>,
}

impl<R: Read> RangeDecoder<R> {
    pub fn new(reader: R) -> RangeDecoder<R> {
        RangeDecoder {
            partial_member_pos: 0,
            buffer: vec![0; BUFFER_SIZE],
            pos: 0,
            stream_pos: 0,
            code: 0,
            range: 0xFFFF_FFFF,
            reader,
            at_stream_end: false,
            io_error: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_block(&mut self) -> bool {
        if !self.at_stream_end {
            self.partial_member_pos += self.pos as u64;
            self.pos = 0;
            match read_exact_or_eof(&mut self.reader, &mut self.buffer) {
                Ok(n) => {
                    self.stream_pos = n;
                    self.at_stream_end = n < BUFFER_SIZE;
                }
                Err(e) => {
                    self.stream_pos = 0;
                    self.at_stream_end = true;
                    self.io_error = Some(e);
                }
            }
        }
        self.pos < self.stream_pos
    }

    /// Latched I/O error of the backing stream, if any.
    pub fn take_io_error(&mut self) -> Option<std::io::Error> {
        self.io_error.take()
    }

    #[inline]
    pub fn finished(&mut self) -> bool {
        self.pos >= self.stream_pos && !self.read_block()
    }

    /// Bytes of the member consumed so far.
    pub fn member_position(&self) -> u64 {
        self.partial_member_pos.wrapping_add(self.pos as u64)
    }

    /// Make the current position the start of a new member.
    pub fn reset_member_position(&mut self) {
        self.partial_member_pos = 0u64.wrapping_sub(self.pos as u64);
    }

    #[inline]
    pub fn get_byte(&mut self) -> u8 {
        // 0xFF avoids a decoder error if the member is truncated at the
        // EOS marker.
        if self.finished() {
            return 0xFF;
        }
        let b = self.buffer[self.pos];
        self.pos += 1;
        b
    }

    /// Copy raw (non range-coded) bytes out of the stream.
    pub fn read_data(&mut self, outbuf: &mut [u8]) -> usize {
        let mut sz = 0;
        while sz < outbuf.len() && !self.finished() {
            let rd = (outbuf.len() - sz).min(self.stream_pos - self.pos);
            outbuf[sz..sz + rd].copy_from_slice(&self.buffer[self.pos..self.pos + rd]);
            self.pos += rd;
            sz += rd;
        }
        sz
    }

    /// Prime `code` from the first five bytes of the LZMA stream. The
    /// first byte must be zero.
    pub fn load(&mut self, ignore_nonzero: bool) -> Result<()> {
        self.code = 0;
        self.range = 0xFFFF_FFFF;
        if self.get_byte() != 0 && !ignore_nonzero {
            return Err(Error::NonzeroFirstByte);
        }
        for _ in 0..4 {
            self.code = (self.code << 8) | u32::from(self.get_byte());
        }
        Ok(())
    }

    /// Final value of `code`; nonzero after a clean EOS means corruption
    /// in the last bytes of the marker.
    pub fn code(&self) -> u32 {
        self.code
    }

    #[inline(always)]
    pub fn normalize(&mut self) {
        if self.range <= 0x00FF_FFFF {
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(self.get_byte());
        }
    }

    /// Decode `num_bits` equiprobable bits.
    pub fn decode(&mut self, num_bits: u32) -> u32 {
        let mut symbol = 0;
        for _ in 0..num_bits {
            self.normalize();
            self.range >>= 1;
            let bit = u32::from(self.code >= self.range);
            symbol = (symbol << 1) + bit;
            self.code -= self.range & bit.wrapping_neg();
        }
        symbol
    }

    #[inline(always)]
    pub fn decode_bit(&mut self, bm: &mut BitModel) -> u32 {
        self.normalize();
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * u32::from(bm.probability);
        if self.code < bound {
            self.range = bound;
            bm.update_0();
            0
        } else {
            self.code -= bound;
            self.range -= bound;
            bm.update_1();
            1
        }
    }

    pub fn decode_tree6(&mut self, bm: &mut [BitModel; 64]) -> u32 {
        let mut symbol = 1;
        for _ in 0..6 {
            let bit = self.decode_bit(&mut bm[symbol as usize]);
            symbol = (symbol << 1) | bit;
        }
        symbol & 0x3F
    }

    pub fn decode_tree8(&mut self, bm: &mut [BitModel]) -> u32 {
        let mut symbol = 1;
        for _ in 0..8 {
            let bit = self.decode_bit(&mut bm[symbol as usize]);
            symbol = (symbol << 1) | bit;
        }
        symbol & 0xFF
    }

    /// Walk the tree with the model index in one bit order while building
    /// the output symbol in the opposite order.
    pub fn decode_tree_reversed(&mut self, bm: &mut [BitModel], num_bits: usize) -> u32 {
        let mut model = 1usize;
        let mut symbol = 0;
        for i in 0..num_bits {
            let bit = self.decode_bit(&mut bm[model]);
            model = (model << 1) | bit as usize;
            symbol |= bit << i;
        }
        symbol
    }

    pub fn decode_tree_reversed4(&mut self, bm: &mut [BitModel; 16]) -> u32 {
        self.decode_tree_reversed(bm, 4)
    }

    /// Literal decode keyed on the byte at distance `rep0`: while the
    /// decoded bits agree with the match byte, select from the second
    /// 256-entry table half; on divergence fall back to the plain tree.
    pub fn decode_matched(&mut self, bm: &mut [BitModel; 0x300], mut match_byte: u32) -> u32 {
        let mut symbol: u32 = 1;
        while symbol < 0x100 {
            match_byte <<= 1;
            let match_bit = match_byte & 0x100;
            let bit = self.decode_bit(&mut bm[(0x100 + match_bit + symbol) as usize]);
            symbol = (symbol << 1) | bit;
            if match_bit >> 8 != bit {
                while symbol < 0x100 {
                    let bit = self.decode_bit(&mut bm[symbol as usize]);
                    symbol = (symbol << 1) | bit;
                }
                break;
            }
        }
        symbol & 0xFF
    }

    /// Decode a match length in `[2, 273]`.
    pub fn decode_len(&mut self, lm: &mut LenModel, pos_state: usize) -> usize {
        if self.decode_bit(&mut lm.choice1) == 0 {
            let mut symbol = 1;
            for _ in 0..3 {
                let bit = self.decode_bit(&mut lm.bm_low[pos_state][symbol as usize]);
                symbol = (symbol << 1) | bit as usize;
            }
            return (symbol & 7) + MIN_MATCH_LEN;
        }
        if self.decode_bit(&mut lm.choice2) == 0 {
            let mut symbol = 1;
            for _ in 0..3 {
                let bit = self.decode_bit(&mut lm.bm_mid[pos_state][symbol as usize]);
                symbol = (symbol << 1) | bit as usize;
            }
            return (symbol & 7) + MIN_MATCH_LEN + LEN_LOW_SYMBOLS;
        }
        let mut symbol = 1;
        for _ in 0..8 {
            let bit = self.decode_bit(&mut lm.bm_high[symbol as usize]);
            symbol = (symbol << 1) | bit as usize;
        }
        (symbol & 0xFF) + MIN_MATCH_LEN + LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_stream_pads_with_ff() {
        let data: &[u8] = &[0x00, 0x12, 0x34];
        let mut rdec = RangeDecoder::new(data);
        assert_eq!(rdec.get_byte(), 0x00);
        assert_eq!(rdec.get_byte(), 0x12);
        assert_eq!(rdec.get_byte(), 0x34);
        assert_eq!(rdec.get_byte(), 0xFF);
        assert_eq!(rdec.get_byte(), 0xFF);
        // member position does not advance past the real data
        assert_eq!(rdec.member_position(), 3);
    }

    #[test]
    fn load_rejects_nonzero_first_byte() {
        let data: &[u8] = &[0x01, 0, 0, 0, 0];
        let mut rdec = RangeDecoder::new(data);
        assert!(matches!(
            rdec.load(false),
            Err(crate::Error::NonzeroFirstByte)
        ));
        let data: &[u8] = &[0x00, 0xAA, 0xBB, 0xCC, 0xDD];
        let mut rdec = RangeDecoder::new(data);
        rdec.load(false).unwrap();
        assert_eq!(rdec.code(), 0xAABBCCDD);
        assert_eq!(rdec.member_position(), 5);
    }

    #[test]
    fn reset_member_position_rebases() {
        let data: &[u8] = &[1, 2, 3, 4, 5, 6];
        let mut rdec = RangeDecoder::new(data);
        rdec.get_byte();
        rdec.get_byte();
        rdec.reset_member_position();
        assert_eq!(rdec.member_position(), 0);
        rdec.get_byte();
        assert_eq!(rdec.member_position(), 1);
    }
}
