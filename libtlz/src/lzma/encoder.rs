//! LZMA member encoder: a greedy hash-chain match finder feeding the
//! range encoder, with streaming input and bounded memory.
//!
//! The encoder trades ratio for simplicity against the optimal-parsing
//! original, but emits streams the member decoder round-trips exactly and
//! trailers inside the consistency band.

use std::io::Write;

use super::{
    get_len_state, get_lit_state, Models, RangeEncoder, State, DIS_ALIGN_BITS, END_DIS_MODEL,
    MAX_MATCH_LEN, MIN_MATCH_LEN, POS_STATE_MASK, START_DIS_MODEL,
};
use crate::header::{LzipHeader, MIN_DICTIONARY_SIZE};
use crate::io::CRC32;
use crate::trailer::LzipTrailer;
use crate::{Error, Result};

const HASH_BITS: u32 = 17;
const HASH_SIZE: usize = 1 << HASH_BITS;
const CHAIN_DEPTH: usize = 32;
/// Lookahead held back until `finish` so match searches are never
/// truncated mid-stream.
const LOOKAHEAD: usize = MAX_MATCH_LEN + 16;
/// Slack appended to the window before the buffer is renormalized.
const BUFFER_SLACK: usize = 1 << 16;

#[inline]
fn hash4(bytes: &[u8]) -> usize {
    let v = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    (v.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
}

#[inline]
fn get_slot(dis: u32) -> u32 {
    if dis < START_DIS_MODEL {
        dis
    } else {
        let bits = 31 - dis.leading_zeros();
        (bits << 1) | ((dis >> (bits - 1)) & 1)
    }
}

/// Streaming encoder for one lzip member.
///
/// The header is emitted at construction; `write` accepts data
/// incrementally; `finish` emits the End-Of-Stream marker and the
/// trailer, returning the sink.
pub struct MemberEncoder<W: Write> {
    renc: RangeEncoder<W>,
    m: Box<Models>,
    state: State,
    reps: [u32; 4],
    crc_digest: crc::Digest<'static, u32, crc::Table<16>>,
    dictionary_size: usize,
    match_len_limit: usize,
    buffer: Vec<u8>,
    chain: Vec<u32>,
    head: Vec<u32>,
    enc_pos: usize,
    partial_pos: u64,
    data_size: u64,
}

impl<W: Write> MemberEncoder<W> {
    pub fn new(dictionary_size: u32, match_len_limit: usize, out: W) -> Result<MemberEncoder<W>> {
        if !(5..=MAX_MATCH_LEN).contains(&match_len_limit) {
            return Err(Error::Invalid(format!(
                "Invalid match length limit {}",
                match_len_limit
            )));
        }
        let header = LzipHeader::new(dictionary_size)?;
        // the header byte may round the size up; use the coded value
        let dictionary_size = header.dictionary_size() as usize;
        let mut renc = RangeEncoder::new(out);
        renc.write_raw(&header.data);
        Ok(MemberEncoder {
            renc,
            m: Box::default(),
            state: State::default(),
            reps: [0; 4],
            crc_digest: CRC32.digest(),
            dictionary_size,
            match_len_limit,
            buffer: Vec::with_capacity(BUFFER_SLACK),
            chain: Vec::with_capacity(BUFFER_SLACK),
            head: vec![0; HASH_SIZE],
            enc_pos: 0,
            partial_pos: 0,
            data_size: 0,
        })
    }

    /// Total bytes accepted so far.
    pub fn data_position(&self) -> u64 {
        self.data_size
    }

    /// Bytes of the member emitted so far.
    pub fn member_position(&self) -> u64 {
        self.renc.member_position()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.crc_digest.update(data);
        self.data_size += data.len() as u64;
        self.buffer.extend_from_slice(data);
        self.chain.resize(self.buffer.len(), 0);
        self.encode_pending(false)?;
        self.renc.drain()
    }

    /// Emit the EOS marker and the trailer; return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.encode_pending(true)?;
        let pos_state = (self.abs_pos() & POS_STATE_MASK) as usize;
        let state = self.state.get();
        self.renc.encode_bit(&mut self.m.bm_match[state][pos_state], 1);
        self.renc.encode_bit(&mut self.m.bm_rep[state], 0);
        self.encode_pair(0xFFFF_FFFF, MIN_MATCH_LEN, pos_state);
        self.renc.flush();
        let digest = std::mem::replace(&mut self.crc_digest, CRC32.digest());
        let trailer = LzipTrailer::new(
            digest.finalize(),
            self.data_size,
            self.member_position() + LzipTrailer::SIZE as u64,
        );
        self.renc.write_raw(&trailer.data);
        self.renc.drain()?;
        Ok(self.renc.into_inner())
    }

    #[inline]
    fn abs_pos(&self) -> u64 {
        self.partial_pos + self.enc_pos as u64
    }

    /// Drop window bytes no longer reachable once the buffer outgrows the
    /// dictionary plus slack.
    fn normalize(&mut self) {
        if self.enc_pos <= self.dictionary_size
            || self.buffer.len() < self.dictionary_size + BUFFER_SLACK
        {
            return;
        }
        let offset = self.enc_pos - self.dictionary_size;
        self.buffer.drain(..offset);
        self.chain.drain(..offset);
        let offset32 = offset as u32;
        for e in self.head.iter_mut() {
            *e = e.saturating_sub(offset32);
        }
        for e in self.chain.iter_mut() {
            *e = e.saturating_sub(offset32);
        }
        self.partial_pos += offset as u64;
        self.enc_pos -= offset;
    }

    #[inline]
    fn insert_hash(&mut self, pos: usize) {
        if pos + 4 <= self.buffer.len() {
            let h = hash4(&self.buffer[pos..]);
            self.chain[pos] = self.head[h];
            self.head[h] = pos as u32 + 1;
        }
    }

    fn match_len(&self, from: usize, at: usize, limit: usize) -> usize {
        let a = &self.buffer[from..];
        let b = &self.buffer[at..];
        let limit = limit.min(b.len());
        let mut len = 0;
        while len < limit && a[len] == b[len] {
            len += 1;
        }
        len
    }

    /// Longest rep match at the current position: `(rep_index, length)`.
    fn best_rep_match(&self, len_limit: usize) -> (usize, usize) {
        let mut best = (0, 0);
        for (i, &r) in self.reps.iter().enumerate() {
            let r = r as usize;
            if (r as u64) >= self.abs_pos() || r + 1 > self.enc_pos {
                continue;
            }
            let len = self.match_len(self.enc_pos - r - 1, self.enc_pos, len_limit);
            if len > best.1 {
                best = (i, len);
            }
        }
        best
    }

    /// Longest hash-chain match: `(distance, length)`.
    fn best_match(&self, len_limit: usize) -> (u32, usize) {
        if self.enc_pos + 4 > self.buffer.len() {
            return (0, 0);
        }
        let mut best = (0u32, 0usize);
        let mut cand = self.head[hash4(&self.buffer[self.enc_pos..])];
        let mut depth = CHAIN_DEPTH;
        while cand > 0 && depth > 0 {
            let j = (cand - 1) as usize;
            let distance = self.enc_pos - j - 1;
            if distance >= self.dictionary_size {
                break;
            }
            let len = self.match_len(j, self.enc_pos, len_limit);
            if len > best.1 {
                best = (distance as u32, len);
                if len >= self.match_len_limit {
                    break;
                }
            }
            cand = self.chain[j];
            depth -= 1;
        }
        best
    }

    fn encode_pending(&mut self, finishing: bool) -> Result<()> {
        loop {
            let avail = self.buffer.len() - self.enc_pos;
            if avail == 0 || (!finishing && avail < LOOKAHEAD) {
                return Ok(());
            }
            let len_limit = MAX_MATCH_LEN.min(avail);
            let (rep_index, rep_len) = self.best_rep_match(len_limit);
            let (dis, mut main_len) = self.best_match(len_limit);
            // a new distance must pay for its slot bits
            if main_len == 3 && dis >= 1 << 16 {
                main_len = 0;
            }
            if main_len < 4 && main_len != 3 {
                main_len = 0;
            }

            let token_len;
            if rep_len >= MIN_MATCH_LEN && rep_len + 1 >= main_len {
                self.encode_rep(rep_index, rep_len)?;
                token_len = rep_len;
            } else if main_len >= 3 {
                self.encode_match(dis, main_len)?;
                token_len = main_len;
            } else if rep_len == 1 && rep_index == 0 {
                self.encode_short_rep()?;
                token_len = 1;
            } else {
                self.encode_literal()?;
                token_len = 1;
            }
            for i in 0..token_len {
                self.insert_hash(self.enc_pos + i);
            }
            self.enc_pos += token_len;
            self.normalize();
        }
    }

    fn encode_literal(&mut self) -> Result<()> {
        let pos_state = (self.abs_pos() & POS_STATE_MASK) as usize;
        let state = self.state.get();
        self.renc.encode_bit(&mut self.m.bm_match[state][pos_state], 0);
        let prev_byte = if self.enc_pos > 0 {
            self.buffer[self.enc_pos - 1]
        } else {
            0
        };
        let symbol = u32::from(self.buffer[self.enc_pos]);
        let bm = &mut self.m.bm_literal[get_lit_state(prev_byte)];
        if self.state.is_char_set_char() {
            self.renc.encode_tree(&mut bm[..0x100], symbol, 8);
        } else {
            let match_byte = self.buffer[self.enc_pos - self.reps[0] as usize - 1];
            self.renc.encode_matched(bm, symbol, u32::from(match_byte));
        }
        Ok(())
    }

    fn encode_short_rep(&mut self) -> Result<()> {
        let pos_state = (self.abs_pos() & POS_STATE_MASK) as usize;
        let state = self.state.get();
        self.renc.encode_bit(&mut self.m.bm_match[state][pos_state], 1);
        self.renc.encode_bit(&mut self.m.bm_rep[state], 1);
        self.renc.encode_bit(&mut self.m.bm_rep0[state], 0);
        self.renc.encode_bit(&mut self.m.bm_len[state][pos_state], 0);
        self.state.set_short_rep();
        Ok(())
    }

    fn encode_rep(&mut self, rep_index: usize, len: usize) -> Result<()> {
        let pos_state = (self.abs_pos() & POS_STATE_MASK) as usize;
        let state = self.state.get();
        self.renc.encode_bit(&mut self.m.bm_match[state][pos_state], 1);
        self.renc.encode_bit(&mut self.m.bm_rep[state], 1);
        match rep_index {
            0 => {
                self.renc.encode_bit(&mut self.m.bm_rep0[state], 0);
                self.renc.encode_bit(&mut self.m.bm_len[state][pos_state], 1);
            }
            1 => {
                self.renc.encode_bit(&mut self.m.bm_rep0[state], 1);
                self.renc.encode_bit(&mut self.m.bm_rep1[state], 0);
            }
            2 => {
                self.renc.encode_bit(&mut self.m.bm_rep0[state], 1);
                self.renc.encode_bit(&mut self.m.bm_rep1[state], 1);
                self.renc.encode_bit(&mut self.m.bm_rep2[state], 0);
            }
            _ => {
                self.renc.encode_bit(&mut self.m.bm_rep0[state], 1);
                self.renc.encode_bit(&mut self.m.bm_rep1[state], 1);
                self.renc.encode_bit(&mut self.m.bm_rep2[state], 1);
            }
        }
        // shuffle the recent-distance queue exactly as the decoder does
        let distance = self.reps[rep_index];
        match rep_index {
            0 => {}
            1 => {
                self.reps[1] = self.reps[0];
                self.reps[0] = distance;
            }
            2 => {
                self.reps[2] = self.reps[1];
                self.reps[1] = self.reps[0];
                self.reps[0] = distance;
            }
            _ => {
                self.reps[3] = self.reps[2];
                self.reps[2] = self.reps[1];
                self.reps[1] = self.reps[0];
                self.reps[0] = distance;
            }
        }
        self.state.set_rep();
        self.renc
            .encode_len(&mut self.m.rep_len_model, len, pos_state);
        Ok(())
    }

    fn encode_match(&mut self, dis: u32, len: usize) -> Result<()> {
        let pos_state = (self.abs_pos() & POS_STATE_MASK) as usize;
        let state = self.state.get();
        self.renc.encode_bit(&mut self.m.bm_match[state][pos_state], 1);
        self.renc.encode_bit(&mut self.m.bm_rep[state], 0);
        self.reps = [dis, self.reps[0], self.reps[1], self.reps[2]];
        self.encode_pair(dis, len, pos_state);
        self.state.set_match();
        Ok(())
    }

    /// Encode a (distance, length) pair; also used for the EOS marker.
    fn encode_pair(&mut self, dis: u32, len: usize, pos_state: usize) {
        self.renc
            .encode_len(&mut self.m.match_len_model, len, pos_state);
        let slot = get_slot(dis);
        self.renc
            .encode_tree(&mut self.m.bm_dis_slot[get_len_state(len)], slot, 6);
        if slot >= START_DIS_MODEL {
            let direct_bits = (slot >> 1) - 1;
            let base = (2 | (slot & 1)) << direct_bits;
            let rest = dis - base;
            if slot < END_DIS_MODEL {
                let offset = (base - slot) as usize;
                self.renc
                    .encode_tree_reversed(&mut self.m.bm_dis[offset..], rest, direct_bits);
            } else {
                self.renc
                    .encode(rest >> DIS_ALIGN_BITS, direct_bits - DIS_ALIGN_BITS as u32);
                self.renc
                    .encode_tree_reversed(&mut self.m.bm_align, rest & 0xF, 4);
            }
        }
    }
}

/// Compress `data` as a single lzip member at the given level (0-9).
///
/// The dictionary size is clamped to the data size, so small inputs get
/// small headers; an empty input yields the 36-byte minimal member.
pub fn compress_slice(data: &[u8], level: usize) -> Result<Vec<u8>> {
    let (dict_size, match_len_limit) = super::OPTION_MAPPING[level.min(9)];
    let data_len = u32::try_from(data.len().max(1)).unwrap_or(u32::MAX);
    let dict_size = dict_size.min(data_len).max(MIN_DICTIONARY_SIZE);
    let mut encoder = MemberEncoder::new(dict_size, match_len_limit, Vec::new())?;
    encoder.write(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma::{LzDecoder, RangeDecoder};

    fn round_trip(data: &[u8], level: usize) -> Vec<u8> {
        let member = compress_slice(data, level).unwrap();
        // trailer consistency band holds for our own output
        let trailer =
            LzipTrailer::from_bytes(member[member.len() - 20..].try_into().unwrap());
        assert!(trailer.check_consistency());
        assert_eq!(trailer.member_size(), member.len() as u64);
        assert_eq!(trailer.data_size(), data.len() as u64);

        let mut rdec = RangeDecoder::new(&member[..]);
        let mut hdr = [0u8; 6];
        assert_eq!(rdec.read_data(&mut hdr), 6);
        let dict_size = LzipHeader::from_bytes(hdr).verify().unwrap();
        let mut out = Vec::new();
        let mut decoder = LzDecoder::new(dict_size, &mut out);
        decoder.decode_member(&mut rdec, false).unwrap();
        out
    }

    struct Lcg(u32);

    impl Lcg {
        fn next_u8(&mut self) -> u8 {
            self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
            (self.0 >> 16) as u8
        }
    }

    #[test]
    fn empty_input_yields_minimal_member() {
        let member = compress_slice(b"", 0).unwrap();
        assert_eq!(member.len(), 36);
        assert_eq!(&member[..4], b"LZIP");
        assert_eq!(member[4], 1);
        assert_eq!(member[5], 0x0C); // 4 KiB dictionary
        let out = round_trip(b"", 0);
        assert!(out.is_empty());
    }

    #[test]
    fn hello_round_trip() {
        let data = b"hello, world!\n";
        let out = round_trip(data, 6);
        assert_eq!(out, data);
        // the trailer CRC is the CRC32 of the uncompressed data
        let member = compress_slice(data, 6).unwrap();
        let trailer =
            LzipTrailer::from_bytes(member[member.len() - 20..].try_into().unwrap());
        assert_eq!(trailer.data_crc(), CRC32.checksum(data));
    }

    #[test]
    fn repetitive_data_round_trip() {
        let mut data = Vec::new();
        for i in 0..1000u32 {
            data.extend_from_slice(b"abcabcabc_");
            data.extend_from_slice(&i.to_le_bytes());
        }
        for level in [0, 1, 6, 9] {
            assert_eq!(round_trip(&data, level), data);
        }
    }

    #[test]
    fn incompressible_data_round_trip() {
        let mut rng = Lcg(0x12345678);
        let data: Vec<u8> = (0..100_000).map(|_| rng.next_u8()).collect();
        assert_eq!(round_trip(&data, 6), data);
    }

    #[test]
    fn zeros_round_trip() {
        let data = vec![0u8; 70_000];
        assert_eq!(round_trip(&data, 9), data);
    }

    #[test]
    fn window_larger_than_dictionary_round_trip() {
        // data much larger than the level-0 64 KiB dictionary forces
        // window renormalization in the match finder
        let mut rng = Lcg(0xDEADBEEF);
        let mut data = Vec::new();
        for _ in 0..40_000 {
            let b = rng.next_u8() % 7;
            data.extend_from_slice(&[b, b, b.wrapping_add(1), b"x"[0], b]);
        }
        assert_eq!(round_trip(&data, 0), data);
    }

    #[test]
    fn streaming_writes_match_single_write() {
        let mut rng = Lcg(42);
        let data: Vec<u8> = (0..50_000).map(|_| rng.next_u8() % 23).collect();
        let mut encoder = MemberEncoder::new(1 << 16, 16, Vec::new()).unwrap();
        for chunk in data.chunks(777) {
            encoder.write(chunk).unwrap();
        }
        let streamed = encoder.finish().unwrap();

        let mut encoder = MemberEncoder::new(1 << 16, 16, Vec::new()).unwrap();
        encoder.write(&data).unwrap();
        let single = encoder.finish().unwrap();
        assert_eq!(streamed, single);
    }
}
