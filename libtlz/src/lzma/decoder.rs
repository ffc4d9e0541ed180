//! LZMA member decoder: context model, match/literal/rep decoding, and
//! the sliding-window output buffer.

use std::io::{Read, Write};

use super::{
    get_len_state, get_lit_state, Models, RangeDecoder, State, DIS_ALIGN_BITS, END_DIS_MODEL,
    MIN_MATCH_LEN, POS_STATE_MASK, START_DIS_MODEL,
};
use crate::io::CRC32;
use crate::trailer::LzipTrailer;
use crate::{Error, Result, TrailerMismatch};

/// Decodes one lzip member into a [`Write`] sink.
///
/// Owns the sliding dictionary for the whole decode call; the buffer is
/// scribed in place and flushed to the sink as the write cursor wraps.
/// An optional `[out_skip, out_end)` window restricts which decoded bytes
/// reach the sink (the CRC always covers everything).
pub struct LzDecoder<W> {
    partial_data_pos: u64,
    dictionary_size: usize,
    buffer: Vec<u8>,
    pos: usize,
    stream_pos: usize,
    crc_digest: crc::Digest<'static, u32, crc::Table<16>>,
    out: W,
    out_skip: u64,
    out_end: u64,
    pos_wrapped: bool,
}

impl<W: Write> LzDecoder<W> {
    pub fn new(dictionary_size: u32, out: W) -> LzDecoder<W> {
        let dictionary_size = dictionary_size as usize;
        let mut buffer = vec![0u8; dictionary_size];
        // prev_byte of the first byte; also peek(0) on a corrupt file
        buffer[dictionary_size - 1] = 0;
        LzDecoder {
            partial_data_pos: 0,
            dictionary_size,
            buffer,
            pos: 0,
            stream_pos: 0,
            crc_digest: CRC32.digest(),
            out,
            out_skip: 0,
            out_end: u64::MAX,
            pos_wrapped: false,
        }
    }

    /// Restrict the sink to the decoded byte range `[skip, end)`.
    pub fn with_window(dictionary_size: u32, out: W, skip: u64, end: u64) -> LzDecoder<W> {
        let mut d = LzDecoder::new(dictionary_size, out);
        d.out_skip = skip;
        d.out_end = end;
        d
    }

    pub fn data_position(&self) -> u64 {
        self.partial_data_pos + self.pos as u64
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn stream_position(&self) -> u64 {
        self.partial_data_pos + self.stream_pos as u64
    }

    fn flush_data(&mut self) -> Result<()> {
        if self.pos > self.stream_pos {
            let size = self.pos - self.stream_pos;
            self.crc_digest
                .update(&self.buffer[self.stream_pos..self.pos]);
            let sp = self.stream_position();
            let skip = self.out_skip.saturating_sub(sp);
            let end = (self.out_end.saturating_sub(sp)).min(size as u64);
            if end > skip {
                let a = self.stream_pos + skip as usize;
                let b = self.stream_pos + end as usize;
                self.out.write_all(&self.buffer[a..b])?;
            }
            if self.pos >= self.dictionary_size {
                self.partial_data_pos += self.pos as u64;
                self.pos = 0;
                self.pos_wrapped = true;
            }
            self.stream_pos = self.pos;
        }
        Ok(())
    }

    #[inline]
    fn peek_prev(&self) -> u8 {
        let i = if self.pos > 0 {
            self.pos
        } else {
            self.dictionary_size
        };
        self.buffer[i - 1]
    }

    #[inline]
    fn peek(&self, distance: u32) -> u8 {
        let distance = distance as usize;
        let i = if self.pos > distance {
            self.pos - distance - 1
        } else {
            self.dictionary_size + self.pos - distance - 1
        };
        self.buffer[i]
    }

    #[inline]
    fn put_byte(&mut self, b: u8) -> Result<()> {
        self.buffer[self.pos] = b;
        self.pos += 1;
        if self.pos >= self.dictionary_size {
            self.flush_data()?;
        }
        Ok(())
    }

    /// Copy `len` bytes from `distance` back, handling self-overlap and
    /// wrap around the dictionary end.
    fn copy_block(&mut self, distance: u32, mut len: usize) -> Result<()> {
        let distance = distance as usize;
        let mut lpos = self.pos;
        let mut i;
        let fast;
        let fast2;
        if lpos > distance {
            i = lpos - distance - 1;
            fast = len < self.dictionary_size - lpos;
            fast2 = fast && len <= lpos - i;
        } else {
            i = self.dictionary_size + lpos - distance - 1;
            fast = len < self.dictionary_size - i; // (i == pos) may happen
            fast2 = fast && len <= i - lpos;
        }
        if fast {
            // no wrap
            self.pos += len;
            if fast2 {
                // no wrap, no overlap
                self.buffer.copy_within(i..i + len, lpos);
            } else {
                for _ in 0..len {
                    self.buffer[lpos] = self.buffer[i];
                    lpos += 1;
                    i += 1;
                }
            }
        } else {
            while len > 0 {
                self.buffer[self.pos] = self.buffer[i];
                self.pos += 1;
                if self.pos >= self.dictionary_size {
                    self.flush_data()?;
                }
                i += 1;
                if i >= self.dictionary_size {
                    i = 0;
                }
                len -= 1;
            }
        }
        Ok(())
    }

    fn check_trailer<R: Read>(&mut self, rdec: &mut RangeDecoder<R>) -> Result<()> {
        let mut data = [0u8; LzipTrailer::SIZE];
        let size = rdec.read_data(&mut data);
        let mut mismatch = TrailerMismatch::default();
        if size < LzipTrailer::SIZE {
            mismatch.truncated_at = Some(size);
        }
        let trailer = LzipTrailer::from_bytes(data);

        let digest = std::mem::replace(&mut self.crc_digest, CRC32.digest());
        let computed_crc = digest.finalize();
        if trailer.data_crc() != computed_crc {
            mismatch.crc = Some((trailer.data_crc(), computed_crc));
        }
        let data_size = self.data_position();
        if trailer.data_size() != data_size {
            mismatch.data_size = Some((trailer.data_size(), data_size));
        }
        let member_size = rdec.member_position();
        if trailer.member_size() != member_size {
            mismatch.member_size = Some((trailer.member_size(), member_size));
        }
        if mismatch.any() {
            return Err(Error::Trailer(mismatch));
        }
        Ok(())
    }

    /// Decode one member.
    ///
    /// `rdec` must be positioned just after the member header. On success
    /// the trailer has been read and verified. The failure modes are the
    /// `Error` variants `NonzeroFirstByte`, `Decoder`, `UnexpectedEof`,
    /// `Trailer`, `UnknownMarker` and `Io`.
    pub fn decode_member<R: Read>(
        &mut self,
        rdec: &mut RangeDecoder<R>,
        ignore_nonzero: bool,
    ) -> Result<()> {
        let mut m = Box::<Models>::default();
        let mut rep0: u32 = 0; // rep[0-3] latest four distances
        let mut rep1: u32 = 0; // used for efficient coding of
        let mut rep2: u32 = 0; // repeated distances
        let mut rep3: u32 = 0;
        let mut state = State::default();

        rdec.load(ignore_nonzero)?;
        while !rdec.finished() {
            let pos_state = (self.data_position() & POS_STATE_MASK) as usize;
            if rdec.decode_bit(&mut m.bm_match[state.get()][pos_state]) == 0 {
                // literal byte
                let bm = &mut m.bm_literal[get_lit_state(self.peek_prev())];
                if state.is_char_set_char() {
                    let b = rdec.decode_tree8(&mut bm[..0x100]) as u8;
                    self.put_byte(b)?;
                } else {
                    let b = rdec.decode_matched(bm, u32::from(self.peek(rep0))) as u8;
                    self.put_byte(b)?;
                }
                continue;
            }
            // match or repeated match
            let len;
            if rdec.decode_bit(&mut m.bm_rep[state.get()]) != 0 {
                if rdec.decode_bit(&mut m.bm_rep0[state.get()]) == 0 {
                    if rdec.decode_bit(&mut m.bm_len[state.get()][pos_state]) == 0 {
                        state.set_short_rep();
                        let b = self.peek(rep0);
                        self.put_byte(b)?;
                        continue;
                    }
                } else {
                    let distance;
                    if rdec.decode_bit(&mut m.bm_rep1[state.get()]) == 0 {
                        distance = rep1;
                    } else {
                        if rdec.decode_bit(&mut m.bm_rep2[state.get()]) == 0 {
                            distance = rep2;
                        } else {
                            distance = rep3;
                            rep3 = rep2;
                        }
                        rep2 = rep1;
                    }
                    rep1 = rep0;
                    rep0 = distance;
                }
                state.set_rep();
                len = rdec.decode_len(&mut m.rep_len_model, pos_state);
            } else {
                // match
                rep3 = rep2;
                rep2 = rep1;
                rep1 = rep0;
                len = rdec.decode_len(&mut m.match_len_model, pos_state);
                rep0 = rdec.decode_tree6(&mut m.bm_dis_slot[get_len_state(len)]);
                if rep0 >= START_DIS_MODEL {
                    let dis_slot = rep0;
                    let direct_bits = (dis_slot >> 1) - 1;
                    rep0 = (2 | (dis_slot & 1)) << direct_bits;
                    if dis_slot < END_DIS_MODEL {
                        let base = (rep0 - dis_slot) as usize;
                        rep0 += rdec
                            .decode_tree_reversed(&mut m.bm_dis[base..], direct_bits as usize);
                    } else {
                        rep0 +=
                            rdec.decode(direct_bits - DIS_ALIGN_BITS as u32) << DIS_ALIGN_BITS;
                        rep0 += rdec.decode_tree_reversed4(&mut m.bm_align);
                        if rep0 == 0xFFFF_FFFF {
                            // marker found
                            rdec.normalize();
                            self.flush_data()?;
                            if let Some(e) = rdec.take_io_error() {
                                return Err(Error::Io(e));
                            }
                            if len == MIN_MATCH_LEN {
                                // End Of Stream marker
                                return self.check_trailer(rdec);
                            }
                            return Err(Error::UnknownMarker(len as u32));
                        }
                    }
                }
                state.set_match();
                if rep0 as usize >= self.dictionary_size
                    || (rep0 as usize >= self.pos && !self.pos_wrapped)
                {
                    self.flush_data()?;
                    if let Some(e) = rdec.take_io_error() {
                        return Err(Error::Io(e));
                    }
                    return Err(Error::Decoder {
                        pos: rdec.member_position(),
                    });
                }
            }
            self.copy_block(rep0, len)?;
        }
        self.flush_data()?;
        if let Some(e) = rdec.take_io_error() {
            return Err(Error::Io(e));
        }
        Err(Error::UnexpectedEof {
            pos: rdec.member_position(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::EOA_MEMBER;
    use crate::header::LzipHeader;

    fn decode_all(image: &[u8]) -> (Result<()>, Vec<u8>, u64) {
        let mut rdec = RangeDecoder::new(image);
        let mut data = [0u8; LzipHeader::SIZE];
        assert_eq!(rdec.read_data(&mut data), LzipHeader::SIZE);
        let dict_size = LzipHeader::from_bytes(data).verify().unwrap();
        let mut out = Vec::new();
        let mut decoder = LzDecoder::new(dict_size, &mut out);
        let res = decoder.decode_member(&mut rdec, false);
        let dpos = decoder.data_position();
        (res, out, dpos)
    }

    /* EOA_MEMBER is the canonical End-Of-Archive member of a compressed
    tar.lz archive: a 44-byte lzip member holding two zeroed 512-byte
    blocks. Serves as a golden cross-implementation vector for the whole
    decode path. */
    #[test]
    fn golden_eoa_member_decodes_to_zero_blocks() {
        let header = LzipHeader::from_bytes(EOA_MEMBER[..6].try_into().unwrap());
        assert_eq!(header.verify().unwrap(), 4096);

        let (res, out, dpos) = decode_all(&EOA_MEMBER);
        res.unwrap();
        assert_eq!(dpos, 1024);
        assert_eq!(out, vec![0u8; 1024]);
    }

    #[test]
    fn member_truncated_in_trailer_reports_all_checks() {
        // EOS marker complete, trailer missing its last byte: the decoded
        // prefix is intact and the trailer check reports the truncation.
        let (res, out, _) = decode_all(&EOA_MEMBER[..EOA_MEMBER.len() - 1]);
        match res {
            Err(Error::Trailer(t)) => {
                assert_eq!(t.truncated_at, Some(19));
                assert!(t.member_size.is_some());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(out, vec![0u8; 1024]);
    }

    #[test]
    fn member_truncated_in_stream_keeps_decoded_prefix() {
        let (res, out, _) = decode_all(&EOA_MEMBER[..EOA_MEMBER.len() - 22]);
        assert!(res.is_err());
        // the output produced before the truncation point is intact
        assert!(out.len() >= 1024);
        assert!(out[..1024].iter().all(|&b| b == 0));
    }

    #[test]
    fn garbage_stream_fails() {
        let mut garbage = EOA_MEMBER;
        for b in garbage[7..16].iter_mut() {
            *b ^= 0x55;
        }
        let (res, _, _) = decode_all(&garbage);
        assert!(res.is_err());
    }
}
