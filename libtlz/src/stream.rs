//! Whole-stream lzip operations: serial compress/decompress over
//! readers and writers, member listing, and byte-range decompression of
//! indexed files.

use std::io::{Read, Write};

use crate::header::LzipHeader;
use crate::index::LzipIndex;
use crate::io::ReadAt;
use crate::lzma::{LzDecoder, MemberEncoder, RangeDecoder, OPTION_MAPPING};
use crate::{Block, Error, Result};

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Compress `reader` into a single lzip member at `level`.
pub fn compress_stream<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    level: usize,
) -> Result<CompressStats> {
    let (dictionary_size, match_len_limit) = OPTION_MAPPING[level.min(9)];
    let counting = CountingWriter {
        inner: writer,
        count: 0,
    };
    let mut encoder = MemberEncoder::new(dictionary_size, match_len_limit, counting)?;
    let mut buf = vec![0u8; 65536];
    loop {
        let n = crate::io::read_exact_or_eof(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write(&buf[..n])?;
        if n < buf.len() {
            break;
        }
    }
    let data_size = encoder.data_position();
    let counting = encoder.finish()?;
    Ok(CompressStats {
        data_size,
        member_size: counting.count,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressStats {
    pub data_size: u64,
    pub member_size: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecompressStats {
    pub members: u64,
    pub data_size: u64,
    pub compressed_size: u64,
    pub trailing_size: u64,
}

/// Decompress every member of a concatenated lzip stream.
///
/// Trailing data after the last member is tolerated when
/// `ignore_trailing` is set; data that looks like a corrupt header is
/// always rejected.
pub fn decompress_stream<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    ignore_trailing: bool,
) -> Result<DecompressStats> {
    let mut rdec = RangeDecoder::new(reader);
    let mut stats = DecompressStats::default();
    loop {
        rdec.reset_member_position();
        let mut data = [0u8; LzipHeader::SIZE];
        let n = rdec.read_data(&mut data);
        if n == 0 && stats.members > 0 {
            break; // clean end of stream
        }
        let header = LzipHeader::from_bytes(data);
        if n < LzipHeader::SIZE || !header.check_magic() {
            if stats.members == 0 {
                return Err(if n == 0 {
                    Error::Corrupt("File ends unexpectedly at member header.".into())
                } else {
                    Error::BadMagic
                });
            }
            // trailing data; a corrupt copy of the magic is suspicious
            if header.check_corrupt() || (!ignore_trailing && n > 0) {
                return Err(Error::Corrupt("Trailing data not allowed.".into()));
            }
            stats.trailing_size += n as u64;
            break;
        }
        let dictionary_size = header.verify()?;
        let mut decoder = LzDecoder::new(dictionary_size, &mut writer);
        decoder.decode_member(&mut rdec, false)?;
        stats.members += 1;
        stats.data_size += decoder.data_position();
        stats.compressed_size += rdec.member_position();
    }
    Ok(stats)
}

/// Per-member line of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub member: usize,
    pub data_pos: u64,
    pub data_size: u64,
    pub member_pos: u64,
    pub member_size: u64,
    pub dictionary_size: u32,
}

/// List the members of an indexed file.
pub fn list_members(index: &LzipIndex) -> Vec<MemberInfo> {
    (0..index.members())
        .map(|i| MemberInfo {
            member: i,
            data_pos: index.dblock(i).pos(),
            data_size: index.dblock(i).size(),
            member_pos: index.mblock(i).pos(),
            member_size: index.mblock(i).size(),
            dictionary_size: index.member_dictionary_size(i),
        })
        .collect()
}

/// Decompress only the decoded byte range `range`, using the index to
/// decode just the members that overlap it.
pub fn decompress_range<S: ReadAt + ?Sized, W: Write>(
    source: &S,
    index: &LzipIndex,
    mut range: Block,
    mut writer: W,
) -> Result<u64> {
    let udata_size = index.udata_size();
    if range.end() > udata_size {
        range.set_size(udata_size.saturating_sub(range.pos()));
    }
    if range.size() == 0 {
        return Ok(0);
    }
    let mut written = 0u64;
    for i in 0..index.members() {
        let db = index.dblock(i);
        if db.size() == 0 || !range.overlaps(&db) {
            continue;
        }
        let out_skip = range.pos().saturating_sub(db.pos());
        let out_end = db.size().min(range.end() - db.pos());
        let mblock = index.mblock(i);
        let mut image = vec![0u8; mblock.size() as usize];
        if source.read_exact_at(&mut image, mblock.pos())? != image.len() {
            return Err(Error::Corrupt("Input file is truncated.".into()));
        }
        let mut rdec = RangeDecoder::new(&image[..]);
        let mut data = [0u8; LzipHeader::SIZE];
        if rdec.read_data(&mut data) != LzipHeader::SIZE {
            return Err(Error::UnexpectedEof { pos: 0 });
        }
        let dictionary_size = LzipHeader::from_bytes(data).verify()?;
        let mut decoder = LzDecoder::with_window(dictionary_size, &mut writer, out_skip, out_end);
        decoder.decode_member(&mut rdec, false)?;
        written += out_end - out_skip;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma::compress_slice;

    #[test]
    fn stream_round_trip_multimember() {
        let a_data = b"the first stream".to_vec();
        let b_data = vec![9u8; 4000];
        let mut image = compress_slice(&a_data, 2).unwrap();
        image.extend_from_slice(&compress_slice(&b_data, 2).unwrap());

        let mut out = Vec::new();
        let stats = decompress_stream(&image[..], &mut out, false).unwrap();
        assert_eq!(stats.members, 2);
        assert_eq!(stats.data_size, a_data.len() as u64 + 4000);
        assert_eq!(stats.compressed_size, image.len() as u64);
        let mut expected = a_data.clone();
        expected.extend_from_slice(&b_data);
        assert_eq!(out, expected);
    }

    #[test]
    fn compress_stream_round_trip() {
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut streamed = Vec::new();
        let stats = compress_stream(&data[..], &mut streamed, 6).unwrap();
        assert_eq!(stats.data_size, data.len() as u64);
        assert_eq!(stats.member_size, streamed.len() as u64);

        let mut out = Vec::new();
        decompress_stream(&streamed[..], &mut out, false).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn trailing_data_rules() {
        let image = compress_slice(b"payload", 0).unwrap();
        let mut with_trailing = image.clone();
        with_trailing.extend_from_slice(b"some trailing bytes");

        let mut out = Vec::new();
        assert!(decompress_stream(&with_trailing[..], &mut out, false).is_err());
        let mut out = Vec::new();
        let stats = decompress_stream(&with_trailing[..], &mut out, true).unwrap();
        assert_eq!(out, b"payload");
        assert_eq!(stats.members, 1);

        // a corrupt copy of the magic is rejected even when ignoring
        let mut corrupt = image.clone();
        corrupt.extend_from_slice(b"LZ\x00Pxx");
        let mut out = Vec::new();
        assert!(decompress_stream(&corrupt[..], &mut out, true).is_err());
    }

    #[test]
    fn range_decompress_crosses_members() {
        let a = b"0123456789".to_vec();
        let b = b"abcdefghij".to_vec();
        let mut image = compress_slice(&a, 0).unwrap();
        image.extend_from_slice(&compress_slice(&b, 0).unwrap());
        let index = LzipIndex::new(image.as_slice(), false).unwrap();

        let mut out = Vec::new();
        let n = decompress_range(image.as_slice(), &index, Block::new(8, 5), &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"89abc");

        // a range beyond the data is clipped
        let mut out = Vec::new();
        let n = decompress_range(image.as_slice(), &index, Block::new(15, 100), &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"fghij");
    }

    #[test]
    fn listing_matches_index() {
        let mut image = compress_slice(b"one", 0).unwrap();
        let first_size = image.len() as u64;
        image.extend_from_slice(&compress_slice(b"three", 0).unwrap());
        let index = LzipIndex::new(image.as_slice(), false).unwrap();
        let list = list_members(&index);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].data_pos, 0);
        assert_eq!(list[0].data_size, 3);
        assert_eq!(list[1].member_pos, first_size);
        assert_eq!(list[1].data_pos, 3);
        assert_eq!(list[1].data_size, 5);
    }
}
