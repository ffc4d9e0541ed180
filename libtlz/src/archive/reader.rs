//! Serial and indexed archive readers. Both expose the same operation
//! set over decompressed archive bytes; the indexed variant adds random
//! access by lzip member for the parallel pipelines.

use std::io::Read;

use super::ArchiveDescriptor;
use crate::header::LzipHeader;
use crate::io::ReadAt;
use crate::lzma::{LzDecoder, RangeDecoder};
use crate::tar::{
    parse_octal, round_up, Extended, TarHeader, UnknownKeywords, HEADER_SIZE, MAX_EDATA_SIZE,
    SIZE_L, SIZE_O,
};
use crate::{Error, Result};

fn end_error() -> Error {
    Error::Corrupt("Archive ends unexpectedly.".into())
}

/// Operations shared by the serial and the indexed readers.
pub trait ArchiveRead {
    /// Read exactly `buf.len()` decompressed archive bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Skip `size` decompressed bytes.
    fn skip(&mut self, size: u64) -> Result<()> {
        let mut scratch = [0u8; 32 * HEADER_SIZE];
        let mut rest = size;
        while rest > 0 {
            let n = (scratch.len() as u64).min(rest) as usize;
            self.read_exact(&mut scratch[..n])?;
            rest -= n as u64;
        }
        Ok(())
    }

    /// Skip the (padded) file data of the current tar member.
    fn skip_member(&mut self, extended: &Extended) -> Result<()> {
        self.skip(round_up(extended.file_size() as u64))
    }

    /// Parse the extended-records block following an `x` or `g` header.
    fn parse_records(
        &mut self,
        extended: &mut Extended,
        header: &TarHeader,
        permissive: bool,
        keywords: &UnknownKeywords,
        msgs: &mut Vec<String>,
    ) -> Result<()> {
        let edsize = parse_octal(&header[SIZE_O..SIZE_O + SIZE_L]);
        let bufsize = round_up(edsize);
        if edsize == 0 || bufsize > MAX_EDATA_SIZE {
            return Err(Error::Corrupt("Error in extended records.".into()));
        }
        let mut buf = vec![0u8; bufsize as usize];
        self.read_exact(&mut buf)?;
        extended.parse(&buf[..edsize as usize], permissive, keywords, msgs)
    }
}

/// Streaming reader over a non-seekable archive: either raw tar or a
/// concatenation of lzip members decompressed transparently.
pub struct SerialReader<R: Read> {
    rdec: RangeDecoder<R>,
    compressed: bool,
    first_member: bool,
    at_eof: bool,
    pending: Vec<u8>,
    cursor: usize,
}

impl<R: Read> SerialReader<R> {
    pub fn new(reader: R) -> SerialReader<R> {
        SerialReader {
            rdec: RangeDecoder::new(reader),
            compressed: false,
            first_member: true,
            at_eof: false,
            pending: Vec::new(),
            cursor: 0,
        }
    }

    /// Decode the next lzip member into the pending buffer, or detect a
    /// raw tar stream on the first call.
    fn refill(&mut self) -> Result<()> {
        self.pending.clear();
        self.cursor = 0;
        if self.at_eof {
            return Err(end_error());
        }
        if self.first_member {
            let mut data = [0u8; LzipHeader::SIZE];
            let n = self.rdec.read_data(&mut data);
            self.first_member = false;
            let header = LzipHeader::from_bytes(data);
            if n == LzipHeader::SIZE && header.check_magic() {
                self.compressed = true;
                let dict_size = header.verify()?;
                return self.decode_member(dict_size);
            }
            // raw tar archive: the bytes read are archive data
            self.pending.extend_from_slice(&data[..n]);
            if n < LzipHeader::SIZE {
                self.at_eof = true;
            }
            return Ok(());
        }
        if !self.compressed {
            let mut buf = vec![0u8; 64 * HEADER_SIZE];
            let n = self.rdec.read_data(&mut buf);
            if n == 0 {
                self.at_eof = true;
                return Err(end_error());
            }
            buf.truncate(n);
            self.pending = buf;
            return Ok(());
        }
        // next member header
        self.rdec.reset_member_position();
        let mut data = [0u8; LzipHeader::SIZE];
        let n = self.rdec.read_data(&mut data);
        if n == 0 {
            self.at_eof = true;
            return Err(end_error());
        }
        if n < LzipHeader::SIZE {
            return Err(end_error());
        }
        let header = LzipHeader::from_bytes(data);
        if !header.check_magic() {
            // trailing data after the last member ends the archive
            self.at_eof = true;
            return Err(end_error());
        }
        let dict_size = header.verify()?;
        self.decode_member(dict_size)
    }

    fn decode_member(&mut self, dict_size: u32) -> Result<()> {
        let mut out = Vec::new();
        let mut decoder = LzDecoder::new(dict_size, &mut out);
        decoder.decode_member(&mut self.rdec, false)?;
        self.pending = out;
        Ok(())
    }

    /// Whether the decompressed stream is exhausted. May decode ahead.
    pub fn finished(&mut self) -> bool {
        while self.cursor >= self.pending.len() {
            if self.refill().is_err() {
                return true;
            }
            if self.pending.is_empty() && self.at_eof {
                return true;
            }
        }
        false
    }
}

impl<R: Read> ArchiveRead for SerialReader<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            if self.cursor >= self.pending.len() {
                self.refill()?;
                if self.pending.is_empty() {
                    return Err(end_error());
                }
                continue;
            }
            let n = (buf.len() - done).min(self.pending.len() - self.cursor);
            buf[done..done + n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            self.cursor += n;
            done += n;
        }
        Ok(())
    }
}

/// One of N parallel readers over an indexed archive. Each reader uses
/// positional reads and its own decoder state; the descriptor is shared
/// read-only.
pub struct IndexedReader<'a> {
    ad: &'a ArchiveDescriptor,
    member_id: usize,
    data_pos: u64,
    mdata_end: u64,
    pending: Vec<u8>,
    cursor: usize,
}

impl<'a> IndexedReader<'a> {
    pub fn new(ad: &'a ArchiveDescriptor) -> IndexedReader<'a> {
        IndexedReader {
            ad,
            member_id: 0,
            data_pos: 0,
            mdata_end: 0,
            pending: Vec::new(),
            cursor: 0,
        }
    }

    /// Current decompressed position in the archive.
    pub fn data_pos(&self) -> u64 {
        self.data_pos
    }

    /// End of the current member's decompressed data.
    pub fn mdata_end(&self) -> u64 {
        self.mdata_end
    }

    pub fn at_member_end(&self) -> bool {
        self.data_pos == self.mdata_end
    }

    /// Reset the decoder and position at the start of member `i`.
    pub fn set_member(&mut self, i: usize) -> Result<()> {
        self.decode_whole_member(i)?;
        self.member_id = i;
        self.data_pos = self.ad.index.dblock(i).pos();
        self.mdata_end = self.ad.index.dblock(i).end();
        self.cursor = 0;
        Ok(())
    }

    fn decode_whole_member(&mut self, i: usize) -> Result<()> {
        let mblock = self.ad.index.mblock(i);
        let mut image = vec![0u8; mblock.size() as usize];
        if self.ad.file.read_exact_at(&mut image, mblock.pos())? != image.len() {
            return Err(end_error());
        }
        let mut rdec = RangeDecoder::new(&image[..]);
        let mut data = [0u8; LzipHeader::SIZE];
        if rdec.read_data(&mut data) != LzipHeader::SIZE {
            return Err(end_error());
        }
        let dict_size = LzipHeader::from_bytes(data).verify()?;
        let mut out = Vec::new();
        let mut decoder = LzDecoder::new(dict_size, &mut out);
        decoder.decode_member(&mut rdec, false)?;
        self.pending = out;
        Ok(())
    }
}

impl ArchiveRead for IndexedReader<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            if self.cursor >= self.pending.len() {
                // continue into the next member; needed when a tar
                // member crosses an lzip member boundary
                if self.member_id + 1 >= self.ad.index.members() {
                    return Err(end_error());
                }
                self.member_id += 1;
                self.decode_whole_member(self.member_id)?;
                self.mdata_end = self.ad.index.dblock(self.member_id).end();
                self.cursor = 0;
                continue;
            }
            let n = (buf.len() - done).min(self.pending.len() - self.cursor);
            buf[done..done + n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            self.cursor += n;
            self.data_pos += n as u64;
            done += n;
        }
        Ok(())
    }
}
