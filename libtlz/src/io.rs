//! Shared primitives: CRC tables, extent arithmetic, member selection,
//! and positional-read plumbing used by the indexer and the edit engine.

use std::fs::File;
use std::io::Read;

use crate::Result;

/// CRC32, IEEE 802.3 polynomial (0xEDB88320 reflected). Used by lzip
/// trailers and FEC CRC arrays.
pub static CRC32: crc::Crc<u32, crc::Table<16>> =
    crc::Crc::<u32, crc::Table<16>>::new(&crc::CRC_32_ISO_HDLC);

/// CRC32-C, Castagnoli polynomial (0x82F63B78 reflected). Used by pax
/// extended records and FEC CRC arrays.
pub static CRC32C: crc::Crc<u32, crc::Table<16>> =
    crc::Crc::<u32, crc::Table<16>>::new(&crc::CRC_32_ISCSI);

/// CRC of `buf` except a window of 8 bytes at `pos`.
///
/// The pax CRC record stores its own hex digits inside the checksummed
/// block; the window exempts exactly those 8 bytes.
pub fn windowed_crc32c(buf: &[u8], pos: usize) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(&buf[..pos]);
    digest.update(&buf[pos + 8..]);
    digest.finalize()
}

/// A byte extent: `pos >= 0`, `size >= 0`, `pos + size <= i64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pos: u64,
    size: u64,
}

impl Block {
    pub fn new(pos: u64, size: u64) -> Block {
        Block { pos, size }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.pos + self.size
    }

    pub fn set_pos(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn includes(&self, pos: u64) -> bool {
        self.pos <= pos && self.end() > pos
    }

    pub fn overlaps(&self, other: &Block) -> bool {
        self.pos < other.end() && other.pos < self.end()
    }
}

/// Selects members and trailing data for the edit engine.
///
/// `ranges` count blocks from the beginning, `rranges` from the end.
/// When `reverse_in` or `in_` is false the selection is complemented.
#[derive(Debug, Clone)]
pub struct MemberList {
    pub damaged: bool,
    pub empty: bool,
    pub tdata: bool,
    pub in_: bool,
    pub reverse_in: bool,
    pub ranges: Vec<Block>,
    pub rranges: Vec<Block>,
}

impl Default for MemberList {
    fn default() -> MemberList {
        MemberList::new()
    }
}

impl MemberList {
    pub fn new() -> MemberList {
        MemberList {
            damaged: false,
            empty: false,
            tdata: false,
            in_: true,
            reverse_in: true,
            ranges: Vec::new(),
            rranges: Vec::new(),
        }
    }

    /// Select only trailing data.
    pub fn tdata_only() -> MemberList {
        MemberList {
            tdata: true,
            ..MemberList::new()
        }
    }

    /// Select only damaged members.
    pub fn damaged_only() -> MemberList {
        MemberList {
            damaged: true,
            ..MemberList::new()
        }
    }

    /// Select a range of blocks, counted from the beginning.
    pub fn from_range(pos: u64, size: u64) -> MemberList {
        MemberList {
            ranges: vec![Block::new(pos, size)],
            ..MemberList::new()
        }
    }

    pub fn has_ranges(&self) -> bool {
        !self.ranges.is_empty() || !self.rranges.is_empty()
    }

    /// Whether block `i` of `blocks` (members + gaps, excluding trailing
    /// data) is selected.
    pub fn includes(&self, i: u64, blocks: u64) -> bool {
        for range in &self.ranges {
            if range.pos() > i {
                break;
            }
            if range.end() > i {
                return self.in_;
            }
        }
        if i < blocks {
            let ri = blocks - i - 1;
            for range in &self.rranges {
                if range.pos() > ri {
                    break;
                }
                if range.end() > ri {
                    return self.reverse_in;
                }
            }
        }
        !self.in_ || !self.reverse_in
    }
}

/// Positional-read seam shared by the indexer, the FEC engine, and the
/// indexed archive readers.
///
/// Implemented by [`File`] (pread, no shared cursor, safe for concurrent
/// readers) and by byte slices (tests and in-memory images).
pub trait ReadAt {
    /// Total size of the source in bytes.
    fn size(&self) -> Result<u64>;

    /// Read up to `buf.len()` bytes at absolute position `pos`.
    /// Returns the number of bytes read; 0 means EOF.
    fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `pos`, retrying short reads.
    /// Returns the number of bytes read, which is less than requested
    /// only at end of file.
    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let mut sz = 0;
        while sz < buf.len() {
            let n = self.read_at(&mut buf[sz..], pos + sz as u64)?;
            if n == 0 {
                break;
            }
            sz += n;
        }
        Ok(sz)
    }
}

impl ReadAt for File {
    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(FileExt::read_at(self, buf, pos)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom};
            let mut f = self;
            f.seek(SeekFrom::Start(pos))?;
            Ok(f.take(buf.len() as u64).read(buf)?)
        }
    }
}

impl ReadAt for [u8] {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        if pos >= self.len() as u64 {
            return Ok(0);
        }
        let start = pos as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Read as many bytes as possible into `buf`, retrying short reads.
/// A return value smaller than `buf.len()` means EOF was reached.
pub fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut sz = 0;
    while sz < buf.len() {
        match reader.read(&mut buf[sz..]) {
            Ok(0) => break,
            Ok(n) => sz += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(sz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // Standard check input for both polynomials.
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF43926);
        assert_eq!(CRC32C.checksum(b"123456789"), 0xE3069283);
    }

    #[test]
    fn windowed_crc_skips_the_window() {
        let mut buf = *b"0123456789abcdefXXXXXXXXtail";
        let pos = 16;
        let a = windowed_crc32c(&buf, pos);
        buf[pos..pos + 8].copy_from_slice(b"YYYYYYYY");
        assert_eq!(a, windowed_crc32c(&buf, pos));
        buf[0] ^= 1;
        assert_ne!(a, windowed_crc32c(&buf, pos));
    }

    #[test]
    fn member_list_ranges() {
        let mut ml = MemberList::from_range(1, 2); // blocks 1 and 2
        assert!(!ml.includes(0, 5));
        assert!(ml.includes(1, 5));
        assert!(ml.includes(2, 5));
        assert!(!ml.includes(3, 5));

        ml.rranges.push(Block::new(0, 1)); // last block too
        assert!(ml.includes(4, 5));
        assert!(!ml.includes(3, 5));
    }

    #[test]
    fn slice_read_at() {
        let data: &[u8] = b"hello world";
        let mut buf = [0u8; 5];
        assert_eq!(data.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(data.read_at(&mut buf, 11).unwrap(), 0);
        assert_eq!(data.read_exact_at(&mut buf, 9).unwrap(), 2);
    }
}
