//! The 6-byte lzip member header: magic, version, coded dictionary size.

use crate::{Error, Result};

/// Lzip magic bytes: "LZIP".
pub const LZIP_MAGIC: [u8; 4] = [0x4C, 0x5A, 0x49, 0x50];

/// The only supported member version.
pub const LZIP_VERSION: u8 = 1;

pub const MIN_DICTIONARY_BITS: u32 = 12;
/// 4 KiB.
pub const MIN_DICTIONARY_SIZE: u32 = 1 << MIN_DICTIONARY_BITS;
pub const MAX_DICTIONARY_BITS: u32 = 29;
/// 512 MiB.
pub const MAX_DICTIONARY_SIZE: u32 = 1 << MAX_DICTIONARY_BITS;

/// Smallest possible member: header + empty LZMA stream + trailer.
pub const MIN_MEMBER_SIZE: u64 = 36;

pub fn isvalid_ds(dictionary_size: u32) -> bool {
    (MIN_DICTIONARY_SIZE..=MAX_DICTIONARY_SIZE).contains(&dictionary_size)
}

fn real_bits(mut value: u32) -> u32 {
    let mut bits = 0;
    while value > 0 {
        value >>= 1;
        bits += 1;
    }
    bits
}

/// Lzip member header.
///
/// The dictionary size is coded in one byte as a power of two (bits 4-0,
/// the base) minus a fraction between 0/16 and 7/16 of the base (bits
/// 7-5). Example: 0xD3 = 2^19 - 6 * 2^15 = 320 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzipHeader {
    pub data: [u8; 6],
}

impl LzipHeader {
    pub const SIZE: usize = 6;

    /// Build a header for the given dictionary size, which must be valid.
    pub fn new(dictionary_size: u32) -> Result<LzipHeader> {
        if !isvalid_ds(dictionary_size) {
            return Err(Error::BadDictSize);
        }
        let mut data = [0u8; 6];
        data[..4].copy_from_slice(&LZIP_MAGIC);
        data[4] = LZIP_VERSION;
        data[5] = real_bits(dictionary_size - 1) as u8;
        if dictionary_size > MIN_DICTIONARY_SIZE {
            let base_size = 1u32 << data[5];
            let fraction = base_size / 16;
            for i in (1..=7u8).rev() {
                if base_size - u32::from(i) * fraction >= dictionary_size {
                    data[5] |= i << 5;
                    break;
                }
            }
        }
        Ok(LzipHeader { data })
    }

    pub fn from_bytes(data: [u8; 6]) -> LzipHeader {
        LzipHeader { data }
    }

    pub fn check_magic(&self) -> bool {
        self.data[..4] == LZIP_MAGIC
    }

    /// Detect a (possibly truncated) header prefix of `sz` bytes.
    pub fn check_prefix(&self, sz: usize) -> bool {
        if sz == 0 {
            return false;
        }
        self.data
            .iter()
            .zip(LZIP_MAGIC.iter())
            .take(sz.min(4))
            .all(|(a, b)| a == b)
    }

    /// Detect a corrupt magic: more than one byte matches but not all.
    pub fn check_corrupt(&self) -> bool {
        let matches = self
            .data
            .iter()
            .zip(LZIP_MAGIC.iter())
            .filter(|(a, b)| a == b)
            .count();
        matches > 1 && matches < 4
    }

    pub fn version(&self) -> u8 {
        self.data[4]
    }

    pub fn check_version(&self) -> bool {
        self.data[4] == LZIP_VERSION
    }

    pub fn dictionary_size(&self) -> u32 {
        let mut sz = 1u32 << (self.data[5] & 0x1F);
        if sz > MIN_DICTIONARY_SIZE {
            sz -= (sz / 16) * u32::from((self.data[5] >> 5) & 7);
        }
        sz
    }

    pub fn check(&self) -> bool {
        self.check_magic() && self.check_version() && isvalid_ds(self.dictionary_size())
    }

    /// Full validation returning the specific error.
    pub fn verify(&self) -> Result<u32> {
        if !self.check_magic() {
            return Err(Error::BadMagic);
        }
        if !self.check_version() {
            return Err(Error::BadVersion(self.version()));
        }
        let dictionary_size = self.dictionary_size();
        if !isvalid_ds(dictionary_size) {
            return Err(Error::BadDictSize);
        }
        Ok(dictionary_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_size_coding() {
        // 0xD3 = 2^19 - 6 * 2^15 = 320 KiB
        let header = LzipHeader::from_bytes([0x4C, 0x5A, 0x49, 0x50, 1, 0xD3]);
        assert_eq!(header.dictionary_size(), 320 * 1024);
        assert!(header.check());

        let header = LzipHeader::new(4 * 1024).unwrap();
        assert_eq!(header.data[5], 0x0C);
        let header = LzipHeader::new(512 * 1024 * 1024).unwrap();
        assert_eq!(header.data[5], 0x1D);
    }

    #[test]
    fn dict_size_round_trip() {
        // Every valid size must survive coding, possibly rounded up, and
        // exact powers of two and 16ths must round-trip exactly.
        for bits in MIN_DICTIONARY_BITS..=MAX_DICTIONARY_BITS {
            let base = 1u32 << bits;
            for num in 0..8u32 {
                let sz = base - (base / 16) * num;
                if !isvalid_ds(sz) {
                    continue;
                }
                let header = LzipHeader::new(sz).unwrap();
                assert_eq!(header.dictionary_size(), sz);
            }
        }
        for sz in [6000u32, 100_000, 1 << 20, (1 << 23) + 1] {
            let header = LzipHeader::new(sz).unwrap();
            assert!(header.dictionary_size() >= sz);
            assert!(isvalid_ds(header.dictionary_size()));
        }
    }

    #[test]
    fn invalid_sizes_rejected() {
        assert!(LzipHeader::new(MIN_DICTIONARY_SIZE - 1).is_err());
        let header = LzipHeader::from_bytes([0x4C, 0x5A, 0x49, 0x50, 1, 0x0B]);
        assert!(!header.check());
        assert!(matches!(header.verify(), Err(Error::BadDictSize)));
    }

    #[test]
    fn corrupt_magic_detection() {
        let good = LzipHeader::from_bytes([0x4C, 0x5A, 0x49, 0x50, 1, 0x0C]);
        assert!(!good.check_corrupt());
        let corrupt = LzipHeader::from_bytes([0x4C, 0x5A, 0x00, 0x50, 1, 0x0C]);
        assert!(corrupt.check_corrupt());
        let unrelated = LzipHeader::from_bytes([0, 0, 0, 0, 1, 0x0C]);
        assert!(!unrelated.check_corrupt());
        assert!(corrupt.check_prefix(2));
        assert!(!unrelated.check_prefix(2));
    }
}
