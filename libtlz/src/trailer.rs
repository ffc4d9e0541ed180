//! The 20-byte lzip member trailer: data CRC, data size, member size.

use crate::header::MIN_MEMBER_SIZE;

/// Lzip member trailer.
///
/// Bytes 0-3 hold the CRC32 of the uncompressed data, bytes 4-11 the
/// uncompressed size, bytes 12-19 the member size including header and
/// trailer, all little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzipTrailer {
    pub data: [u8; 20],
}

impl LzipTrailer {
    pub const SIZE: usize = 20;

    pub fn new(data_crc: u32, data_size: u64, member_size: u64) -> LzipTrailer {
        let mut trailer = LzipTrailer { data: [0; 20] };
        trailer.data[..4].copy_from_slice(&data_crc.to_le_bytes());
        trailer.data[4..12].copy_from_slice(&data_size.to_le_bytes());
        trailer.data[12..20].copy_from_slice(&member_size.to_le_bytes());
        trailer
    }

    pub fn from_bytes(data: [u8; 20]) -> LzipTrailer {
        LzipTrailer { data }
    }

    pub fn data_crc(&self) -> u32 {
        u32::from_le_bytes(self.data[..4].try_into().unwrap())
    }

    pub fn data_size(&self) -> u64 {
        u64::from_le_bytes(self.data[4..12].try_into().unwrap())
    }

    pub fn member_size(&self) -> u64 {
        u64::from_le_bytes(self.data[12..20].try_into().unwrap())
    }

    /// Internal consistency of the three fields.
    ///
    /// A zero CRC forces a zero data size and vice versa; the member size
    /// must lie in `[36, 2^63)` and inside the LZMA expansion/ratio band:
    /// `msize <= (9 * dsize + 7) / 8 + 36` and
    /// `dsize <= 7090 * (msize - 26) - 1`, each checked only when the
    /// bound does not overflow its counterpart.
    pub fn check_consistency(&self) -> bool {
        let crc = self.data_crc();
        let dsize = self.data_size();
        if (crc == 0) != (dsize == 0) {
            return false;
        }
        let msize = self.member_size();
        if msize < MIN_MEMBER_SIZE || msize >= 1u64 << 63 {
            return false;
        }
        let mlimit = match dsize.checked_mul(9) {
            Some(x) => (x + 7) / 8 + MIN_MEMBER_SIZE,
            None => u64::MAX,
        };
        if mlimit > dsize && msize > mlimit {
            return false;
        }
        let dlimit = match (msize - 26).checked_mul(7090) {
            Some(x) => x - 1,
            None => u64::MAX,
        };
        if dlimit > msize && dsize > dlimit {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_round_trip() {
        let trailer = LzipTrailer::new(0xDEADBEEF, 12345, 678);
        assert_eq!(trailer.data_crc(), 0xDEADBEEF);
        assert_eq!(trailer.data_size(), 12345);
        assert_eq!(trailer.member_size(), 678);
        let trailer2 = LzipTrailer::from_bytes(trailer.data);
        assert_eq!(trailer, trailer2);
    }

    #[test]
    fn consistency_band() {
        // empty member
        assert!(LzipTrailer::new(0, 0, 36).check_consistency());
        // zero crc with nonzero size and vice versa
        assert!(!LzipTrailer::new(0, 10, 46).check_consistency());
        assert!(!LzipTrailer::new(1, 0, 36).check_consistency());
        // too small / too large member
        assert!(!LzipTrailer::new(0, 0, 35).check_consistency());
        assert!(!LzipTrailer::new(1, 10, 1u64 << 63).check_consistency());
        // incompressible data may expand by at most 9/8 plus overhead
        assert!(LzipTrailer::new(1, 800, 936).check_consistency());
        assert!(!LzipTrailer::new(1, 800, 937).check_consistency());
        // maximum compression ratio is bounded
        assert!(!LzipTrailer::new(1, 7090 * 10, 36).check_consistency());
    }
}
