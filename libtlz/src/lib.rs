//! # libtlz
//!
//! Core library of the `tlz` toolkit, built around the lzip container
//! format for LZMA-compressed data:
//!
//! - a bit-exact LZMA member decoder and a compatible encoder ([`lzma`]),
//! - lzip member framing ([`header`], [`trailer`]) and a multi-member
//!   stream index that tolerates trailing data and corruption ([`index`]),
//! - a POSIX pax tar layer with CRC-protected extended records ([`tar`]),
//! - parallel archive pipelines producing and consuming tar.lz archives
//!   with one tar member group per lzip member ([`archive`]),
//! - a Reed-Solomon FEC sidecar engine able to detect and repair damaged
//!   blocks of a protected file ([`fec`]),
//! - a surgical edit engine over indexed multi-member files ([`edit`]),
//! - serial whole-stream operations and byte-range decompression
//!   ([`stream`]).
//!
//! All integrity primitives are fixed by the wire formats: CRC32 (IEEE) for
//! lzip trailers and FEC arrays, CRC32-C for pax extended records and FEC
//! arrays, MD5 for whole-file verification of FEC repairs.

pub mod archive;
pub mod edit;
pub mod fec;
pub mod header;
pub mod index;
pub mod io;
pub mod lzma;
pub mod stream;
pub mod tar;
pub mod trailer;

pub use header::LzipHeader;
pub use index::LzipIndex;
pub use io::{Block, MemberList};
pub use trailer::LzipTrailer;

use std::fmt;

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the toolkit.
///
/// Every variant belongs to one of three exit classes, reported by
/// [`Error::exit_code`]: 1 for environmental failures, 2 for corrupt or
/// invalid input, 3 for internal consistency failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operating system level I/O failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The first four bytes of a member are not "LZIP".
    #[error("Bad magic number (file not in lzip format).")]
    BadMagic,

    /// The member version byte is not 1.
    #[error("Version {0} member format not supported.")]
    BadVersion(u8),

    /// The coded dictionary size is outside [4 KiB, 512 MiB].
    #[error("Invalid dictionary size in member header.")]
    BadDictSize,

    /// The first byte of the LZMA stream is not zero.
    #[error("Nonzero first LZMA byte.")]
    NonzeroFirstByte,

    /// A decoded match distance is out of range or references bytes not
    /// yet produced.
    #[error("Decoder error at pos {pos}")]
    Decoder { pos: u64 },

    /// The input ended in the middle of a member.
    #[error("File ends unexpectedly at pos {pos}")]
    UnexpectedEof { pos: u64 },

    /// A marker other than End Of Stream was found.
    #[error("Unsupported marker code '{0}'")]
    UnknownMarker(u32),

    /// The member trailer does not match the decoded data.
    #[error(transparent)]
    Trailer(#[from] TrailerMismatch),

    /// Corrupt or invalid input data, with a preformatted diagnostic.
    #[error("{0}")]
    Corrupt(String),

    /// Invalid argument or unusable input file (environmental).
    #[error("{0}")]
    Invalid(String),

    /// A worker of a parallel pipeline stopped because another worker
    /// already reported an error.
    #[error("Another worker found an error.")]
    OtherWorker,

    /// A broken invariant inside the library.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Exit class of the error: 1 environmental, 2 corrupt input,
    /// 3 internal inconsistency.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Invalid(_) => 1,
            Error::BadMagic
            | Error::BadVersion(_)
            | Error::BadDictSize
            | Error::NonzeroFirstByte
            | Error::Decoder { .. }
            | Error::UnexpectedEof { .. }
            | Error::UnknownMarker(_)
            | Error::Corrupt(_)
            | Error::OtherWorker => 2,
            Error::Trailer(_) | Error::Internal(_) => 3,
        }
    }

    pub(crate) fn corrupt_at(msg: &str, pos: u64) -> Error {
        Error::Corrupt(format!("{} {}", msg, pos))
    }
}

/// Detailed result of a failed trailer verification.
///
/// Each field holds `(stored, computed)` when that particular check failed,
/// so all three mismatches are reported separately.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrailerMismatch {
    pub truncated_at: Option<usize>,
    pub crc: Option<(u32, u32)>,
    pub data_size: Option<(u64, u64)>,
    pub member_size: Option<(u64, u64)>,
}

impl TrailerMismatch {
    pub fn any(&self) -> bool {
        self.truncated_at.is_some()
            || self.crc.is_some()
            || self.data_size.is_some()
            || self.member_size.is_some()
    }
}

impl fmt::Display for TrailerMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(size) = self.truncated_at {
            write!(
                f,
                "Trailer truncated at trailer position {}; some checks may fail.",
                size
            )?;
            sep = "\n";
        }
        if let Some((stored, computed)) = self.crc {
            write!(
                f,
                "{}CRC mismatch; stored {:08X}, computed {:08X}",
                sep, stored, computed
            )?;
            sep = "\n";
        }
        if let Some((stored, computed)) = self.data_size {
            write!(
                f,
                "{}Data size mismatch; stored {} (0x{:X}), computed {} (0x{:X})",
                sep, stored, stored, computed, computed
            )?;
            sep = "\n";
        }
        if let Some((stored, computed)) = self.member_size {
            write!(
                f,
                "{}Member size mismatch; stored {} (0x{:X}), computed {} (0x{:X})",
                sep, stored, stored, computed, computed
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for TrailerMismatch {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_three_classes() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(io.exit_code(), 1);
        assert_eq!(Error::BadMagic.exit_code(), 2);
        assert_eq!(Error::Decoder { pos: 7 }.exit_code(), 2);
        assert_eq!(Error::Internal("x").exit_code(), 3);
        let tm = TrailerMismatch {
            crc: Some((1, 2)),
            ..Default::default()
        };
        assert_eq!(Error::Trailer(tm).exit_code(), 3);
    }

    #[test]
    fn trailer_mismatch_reports_each_field() {
        let tm = TrailerMismatch {
            truncated_at: None,
            crc: Some((0xDEADBEEF, 0x12345678)),
            data_size: Some((10, 20)),
            member_size: None,
        };
        let msg = tm.to_string();
        assert!(msg.contains("CRC mismatch; stored DEADBEEF, computed 12345678"));
        assert!(msg.contains("Data size mismatch; stored 10 (0xA), computed 20 (0x14)"));
        assert!(!msg.contains("Member size"));
    }
}
