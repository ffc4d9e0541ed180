//! Multi-member stream index: an ordered member list built by scanning
//! backwards from EOF, tolerating one trailing databox and trailing
//! garbage.

use crate::header::{LzipHeader, MIN_MEMBER_SIZE};
use crate::io::{Block, ReadAt};
use crate::trailer::LzipTrailer;
use crate::{Error, Result};

/// Magic of the trailing-data box: 8 ASCII bytes before a u64-LE total
/// box size (both at the very end of the box).
pub const BOX_MAGIC: [u8; 8] = *b"TDATABOX";

/// Minimum size of a databox: magic + size field.
pub const MIN_BOX_SIZE: u64 = 16;

#[derive(Debug, Clone)]
struct Member {
    dblock: Block,
    mblock: Block,
    dictionary_size: u32,
}

/// Immutable index of an lzip multi-member file.
///
/// Built once from a seekable source; shared read-only across parallel
/// workers afterwards.
#[derive(Debug)]
pub struct LzipIndex {
    members: Vec<Member>,
    file_size: u64,
    dictionary_size: u32,
}

fn read_trailer<S: ReadAt + ?Sized>(source: &S, pos: u64) -> Result<LzipTrailer> {
    let mut data = [0u8; LzipTrailer::SIZE];
    if source.read_exact_at(&mut data, pos)? != LzipTrailer::SIZE {
        return Err(Error::Corrupt("Error reading member trailer".into()));
    }
    Ok(LzipTrailer::from_bytes(data))
}

fn read_header<S: ReadAt + ?Sized>(source: &S, pos: u64) -> Result<LzipHeader> {
    let mut data = [0u8; LzipHeader::SIZE];
    if source.read_exact_at(&mut data, pos)? != LzipHeader::SIZE {
        return Err(Error::Corrupt("Error reading member header".into()));
    }
    Ok(LzipHeader::from_bytes(data))
}

/// Skip trailing databoxes: while the tail parses as `TDATABOX` wrapped
/// data, move `pos` before the box. The indexer proper strips at most
/// one box, but damaged files may stack them.
fn skip_box<S: ReadAt + ?Sized>(source: &S, mut pos: u64) -> Result<u64> {
    while pos >= MIN_BOX_SIZE {
        let mut tail = [0u8; 8];
        if source.read_exact_at(&mut tail, pos - 8)? != 8 {
            return Err(Error::Corrupt("Error reading box trailer".into()));
        }
        let box_size = u64::from_le_bytes(tail);
        if box_size > pos || box_size < MIN_BOX_SIZE {
            break;
        }
        let mut bheader = [0u8; 8];
        if source.read_exact_at(&mut bheader, pos - box_size)? != 8 {
            return Err(Error::Corrupt("Error reading box header".into()));
        }
        if bheader != BOX_MAGIC {
            break;
        }
        pos -= box_size; // good box
    }
    Ok(pos)
}

impl LzipIndex {
    /// Index the members of `source`.
    ///
    /// `ignore_bad_ds` accepts members whose header codes an invalid
    /// dictionary size (used by the nonzero-repair edit).
    pub fn new<S: ReadAt + ?Sized>(source: &S, ignore_bad_ds: bool) -> Result<LzipIndex> {
        let file_size = source.size()?;
        if file_size >= LzipHeader::SIZE as u64 {
            let header = read_header(source, 0)?;
            check_full_header(&header, ignore_bad_ds)?;
        }
        if file_size < MIN_MEMBER_SIZE {
            return Err(Error::Corrupt(
                if file_size == 0 {
                    "Input file is empty."
                } else {
                    "Input file is truncated."
                }
                .into(),
            ));
        }
        if file_size > i64::MAX as u64 {
            return Err(Error::Corrupt(
                "Input file is too long (2^63 bytes or more).".into(),
            ));
        }

        let mut index = LzipIndex {
            members: Vec::new(),
            file_size,
            dictionary_size: 0,
        };

        // use skip_box as preprocessor, skip remaining trailing data
        // normally; pos always points past a member or at 0
        let mut pos = skip_box(source, file_size)?;
        while pos >= MIN_MEMBER_SIZE {
            let trailer = read_trailer(source, pos - LzipTrailer::SIZE as u64)?;
            let member_size = trailer.member_size();
            if member_size > pos || !trailer.check_consistency() {
                // bad trailer
                if index.members.is_empty() {
                    pos = index.skip_trailing_data(source, pos, ignore_bad_ds)?;
                    continue;
                }
                return Err(Error::corrupt_at(
                    "Bad trailer at pos",
                    pos - LzipTrailer::SIZE as u64,
                ));
            }
            let header = read_header(source, pos - member_size)?;
            if check_full_header(&header, ignore_bad_ds).is_err() {
                // bad header
                if index.members.is_empty() {
                    pos = index.skip_trailing_data(source, pos, ignore_bad_ds)?;
                    continue;
                }
                return Err(Error::corrupt_at("Bad header at pos", pos - member_size));
            }
            pos -= member_size; // good member
            index.push_member(&header, &trailer, pos, member_size);
        }
        if pos != 0 || index.members.is_empty() {
            return Err(Error::Corrupt("Can't create file index.".into()));
        }
        index.members.reverse();
        // assign cumulative data positions and check for overflow
        let mut dpos = 0u64;
        for member in index.members.iter_mut() {
            member.dblock.set_pos(dpos);
            dpos = match dpos.checked_add(member.dblock.size()) {
                Some(end) if end <= i64::MAX as u64 => end,
                _ => {
                    return Err(Error::Corrupt(
                        "Data in input file is too long (2^63 bytes or more).".into(),
                    ))
                }
            };
        }
        Ok(index)
    }

    fn push_member(&mut self, header: &LzipHeader, trailer: &LzipTrailer, pos: u64, msize: u64) {
        let dictionary_size = header.dictionary_size();
        if self.dictionary_size < dictionary_size {
            self.dictionary_size = dictionary_size;
        }
        self.members.push(Member {
            dblock: Block::new(0, trailer.data_size()),
            mblock: Block::new(pos, msize),
            dictionary_size,
        });
    }

    /* Scan backwards in 16 KiB windows for the last byte that could be
    the most significant byte of a member size, try the 20 bytes before
    it as a trailer, and require that the referenced header validates.
    On success push the member found and leave `pos` at its start. */
    fn skip_trailing_data<S: ReadAt + ?Sized>(
        &mut self,
        source: &S,
        pos: u64,
        ignore_bad_ds: bool,
    ) -> Result<u64> {
        if pos < MIN_MEMBER_SIZE {
            return Err(Error::Corrupt("Can't create file index.".into()));
        }
        const BLOCK_SIZE: usize = 16384;
        const BUFFER_SIZE: usize = BLOCK_SIZE + LzipTrailer::SIZE - 1 + LzipHeader::SIZE;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut bsize = (pos % BLOCK_SIZE as u64) as usize; // bytes in buffer
        if bsize <= BUFFER_SIZE - BLOCK_SIZE {
            bsize += BLOCK_SIZE;
        }
        let mut search_size = bsize; // bytes to search for trailer
        let mut rd_size = bsize; // bytes to read from file
        let mut ipos = pos - rd_size as u64; // aligned to block_size

        loop {
            if source.read_exact_at(&mut buffer[..rd_size], ipos)? != rd_size {
                return Err(Error::Corrupt("Error seeking member trailer".into()));
            }
            let max_msb = ((ipos + search_size as u64) >> 56) as u8;
            let mut i = search_size;
            while i >= LzipTrailer::SIZE {
                if buffer[i - 1] > max_msb {
                    i -= 1;
                    continue;
                }
                let tdata: [u8; 20] = buffer[i - LzipTrailer::SIZE..i].try_into().unwrap();
                let trailer = LzipTrailer::from_bytes(tdata);
                let member_size = trailer.member_size();
                if member_size == 0 {
                    // skip trailing zeros
                    while i > LzipTrailer::SIZE && buffer[i - 9] == 0 {
                        i -= 1;
                    }
                    i -= 1;
                    continue;
                }
                if member_size > ipos + i as u64 || !trailer.check_consistency() {
                    i -= 1;
                    continue;
                }
                let header = read_header(source, ipos + i as u64 - member_size)?;
                if check_full_header(&header, ignore_bad_ds).is_err() {
                    i -= 1;
                    continue;
                }
                // the bytes right after the trailer must not look like a
                // truncated or corrupt lzip header
                let mut h2 = [0u8; LzipHeader::SIZE];
                let h2len = (bsize - i).min(LzipHeader::SIZE);
                h2[..h2len].copy_from_slice(&buffer[i..i + h2len]);
                let header2 = LzipHeader::from_bytes(h2);
                if header2.check_prefix(bsize - i) {
                    return Err(Error::Corrupt(
                        if h2len < LzipHeader::SIZE {
                            "Last member in input file is truncated."
                        } else {
                            "Last member in input file is truncated or corrupt."
                        }
                        .into(),
                    ));
                }
                if h2len == LzipHeader::SIZE && header2.check_corrupt() {
                    return Err(Error::Corrupt(
                        "Corrupt header in multimember file.".into(),
                    ));
                }
                let mpos = ipos + i as u64 - member_size; // good member
                self.push_member(&header, &trailer, mpos, member_size);
                return Ok(mpos);
            }
            if ipos == 0 {
                return Err(Error::corrupt_at(
                    "Bad trailer at pos",
                    pos - LzipTrailer::SIZE as u64,
                ));
            }
            bsize = BUFFER_SIZE;
            search_size = bsize - LzipHeader::SIZE;
            rd_size = BLOCK_SIZE;
            ipos -= rd_size as u64;
            buffer.copy_within(..BUFFER_SIZE - rd_size, rd_size);
        }
    }

    pub fn members(&self) -> usize {
        self.members.len()
    }

    /// Largest dictionary size in the file.
    pub fn dictionary_size(&self) -> u32 {
        self.dictionary_size
    }

    pub fn member_dictionary_size(&self, i: usize) -> u32 {
        self.members[i].dictionary_size
    }

    /// Compressed extents of member `i`.
    pub fn mblock(&self, i: usize) -> Block {
        self.members[i].mblock
    }

    /// Uncompressed (cumulative) extents of member `i`.
    pub fn dblock(&self, i: usize) -> Block {
        self.members[i].dblock
    }

    /// Total uncompressed size.
    pub fn udata_size(&self) -> u64 {
        self.members.last().map_or(0, |m| m.dblock.end())
    }

    /// End of the last member; trailing data begins here.
    pub fn cdata_size(&self) -> u64 {
        self.members.last().map_or(0, |m| m.mblock.end())
    }

    /// Total file size including trailing data.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Whether a multimember file contains empty members.
    pub fn multi_empty(&self) -> bool {
        self.members.len() > 1 && self.members.iter().any(|m| m.dblock.size() == 0)
    }
}

fn check_full_header(header: &LzipHeader, ignore_bad_ds: bool) -> Result<()> {
    match header.verify() {
        Ok(_) => Ok(()),
        Err(Error::BadDictSize) if ignore_bad_ds => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma::compress_slice;

    fn member(data: &[u8]) -> Vec<u8> {
        compress_slice(data, 1).unwrap()
    }

    fn databox_wrap(data: &[u8]) -> Vec<u8> {
        let mut boxed = data.to_vec();
        boxed.extend_from_slice(&BOX_MAGIC);
        boxed.extend_from_slice(&(data.len() as u64 + 16).to_le_bytes());
        boxed
    }

    #[test]
    fn single_member_index() {
        let image = member(b"some data worth compressing");
        let index = LzipIndex::new(image.as_slice(), false).unwrap();
        assert_eq!(index.members(), 1);
        assert_eq!(index.mblock(0).pos(), 0);
        assert_eq!(index.mblock(0).size(), image.len() as u64);
        assert_eq!(index.dblock(0).size(), 27);
        assert_eq!(index.udata_size(), 27);
        assert_eq!(index.cdata_size(), image.len() as u64);
    }

    #[test]
    fn catenated_members_are_contiguous() {
        let a = member(b"first member");
        let b = member(b"the second member, a bit longer");
        let c = member(b"");
        let mut image = a.clone();
        image.extend_from_slice(&b);
        image.extend_from_slice(&c);
        let index = LzipIndex::new(image.as_slice(), false).unwrap();
        assert_eq!(index.members(), 3);
        for i in 0..index.members() - 1 {
            assert_eq!(index.mblock(i).end(), index.mblock(i + 1).pos());
            assert_eq!(index.dblock(i).end(), index.dblock(i + 1).pos());
        }
        assert_eq!(index.udata_size(), 12 + 31);
        assert_eq!(
            index.mblock(index.members() - 1).end(),
            image.len() as u64
        );
        assert!(index.multi_empty());
    }

    #[test]
    fn databox_is_transparent() {
        let a = member(b"payload before the box");
        let tdata = b"arbitrary trailing bytes, not starting with the magic";
        let mut image = a.clone();
        image.extend_from_slice(&databox_wrap(tdata));
        let index = LzipIndex::new(image.as_slice(), false).unwrap();
        assert_eq!(index.members(), 1);
        assert_eq!(index.cdata_size(), a.len() as u64);
        assert_eq!(index.file_size(), image.len() as u64);
    }

    #[test]
    fn trailing_garbage_is_skipped() {
        let a = member(b"good member data");
        let mut image = a.clone();
        image.extend_from_slice(b"garbage bytes that contain the letters LZIP somewhere");
        match LzipIndex::new(image.as_slice(), false) {
            Ok(index) => {
                assert_eq!(index.members(), 1);
                assert_eq!(index.mblock(0).size(), a.len() as u64);
            }
            Err(Error::Corrupt(msg)) => assert!(msg.contains("Bad trailer at pos")),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn garbage_only_fails() {
        let image = vec![0x55u8; 5000];
        assert!(LzipIndex::new(image.as_slice(), false).is_err());
        assert!(LzipIndex::new(&[][..], false).is_err());
        assert!(LzipIndex::new(&[0u8; 10][..], false).is_err());
    }

    #[test]
    fn never_indexes_a_fictitious_member() {
        // a valid member image embedded in garbage must not be found if
        // the bytes after it look like a corrupt lzip header
        let mut image = member(b"hidden");
        image.extend_from_slice(b"LZ\x00P123456"); // corrupt magic after member
        match LzipIndex::new(image.as_slice(), false) {
            Ok(index) => {
                // acceptable only if the real member was found
                assert_eq!(index.members(), 1);
            }
            Err(_) => {}
        }
    }

    #[test]
    fn multimember_with_garbage_in_middle_fails() {
        let a = member(b"first");
        let b = member(b"second");
        let mut image = a;
        image.extend_from_slice(b"XX");
        image.extend_from_slice(&b);
        let err = LzipIndex::new(image.as_slice(), false).unwrap_err();
        match err {
            Error::Corrupt(msg) => {
                assert!(msg.contains("Bad trailer") || msg.contains("Bad header"))
            }
            e => panic!("unexpected error: {}", e),
        }
    }
}
