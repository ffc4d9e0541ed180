//! Surgical edits over an indexed multi-member file: dump or strip
//! members and trailing data, remove members in place, repair nonzero
//! first LZMA bytes, and append trailing data.
//!
//! Every in-place edit preserves the file timestamps and writes only
//! bytes outside the surviving member extents.

use std::fs::{File, FileTimes, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::header::LzipHeader;
use crate::index::{LzipIndex, BOX_MAGIC, MIN_BOX_SIZE};
use crate::io::{MemberList, ReadAt};
use crate::lzma::{LzDecoder, RangeDecoder};
use crate::{Error, Result};

/// Byte counters of a dump/strip operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DumpStats {
    pub copied_size: u64,
    pub copied_tsize: u64,
    pub stripped_size: u64,
    pub stripped_tsize: u64,
    pub members: u64,
    pub stripped_members: u64,
}

/// Decode a member from `source` to nowhere; true means damaged.
pub fn test_member<S: ReadAt + ?Sized>(source: &S, mpos: u64, msize: u64) -> Result<bool> {
    let mut image = vec![0u8; msize as usize];
    if source.read_exact_at(&mut image, mpos)? != image.len() {
        return Ok(true);
    }
    let mut rdec = RangeDecoder::new(&image[..]);
    let mut data = [0u8; LzipHeader::SIZE];
    if rdec.read_data(&mut data) != LzipHeader::SIZE {
        return Ok(true);
    }
    let dict_size = match LzipHeader::from_bytes(data).verify() {
        Ok(size) => size,
        Err(_) => return Ok(true),
    };
    let mut sink = std::io::sink();
    let mut decoder = LzDecoder::new(dict_size, &mut sink);
    match decoder.decode_member(&mut rdec, false) {
        Ok(()) => Ok(false),
        Err(Error::Io(e)) => Err(Error::Io(e)),
        Err(_) => Ok(true),
    }
}

fn copy_range<S: ReadAt + ?Sized, W: Write>(
    source: &S,
    pos: u64,
    size: u64,
    out: &mut W,
) -> Result<()> {
    let mut buf = vec![0u8; 65536];
    let mut done = 0u64;
    while done < size {
        let n = (buf.len() as u64).min(size - done) as usize;
        if source.read_exact_at(&mut buf[..n], pos + done)? != n {
            return Err(Error::Corrupt("Input file is truncated.".into()));
        }
        out.write_all(&buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Whether a member is selected by `member_list`, testing for damage
/// only when needed.
fn member_selected<S: ReadAt + ?Sized>(
    source: &S,
    index: &LzipIndex,
    member_list: &MemberList,
    i: usize,
) -> Result<bool> {
    let blocks = index.members() as u64;
    let mut selected = member_list.includes(i as u64, blocks);
    if !selected && member_list.empty && index.dblock(i).size() == 0 {
        selected = true;
    }
    if !selected && member_list.damaged {
        let mblock = index.mblock(i);
        selected = test_member(source, mblock.pos(), mblock.size())?;
    }
    Ok(selected)
}

/// True when the trailing data is exactly one well-formed databox.
fn trailing_is_databox<S: ReadAt + ?Sized>(source: &S, index: &LzipIndex) -> Result<bool> {
    let tpos = index.cdata_size();
    let tsize = index.file_size() - tpos;
    if tsize < MIN_BOX_SIZE {
        return Ok(false);
    }
    let mut magic = [0u8; 8];
    if source.read_exact_at(&mut magic, tpos)? != 8 || magic != BOX_MAGIC {
        return Ok(false);
    }
    let mut tail = [0u8; 8];
    if source.read_exact_at(&mut tail, index.file_size() - 8)? != 8 {
        return Ok(false);
    }
    Ok(u64::from_le_bytes(tail) == tsize)
}

/// Copy to `out` the members and trailing data selected by
/// `member_list`; with `strip`, copy everything *not* selected instead.
///
/// A dump of trailing data alone unwraps a databox, yielding the bytes
/// it was wrapped around.
pub fn dump_members<S: ReadAt + ?Sized, W: Write>(
    source: &S,
    index: &LzipIndex,
    member_list: &MemberList,
    strip: bool,
    out: &mut W,
) -> Result<DumpStats> {
    let mut stats = DumpStats::default();
    for i in 0..index.members() {
        let mblock = index.mblock(i);
        let selected = member_selected(source, index, member_list, i)?;
        if selected == !strip {
            copy_range(source, mblock.pos(), mblock.size(), out)?;
            stats.copied_size += mblock.size();
            stats.members += 1;
        } else {
            stats.stripped_size += mblock.size();
            stats.stripped_members += 1;
        }
    }
    if strip && stats.members == 0 {
        return Err(Error::Invalid("All members stripped, skipping.".into()));
    }
    let tpos = index.cdata_size();
    let trailing_size = index.file_size() - tpos;
    if member_list.tdata == !strip && trailing_size > 0 {
        let tdata_alone = !strip
            && member_list.tdata
            && !member_list.damaged
            && !member_list.empty
            && !member_list.has_ranges();
        if tdata_alone && trailing_is_databox(source, index)? {
            // "boxed tdata alone": drop the box header and trailer
            copy_range(source, tpos + 8, trailing_size - 16, out)?;
            stats.copied_tsize += trailing_size - 16;
        } else {
            copy_range(source, tpos, trailing_size, out)?;
            stats.copied_tsize += trailing_size;
        }
    } else if trailing_size > 0 {
        stats.stripped_tsize += trailing_size;
    }
    Ok(stats)
}

fn preserved_times(meta: &std::fs::Metadata) -> Option<FileTimes> {
    let accessed = meta.accessed().ok()?;
    let modified = meta.modified().ok()?;
    Some(FileTimes::new().set_accessed(accessed).set_modified(modified))
}

/// Remove the selected members (and optionally the trailing data) from
/// `path` in place: surviving pieces are copied forward over the removed
/// ones and the file is truncated. Timestamps are preserved.
pub fn remove_members(path: &Path, member_list: &MemberList) -> Result<u64> {
    let infile = File::open(path)?;
    let meta = infile.metadata()?;
    let index = LzipIndex::new(&infile, false)?;
    let outfile = OpenOptions::new().write(true).open(path)?;

    let mut stream_pos = 0u64; // first pos not yet written
    let mut removed = 0u64;
    let mut buf = vec![0u8; 65536];
    for i in 0..index.members() {
        let mblock = index.mblock(i);
        let selected = member_selected(&infile, &index, member_list, i)?;
        if selected {
            removed += 1;
            continue;
        }
        if stream_pos != mblock.pos() {
            // copy the member forward
            let mut done = 0u64;
            while done < mblock.size() {
                let n = (buf.len() as u64).min(mblock.size() - done) as usize;
                if infile.read_exact_at(&mut buf[..n], mblock.pos() + done)? != n {
                    return Err(Error::Corrupt("Input file is truncated.".into()));
                }
                write_all_at(&outfile, &buf[..n], stream_pos + done)?;
                done += n as u64;
            }
        }
        stream_pos += mblock.size();
    }
    if stream_pos == 0 {
        return Err(Error::Corrupt(
            "All members would be removed, skipping.".into(),
        ));
    }
    let trailing_size = index.file_size() - index.cdata_size();
    if trailing_size > 0 && !member_list.tdata {
        if stream_pos != index.cdata_size() {
            let mut done = 0u64;
            while done < trailing_size {
                let n = (buf.len() as u64).min(trailing_size - done) as usize;
                if infile.read_exact_at(&mut buf[..n], index.cdata_size() + done)? != n {
                    return Err(Error::Corrupt("Input file is truncated.".into()));
                }
                write_all_at(&outfile, &buf[..n], stream_pos + done)?;
                done += n as u64;
            }
        }
        stream_pos += trailing_size;
    }
    if stream_pos < index.file_size() {
        outfile.set_len(stream_pos)?;
    }
    if let Some(times) = preserved_times(&meta) {
        let _ = outfile.set_times(times);
    }
    Ok(removed)
}

fn write_all_at(file: &File, buf: &[u8], pos: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        Ok(file.write_all_at(buf, pos)?)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = file;
        f.seek(SeekFrom::Start(pos))?;
        Ok(f.write_all(buf)?)
    }
}

/// Zero the first LZMA byte of every member whose first byte is not
/// zero. The only single-byte change that can make a member
/// uncompressable while leaving its trailer consistent, so it is also
/// the only one repairable blind. Returns the number of members fixed.
pub fn nonzero_repair(path: &Path) -> Result<u64> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let meta = file.metadata()?;
    let index = LzipIndex::new(&file, true)?;

    let mut cleared = 0u64;
    let mut write_attempted = false;
    for i in 0..index.members() {
        let mpos = index.mblock(i).pos();
        let mut buf = [0u8; LzipHeader::SIZE + 1];
        if file.read_exact_at(&mut buf, mpos)? != buf.len() {
            return Err(Error::Corrupt("Error reading member header".into()));
        }
        let header = LzipHeader::from_bytes(buf[..LzipHeader::SIZE].try_into().unwrap());
        if !header.check_magic() || !header.check_version() {
            return Err(Error::Corrupt(
                "Member header became corrupt as we read it.".into(),
            ));
        }
        if buf[LzipHeader::SIZE] == 0 {
            continue;
        }
        write_attempted = true;
        write_all_at(&file, &[0u8], mpos + LzipHeader::SIZE as u64)?;
        cleared += 1;
    }
    if write_attempted {
        if let Some(times) = preserved_times(&meta) {
            let _ = file.set_times(times);
        }
    }
    Ok(cleared)
}

/// Append `data` after the last lzip member, optionally wrapped in a
/// databox so the indexer will skip it.
pub fn append_tdata(path: &Path, data: &[u8], boxed: bool) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let index = LzipIndex::new(&file, false)?;
    let end = index.file_size();
    if boxed {
        let box_size = data.len() as u64 + MIN_BOX_SIZE;
        write_all_at(&file, &BOX_MAGIC, end)?;
        write_all_at(&file, data, end + 8)?;
        write_all_at(&file, &box_size.to_le_bytes(), end + 8 + data.len() as u64)?;
    } else {
        write_all_at(&file, data, end)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma::compress_slice;

    fn member(data: &[u8]) -> Vec<u8> {
        compress_slice(data, 1).unwrap()
    }

    #[test]
    fn dump_selected_members() {
        let a = member(b"alpha");
        let b = member(b"beta");
        let c = member(b"gamma");
        let mut image = a.clone();
        image.extend_from_slice(&b);
        image.extend_from_slice(&c);
        let index = LzipIndex::new(image.as_slice(), false).unwrap();

        let mut out = Vec::new();
        let stats = dump_members(
            image.as_slice(),
            &index,
            &MemberList::from_range(1, 1),
            false,
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b);
        assert_eq!(stats.members, 1);
        assert_eq!(stats.stripped_members, 2);

        // strip inverts the selection
        let mut out = Vec::new();
        dump_members(
            image.as_slice(),
            &index,
            &MemberList::from_range(1, 1),
            true,
            &mut out,
        )
        .unwrap();
        let mut expected = a.clone();
        expected.extend_from_slice(&c);
        assert_eq!(out, expected);
    }

    #[test]
    fn dump_damaged_members() {
        let a = member(b"undamaged one");
        let mut b = member(b"this one gets hurt");
        let blen = b.len();
        b[blen - 25] ^= 0xFF; // corrupt the LZMA stream, not the trailer
        let mut image = a.clone();
        image.extend_from_slice(&b);
        let index = LzipIndex::new(image.as_slice(), false).unwrap();

        let mut out = Vec::new();
        let stats = dump_members(
            image.as_slice(),
            &index,
            &MemberList::damaged_only(),
            false,
            &mut out,
        )
        .unwrap();
        assert_eq!(stats.members, 1);
        assert_eq!(out, b);
    }

    #[test]
    fn boxed_tdata_dump_unwraps() {
        let a = member(b"payload");
        let tdata = b"the boxed bytes";
        let mut image = a.clone();
        image.extend_from_slice(&BOX_MAGIC);
        image.extend_from_slice(tdata);
        image.extend_from_slice(&(tdata.len() as u64 + 16).to_le_bytes());
        let index = LzipIndex::new(image.as_slice(), false).unwrap();

        let mut out = Vec::new();
        dump_members(
            image.as_slice(),
            &index,
            &MemberList::tdata_only(),
            false,
            &mut out,
        )
        .unwrap();
        assert_eq!(out, tdata);
    }

    #[test]
    fn remove_members_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.lz");
        let a = member(b"keep me");
        let b = member(b"remove me");
        let c = member(b"keep me too");
        let mut image = a.clone();
        image.extend_from_slice(&b);
        image.extend_from_slice(&c);
        std::fs::write(&path, &image).unwrap();

        let removed = remove_members(&path, &MemberList::from_range(1, 1)).unwrap();
        assert_eq!(removed, 1);
        let result = std::fs::read(&path).unwrap();
        let mut expected = a.clone();
        expected.extend_from_slice(&c);
        assert_eq!(result, expected);
        // the surviving file still indexes cleanly
        let index = LzipIndex::new(result.as_slice(), false).unwrap();
        assert_eq!(index.members(), 2);
    }

    #[test]
    fn remove_all_members_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("single.lz");
        let image = member(b"lonely");
        std::fs::write(&path, &image).unwrap();
        assert!(remove_members(&path, &MemberList::from_range(0, 1)).is_err());
        // the file is untouched
        assert_eq!(std::fs::read(&path).unwrap(), image);
    }

    #[test]
    fn nonzero_repair_flips_only_the_marker_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.lz");
        let a = member(b"first member");
        let b = member(b"second member");
        let mut image = a.clone();
        image.extend_from_slice(&b);
        image[6] = 0x55; // first LZMA byte of member 0
        std::fs::write(&path, &image).unwrap();

        let cleared = nonzero_repair(&path).unwrap();
        assert_eq!(cleared, 1);
        let repaired = std::fs::read(&path).unwrap();
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(repaired, expected);
    }

    #[test]
    fn append_tdata_boxed_stays_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.lz");
        let a = member(b"the member");
        std::fs::write(&path, &a).unwrap();

        append_tdata(&path, b"notes about this file", true).unwrap();
        let file = File::open(&path).unwrap();
        let index = LzipIndex::new(&file, false).unwrap();
        assert_eq!(index.members(), 1);
        assert_eq!(index.cdata_size(), a.len() as u64);

        // dumping tdata alone gives back the unboxed bytes
        let mut out = Vec::new();
        dump_members(&file, &index, &MemberList::tdata_only(), false, &mut out).unwrap();
        assert_eq!(out, b"notes about this file");
    }
}
