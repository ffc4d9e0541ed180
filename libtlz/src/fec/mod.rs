//! Forward-error-correction sidecars: a packetized file of per-block
//! CRCs and Reed-Solomon redundancy that can detect and repair damaged
//! blocks of a protected file.

pub mod gf16;
pub mod gf8;
mod packet;

pub use packet::{
    build_chksum_packet, build_fec_packet, isvalid_fbs, CheckImage, ChksumPacket, FecPacket,
    CHKSUM_MAGIC, FEC_PACKET_MAGIC, FEC_VERSION,
};

use std::fs::File;
use std::ops::Range;
use std::path::Path;

use md5::{Digest, Md5};

use crate::io::{Block, CRC32, CRC32C};
use crate::{Error, Result};
use gf16::MAX_K16;
use gf8::MAX_K8;
use packet::{ceil_divide, FEC_MAGIC_BYTE};

/// Backing storage of a sidecar or protected file: a read-only map when
/// possible, an owned buffer otherwise.
pub enum FecData {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl std::ops::Deref for FecData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FecData::Mapped(map) => map,
            FecData::Owned(vec) => vec,
        }
    }
}

impl FecData {
    /// Map `path` read-only, falling back to reading it whole.
    pub fn open(path: &Path) -> Result<FecData> {
        let file = File::open(path)?;
        // Safety: the map is read-only and private; concurrent writers
        // would at worst corrupt the data being checked.
        match unsafe { memmap2::Mmap::map(&file) } {
            Ok(map) => Ok(FecData::Mapped(map)),
            Err(_) => Ok(FecData::Owned(std::fs::read(path)?)),
        }
    }
}

fn md5_of(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn max_k(gf16: bool) -> usize {
    if gf16 {
        MAX_K16
    } else {
        MAX_K8
    }
}

/// Parsed view of a sidecar file: the CRC arrays of the chksum packets
/// and the fec blocks of the fec packets, cross-checked for agreement.
pub struct FecIndex {
    data: FecData,
    crc_array: Option<Vec<u32>>,
    crcc_array: Option<Vec<u32>>,
    /// `(fec_block_number, byte range of the block inside data)`.
    fec_blocks: Vec<(u32, Range<usize>)>,
    fec_net_size: u64,
    fec_block_size: u64,
    prodata_size: u64,
    prodata_md5: [u8; 16],
    gf16: bool,
    is_lz: bool,
}

impl FecIndex {
    pub fn open(path: &Path, ignore_errors: bool, is_lz: bool) -> Result<FecIndex> {
        FecIndex::from_data(FecData::open(path)?, ignore_errors, is_lz)
    }

    pub fn from_bytes(bytes: Vec<u8>, ignore_errors: bool, is_lz: bool) -> Result<FecIndex> {
        FecIndex::from_data(FecData::Owned(bytes), ignore_errors, is_lz)
    }

    fn from_data(data: FecData, ignore_errors: bool, is_lz: bool) -> Result<FecIndex> {
        let err = |msg: &str| Err(Error::Corrupt(msg.into()));
        if data.is_empty() {
            return err("Fec file is empty.");
        }
        if !ignore_errors
            && data.len() >= 8
            && data[..8] != CHKSUM_MAGIC
            && data[..8] != FEC_PACKET_MAGIC
        {
            return err("Bad magic number (file is not fec data).");
        }
        if data.len() < ChksumPacket::min_packet_size() {
            return err("Fec file is too short.");
        }
        if data[..8] == CHKSUM_MAGIC && !ChksumPacket::check_version(&data) {
            return Err(Error::Corrupt(format!(
                "Version {} fec format not supported.",
                ChksumPacket::version(&data)
            )));
        }

        let mut index = FecIndex {
            data,
            crc_array: None,
            crcc_array: None,
            fec_blocks: Vec::new(),
            fec_net_size: 0,
            fec_block_size: 0,
            prodata_size: 0,
            prodata_md5: [0; 16],
            gf16: false,
            is_lz,
        };

        /* Parse packets. pos usually points to a packet header, except
        when skipping a corrupt packet. */
        let mut pos = 0usize;
        while pos < index.data.len() {
            match ChksumPacket::check_image(&index.data[pos..], max_k) {
                CheckImage::Size(size) => {
                    index.parse_chksum_packet(pos, ignore_errors)?;
                    index.fec_net_size += size as u64;
                    pos += size;
                    continue;
                }
                CheckImage::WrongSize if !ignore_errors => {
                    return err("Wrong size in chksum packet.")
                }
                CheckImage::WrongCrc if !ignore_errors => {
                    return err("Wrong CRC in chksum packet.")
                }
                CheckImage::WrongSize | CheckImage::WrongCrc => {
                    pos += 1;
                    continue;
                }
                CheckImage::NotHere => {}
            }
            match FecPacket::check_image(&index.data[pos..]) {
                CheckImage::Size(size) => {
                    let packet = FecPacket::new(&index.data[pos..pos + size]);
                    let fbs = packet.fec_block_size();
                    if !isvalid_fbs(index.fec_block_size) {
                        index.fec_block_size = fbs;
                    } else if index.fec_block_size != fbs {
                        return err("Contradictory fec_block_size in fec packet.");
                    }
                    let start = pos + packet::FEC_HEADER_SIZE;
                    index
                        .fec_blocks
                        .push((packet.fec_block_number(), start..start + fbs as usize));
                    index.fec_net_size += size as u64;
                    pos += size;
                    continue;
                }
                CheckImage::WrongSize if !ignore_errors => {
                    return err("Wrong size in fec packet.")
                }
                CheckImage::WrongCrc if !ignore_errors => return err("Wrong CRC in fec packet."),
                CheckImage::WrongSize | CheckImage::WrongCrc => {
                    pos += 1;
                    continue;
                }
                CheckImage::NotHere => {}
            }
            if ignore_errors {
                // step past unrecognized bytes to the next packet magic
                pos += 1;
                while pos < index.data.len() && index.data[pos] != FEC_MAGIC_BYTE {
                    pos += 1;
                }
                continue;
            }
            return err("Unknown packet type in fec file.");
        }

        if index.prodata_size == 0 {
            return err("No valid chksum packets found.");
        }
        if index.fec_blocks.is_empty() && !ignore_errors {
            return err("No valid fec packets found.");
        }
        if !index.has_array() && !ignore_errors {
            return err("No valid CRC arrays found.");
        }
        if index.fec_blocks.len() as u64 > index.prodata_blocks() {
            return err("Too many fec packets found. (More than data blocks)");
        }
        if !isvalid_fbs(index.fec_block_size) {
            return Err(Error::Internal("fec_block_size not found."));
        }
        // every fec_block_number must be in range and distinct
        let limit = max_k(index.gf16);
        let mut seen = vec![false; limit];
        for (fbn, _) in &index.fec_blocks {
            let fbn = *fbn as usize;
            if fbn >= limit {
                return err("Invalid fec_block_number in fec packet.");
            }
            if seen[fbn] {
                return err("Same fec_block_number in two fec packets.");
            }
            seen[fbn] = true;
        }
        Ok(index)
    }

    fn parse_chksum_packet(&mut self, pos: usize, ignore_errors: bool) -> Result<()> {
        let err = |msg: &str| Err(Error::Corrupt(msg.into()));
        let packet = ChksumPacket::new(&self.data[pos..]);
        if self.prodata_size == 0 {
            // first chksum packet
            self.prodata_size = packet.prodata_size();
            self.prodata_md5 = packet.prodata_md5();
            self.gf16 = packet.gf16();
        } else {
            if self.prodata_size != packet.prodata_size() {
                return err("Contradictory protected data size in chksum packet.");
            }
            if self.prodata_md5 != packet.prodata_md5() {
                return err("Contradictory protected data MD5 in chksum packet.");
            }
            if self.gf16 != packet.gf16() {
                return err("Contradictory Galois Field size in chksum packet.");
            }
        }
        if !isvalid_fbs(self.fec_block_size) {
            self.fec_block_size = packet.fec_block_size();
        } else if self.fec_block_size != packet.fec_block_size() {
            return err("Contradictory fec_block_size in chksum packet.");
        }
        if !packet.check_payload_crc() {
            // corrupt array
            if ignore_errors {
                return Ok(());
            }
            return err("Corrupt CRC array in chksum packet.");
        }
        if !packet.is_crc_c() {
            if self.crc_array.is_none() {
                self.crc_array = Some(packet.crc_array());
            } else {
                return err("More than one CRC32 array found.");
            }
        } else if self.crcc_array.is_none() {
            self.crcc_array = Some(packet.crc_array());
        } else {
            return err("More than one CRC32-C array found.");
        }
        Ok(())
    }

    pub fn fec_block_size(&self) -> u64 {
        self.fec_block_size
    }

    pub fn fec_blocks(&self) -> usize {
        self.fec_blocks.len()
    }

    pub fn fec_bytes(&self) -> u64 {
        self.fec_blocks() as u64 * self.fec_block_size
    }

    pub fn fec_net_size(&self) -> u64 {
        self.fec_net_size
    }

    pub fn fec_block(&self, i: usize) -> &[u8] {
        &self.data[self.fec_blocks[i].1.clone()]
    }

    pub fn fbn(&self, i: usize) -> u32 {
        self.fec_blocks[i].0
    }

    pub fn gf16(&self) -> bool {
        self.gf16
    }

    pub fn is_lz(&self) -> bool {
        self.is_lz
    }

    pub fn prodata_size(&self) -> u64 {
        self.prodata_size
    }

    pub fn prodata_md5(&self) -> [u8; 16] {
        self.prodata_md5
    }

    pub fn prodata_blocks(&self) -> u64 {
        ceil_divide(self.prodata_size, self.fec_block_size)
    }

    pub fn has_array(&self) -> bool {
        self.crc_array.is_some() || self.crcc_array.is_some()
    }

    pub fn crc_array(&self) -> Option<&[u32]> {
        self.crc_array.as_deref()
    }

    pub fn crcc_array(&self) -> Option<&[u32]> {
        self.crcc_array.as_deref()
    }

    pub fn block_pos(&self, i: u64) -> u64 {
        i * self.fec_block_size
    }

    pub fn block_size(&self, i: u64) -> u64 {
        let pos = i * self.fec_block_size;
        if pos >= self.prodata_size {
            return 0;
        }
        self.fec_block_size.min(self.prodata_size - pos)
    }

    pub fn block_end(&self, i: u64) -> u64 {
        ((i + 1) * self.fec_block_size).min(self.prodata_size)
    }
}

/// The protected-data blocks whose stored CRC does not match, in
/// ascending order.
pub struct BadBlockIndex {
    bb_vector: Vec<u32>,
}

impl BadBlockIndex {
    /// Scan `prodata` (possibly truncated) against the index's CRC
    /// arrays, or against the bursted-block heuristic for lzip files
    /// without arrays. Also computes the whole-file MD5 when the file
    /// is complete.
    pub fn find(index: &FecIndex, prodata: &[u8]) -> (BadBlockIndex, Option<[u8; 16]>) {
        let mut bb_vector = Vec::new();
        let prodata_blocks = index.prodata_blocks();
        let fbs = index.fec_block_size;
        let full = prodata.len() as u64 >= index.prodata_size;
        let available_blocks = if full {
            prodata_blocks
        } else {
            prodata.len() as u64 / fbs
        };
        let blocks = available_blocks.min(prodata_blocks);
        let mut md5 = Md5::new();
        for i in 0..blocks {
            let pos = index.block_pos(i) as usize;
            let size = index.block_size(i) as usize;
            let block = &prodata[pos..pos + size];
            if full {
                md5.update(block);
            }
            if index.has_array() {
                let bad = index
                    .crc_array()
                    .is_some_and(|a| a[i as usize] != CRC32.checksum(block))
                    || index
                        .crcc_array()
                        .is_some_and(|a| a[i as usize] != CRC32C.checksum(block));
                if bad {
                    bb_vector.push(i as u32);
                }
            } else if index.is_lz && bursted_data_block(index, prodata, i) {
                bb_vector.push(i as u32);
            }
        }
        for i in blocks..prodata_blocks {
            // truncated file
            bb_vector.push(i as u32);
        }
        let digest: Option<[u8; 16]> = full.then(|| md5.finalize().into());
        (BadBlockIndex { bb_vector }, digest)
    }

    /// Mark the blocks covered by non-overlapping clusters of
    /// `cluster_size` blocks each.
    pub fn from_clusters(index: &FecIndex, clusters: &[u32], cluster_size: u32) -> BadBlockIndex {
        let blocks = index.prodata_blocks() as u32;
        let mut bb_vector = Vec::new();
        for &idx in clusters {
            for j in 0..cluster_size {
                if idx + j < blocks {
                    bb_vector.push(idx + j);
                }
            }
        }
        BadBlockIndex { bb_vector }
    }

    /// Mark the blocks overlapping the byte ranges given. Ranges must be
    /// sorted and must not overlap.
    pub fn from_ranges(index: &FecIndex, ranges: &[Block]) -> BadBlockIndex {
        let fbs = index.fec_block_size;
        let blocks = index.prodata_blocks();
        let mut bb_vector: Vec<u32> = Vec::new();
        for range in ranges {
            if range.size() == 0 {
                continue;
            }
            let mut i1 = range.pos() / fbs;
            let i2 = (range.end() - 1) / fbs;
            if let Some(&last) = bb_vector.last() {
                i1 = i1.max(u64::from(last) + 1);
            }
            while i1 <= i2 && i1 < blocks {
                bb_vector.push(i1 as u32);
                i1 += 1;
            }
        }
        BadBlockIndex { bb_vector }
    }

    pub fn bad_blocks(&self) -> usize {
        self.bb_vector.len()
    }

    pub fn bb_vector(&self) -> &[u32] {
        &self.bb_vector
    }

    pub fn first_bad_pos(&self, index: &FecIndex) -> u64 {
        self.bb_vector
            .first()
            .map_or(0, |&b| index.block_pos(u64::from(b)))
    }

    pub fn last_bad_pos(&self, index: &FecIndex) -> u64 {
        self.bb_vector
            .last()
            .map_or(0, |&b| index.block_end(u64::from(b)) - 1)
    }
}

/// Detect bursts of identical bytes in an lzip protected file: a run of
/// 8 or more identical bytes over a slightly widened block window.
fn bursted_data_block(index: &FecIndex, prodata: &[u8], i: u64) -> bool {
    const MINLEN: usize = 8; // min number of consecutive identical bytes
    let mut pos = index.block_pos(i) as usize;
    pos = pos.saturating_sub(MINLEN / 2);
    let end = (index.block_end(i) as usize + MINLEN / 2).min(prodata.len());
    let mut count = 0;
    for j in pos + 1..end {
        if prodata[j] != prodata[j - 1] {
            count = 0;
        } else {
            count += 1;
            if count >= MINLEN - 1 {
                return true;
            }
        }
    }
    false
}

/// Zero-padded copy of the (possibly truncated) final protected block,
/// or None when the last block is exactly full.
fn set_lastbuf(prodata: &[u8], prodata_size: u64, fbs: u64) -> Option<Vec<u8>> {
    let rem = prodata_size % fbs;
    if rem == 0 {
        return None;
    }
    let start = (prodata_size - rem) as usize;
    let mut lastbuf = vec![0u8; fbs as usize];
    let available = prodata.len().saturating_sub(start);
    let take = available.min(rem as usize);
    lastbuf[..take].copy_from_slice(&prodata[start..start + take]);
    Some(lastbuf)
}

/// Reconstruct the bad blocks from the sidecar's fec blocks. Returns a
/// buffer holding the repaired blocks in `bb_vector` order, or None if
/// there is not enough redundancy.
pub fn repair_prodata(
    index: &FecIndex,
    bb_index: &BadBlockIndex,
    prodata: &[u8],
) -> Result<Option<Vec<u8>>> {
    let bad_blocks = bb_index.bad_blocks();
    if bad_blocks == 0 {
        return Ok(None); // nothing to repair
    }
    if bad_blocks > index.fec_blocks() {
        return Ok(None); // not enough fec blocks
    }
    let fbs = index.fec_block_size as usize;
    // copy fec blocks into fecbuf where reduction will be performed
    let mut fecbuf = vec![0u8; bad_blocks * fbs];
    let mut fbn_vector = Vec::with_capacity(bad_blocks);
    for bi in 0..bad_blocks {
        fbn_vector.push(index.fbn(bi));
        fecbuf[bi * fbs..(bi + 1) * fbs].copy_from_slice(index.fec_block(bi));
    }
    let prodata_blocks = index.prodata_blocks() as usize;
    let lastbuf = set_lastbuf(prodata, index.prodata_size, index.fec_block_size);
    let mut dstbuf = vec![0u8; bad_blocks * fbs];
    if index.gf16() {
        gf16::rs16_decode(
            prodata,
            lastbuf.as_deref(),
            bb_index.bb_vector(),
            &fbn_vector,
            &mut fecbuf,
            &mut dstbuf,
            fbs,
            prodata_blocks,
        )?;
    } else {
        gf8::rs8_decode(
            prodata,
            lastbuf.as_deref(),
            bb_index.bb_vector(),
            &fbn_vector,
            &mut fecbuf,
            &mut dstbuf,
            fbs,
            prodata_blocks,
        )?;
    }
    Ok(Some(dstbuf))
}

/// Verify a proposed repair by recomputing the whole-file MD5 with the
/// repaired blocks substituted in.
pub fn check_repair_md5(
    prodata: &[u8],
    dstbuf: &[u8],
    bb_vector: &[u32],
    prodata_size: u64,
    fbs: u64,
    digest: [u8; 16],
) -> bool {
    let prodata_blocks = ceil_divide(prodata_size, fbs);
    let mut md5 = Md5::new();
    let mut bi = 0usize;
    for col in 0..prodata_blocks {
        let src_range;
        let from_dst;
        if bi < bb_vector.len() && col == u64::from(bb_vector[bi]) {
            src_range = bi as u64 * fbs; // repaired block
            from_dst = true;
            bi += 1;
        } else {
            src_range = col * fbs; // good block
            from_dst = false;
        }
        let size = if col < prodata_blocks - 1 {
            fbs
        } else {
            (prodata_size - 1) % fbs + 1
        };
        let start = src_range as usize;
        let block = if from_dst {
            &dstbuf[start..start + size as usize]
        } else {
            &prodata[start..start + size as usize]
        };
        md5.update(block);
    }
    let new_digest: [u8; 16] = md5.finalize().into();
    digest == new_digest
}

/// Write the repaired protected file: good blocks from `prodata`,
/// repaired blocks from `dstbuf`.
pub fn compose_repaired(
    prodata: &[u8],
    dstbuf: &[u8],
    bb_vector: &[u32],
    prodata_size: u64,
    fbs: u64,
) -> Vec<u8> {
    let prodata_blocks = ceil_divide(prodata_size, fbs);
    let mut out = Vec::with_capacity(prodata_size as usize);
    let mut bi = 0usize;
    for col in 0..prodata_blocks {
        let size = if col < prodata_blocks - 1 {
            fbs as usize
        } else {
            ((prodata_size - 1) % fbs + 1) as usize
        };
        if bi < bb_vector.len() && col == u64::from(bb_vector[bi]) {
            let start = bi * fbs as usize;
            out.extend_from_slice(&dstbuf[start..start + size]);
            bi += 1;
        } else {
            let start = (col * fbs) as usize;
            out.extend_from_slice(&prodata[start..start + size]);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// All blocks check out; nothing to do.
    Good,
    /// The repaired file was produced and verified by MD5.
    Repaired,
    /// More damaged blocks than fec blocks.
    TooManyErrors { bad_blocks: usize, fec_blocks: usize },
    /// The RS reconstruction did not match the stored MD5.
    VerifyFailed,
}

/// Test, and optionally repair, a protected file against its sidecar.
/// On `Repaired`, returns the full repaired file contents.
pub fn fec_repair(index: &FecIndex, prodata: &[u8]) -> Result<(RepairOutcome, Option<Vec<u8>>)> {
    let (bb_index, computed_md5) = BadBlockIndex::find(index, prodata);
    if bb_index.bad_blocks() == 0 {
        if computed_md5 == Some(index.prodata_md5()) {
            return Ok((RepairOutcome::Good, None));
        }
        // an undetected mismatch without bad blocks cannot be repaired
        if !index.is_lz() || index.has_array() {
            return Ok((RepairOutcome::VerifyFailed, None));
        }
    }
    if bb_index.bad_blocks() > index.fec_blocks() {
        return Ok((
            RepairOutcome::TooManyErrors {
                bad_blocks: bb_index.bad_blocks(),
                fec_blocks: index.fec_blocks(),
            },
            None,
        ));
    }
    let dstbuf = match repair_prodata(index, &bb_index, prodata)? {
        Some(buf) => buf,
        None => return Ok((RepairOutcome::VerifyFailed, None)),
    };
    if !check_repair_md5(
        prodata,
        &dstbuf,
        bb_index.bb_vector(),
        index.prodata_size(),
        index.fec_block_size(),
        index.prodata_md5(),
    ) {
        return Ok((RepairOutcome::VerifyFailed, None));
    }
    let repaired = compose_repaired(
        prodata,
        &dstbuf,
        bb_index.bb_vector(),
        index.prodata_size(),
        index.fec_block_size(),
    );
    Ok((RepairOutcome::Repaired, Some(repaired)))
}

#[derive(Debug, Clone)]
pub struct FecCreateOptions {
    pub fec_block_size: u64,
    /// Number of fec blocks (redundancy) to generate.
    pub fec_blocks: usize,
    /// Emit a CRC32 array packet.
    pub crc32: bool,
    /// Emit a CRC32-C array packet.
    pub crc32c: bool,
}

impl Default for FecCreateOptions {
    fn default() -> FecCreateOptions {
        FecCreateOptions {
            fec_block_size: 4096,
            fec_blocks: 4,
            crc32: false,
            crc32c: true,
        }
    }
}

/// Create a sidecar protecting `prodata`. GF(2^16) is selected
/// automatically when the file has more than 128 blocks.
pub fn fec_create(prodata: &[u8], opts: &FecCreateOptions) -> Result<Vec<u8>> {
    let fbs = opts.fec_block_size;
    if !isvalid_fbs(fbs) {
        return Err(Error::Invalid(format!("Invalid fec block size {}.", fbs)));
    }
    if prodata.is_empty() {
        return Err(Error::Invalid("Can't protect an empty file.".into()));
    }
    if !opts.crc32 && !opts.crc32c {
        return Err(Error::Invalid("At least one CRC array is required.".into()));
    }
    let prodata_size = prodata.len() as u64;
    let blocks = ceil_divide(prodata_size, fbs);
    let gf16 = blocks as usize > MAX_K8;
    if blocks as usize > max_k(gf16) {
        return Err(Error::Invalid(format!(
            "Too many data blocks ({}); use a larger fec block size.",
            blocks
        )));
    }
    let fec_blocks = opts.fec_blocks.clamp(1, blocks as usize);
    let md5 = md5_of(prodata);

    let mut out = Vec::new();
    if opts.crc32 {
        let array: Vec<u32> = (0..blocks)
            .map(|i| {
                let pos = (i * fbs) as usize;
                let size = fbs.min(prodata_size - i * fbs) as usize;
                CRC32.checksum(&prodata[pos..pos + size])
            })
            .collect();
        out.extend_from_slice(&build_chksum_packet(
            prodata_size,
            md5,
            fbs,
            gf16,
            false,
            &array,
        ));
    }
    if opts.crc32c {
        let array: Vec<u32> = (0..blocks)
            .map(|i| {
                let pos = (i * fbs) as usize;
                let size = fbs.min(prodata_size - i * fbs) as usize;
                CRC32C.checksum(&prodata[pos..pos + size])
            })
            .collect();
        out.extend_from_slice(&build_chksum_packet(
            prodata_size,
            md5,
            fbs,
            gf16,
            true,
            &array,
        ));
    }

    let lastbuf = set_lastbuf(prodata, prodata_size, fbs);
    let mut fec_block = vec![0u8; fbs as usize];
    for fbn in 0..fec_blocks as u32 {
        if gf16 {
            gf16::rs16_encode(
                prodata,
                lastbuf.as_deref(),
                &mut fec_block,
                fbs as usize,
                fbn,
                blocks as usize,
            );
        } else {
            gf8::rs8_encode(
                prodata,
                lastbuf.as_deref(),
                &mut fec_block,
                fbs as usize,
                fbn,
                blocks as usize,
            );
        }
        out.extend_from_slice(&build_fec_packet(fbn, &fec_block));
    }
    Ok(out)
}

/// Counters of a coverage analysis run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoverageStats {
    pub combinations: u64,
    pub successes: u64,
    pub failed_comparisons: u64,
}

/// Enumerate combinations of `cblocks` contiguous clusters of damage and
/// attempt a repair for each, without writing output.
pub fn coverage_clusters(
    index: &FecIndex,
    prodata: &[u8],
    cblocks: u32,
) -> Result<CoverageStats> {
    let fec_blocks = index.fec_blocks() as u32;
    if cblocks == 0 || cblocks > fec_blocks {
        return Err(Error::Invalid("Not so many blocks in fec data.".into()));
    }
    let computed_md5 = md5_of(prodata);
    if computed_md5 != index.prodata_md5() {
        return Err(Error::Corrupt(
            "MD5 mismatch between protected data and fec data.".into(),
        ));
    }
    let cluster_size = fec_blocks / cblocks;
    let prodata_blocks = index.prodata_blocks() as u32;
    let last_pos = prodata_blocks - (prodata_blocks - 1) % cluster_size - 1;
    let mut stats = CoverageStats::default();
    let mut pos_vector: Vec<u32> = (0..cblocks).map(|i| i * cluster_size).collect();
    loop {
        stats.combinations += 1;
        let bb_index = BadBlockIndex::from_clusters(index, &pos_vector, cluster_size);
        if let Some(dstbuf) = repair_prodata(index, &bb_index, prodata)? {
            stats.successes += 1;
            if !check_repair_md5(
                prodata,
                &dstbuf,
                bb_index.bb_vector(),
                index.prodata_size(),
                index.fec_block_size(),
                computed_md5,
            ) {
                stats.failed_comparisons += 1;
            }
        }
        // advance to the next cluster combination
        let mut pos_limit = last_pos;
        let mut i = cblocks as i64 - 1;
        while i >= 0 {
            let iu = i as usize;
            if pos_vector[iu] + cluster_size > pos_limit {
                pos_limit = pos_limit.saturating_sub(cluster_size);
                i -= 1;
                continue;
            }
            pos_vector[iu] += cluster_size;
            for j in iu..cblocks as usize - 1 {
                pos_vector[j + 1] = pos_vector[j] + cluster_size;
            }
            break;
        }
        if i < 0 {
            break;
        }
    }
    Ok(stats)
}

/// Slide a damage window of `sector_size` bytes over the protected data
/// in steps of `delta`, attempting a repair at each position.
pub fn coverage_sliding(
    index: &FecIndex,
    prodata: &[u8],
    mut delta: u64,
    mut sector_size: u64,
) -> Result<CoverageStats> {
    let prodata_size = index.prodata_size();
    sector_size = sector_size.clamp(1, prodata_size);
    delta = delta.clamp(1, prodata_size);
    let computed_md5 = md5_of(prodata);
    if computed_md5 != index.prodata_md5() {
        return Err(Error::Corrupt(
            "MD5 mismatch between protected data and fec data.".into(),
        ));
    }
    let last_pos = prodata_size - (prodata_size - 1) % sector_size - 1;
    let mut stats = CoverageStats::default();
    let mut pos = 0u64;
    while pos <= last_pos {
        let damaged_size = sector_size.min(prodata_size - pos);
        stats.combinations += 1;
        let bb_index =
            BadBlockIndex::from_ranges(index, &[Block::new(pos, damaged_size)]);
        if let Some(dstbuf) = repair_prodata(index, &bb_index, prodata)? {
            stats.successes += 1;
            if !check_repair_md5(
                prodata,
                &dstbuf,
                bb_index.bb_vector(),
                index.prodata_size(),
                index.fec_block_size(),
                computed_md5,
            ) {
                stats.failed_comparisons += 1;
            }
        }
        pos += delta;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lcg(u32);

    impl Lcg {
        fn next_u8(&mut self) -> u8 {
            self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
            (self.0 >> 16) as u8
        }
    }

    fn test_data(len: usize) -> Vec<u8> {
        let mut rng = Lcg(0xBADC0FFE);
        (0..len).map(|_| rng.next_u8()).collect()
    }

    #[test]
    fn single_block_repair() {
        // 1 MiB protected file, fec block size 4096, 4 fec packets
        let data = test_data(1 << 20);
        let sidecar = fec_create(
            &data,
            &FecCreateOptions {
                fec_block_size: 4096,
                fec_blocks: 4,
                crc32: false,
                crc32c: true,
            },
        )
        .unwrap();
        let index = FecIndex::from_bytes(sidecar, false, false).unwrap();
        assert!(index.gf16()); // 256 blocks need GF(2^16)
        assert_eq!(index.fec_blocks(), 4);

        let mut damaged = data.clone();
        damaged[123_456] ^= 0x40; // flip one arbitrary byte
        let (bb, _) = BadBlockIndex::find(&index, &damaged);
        assert_eq!(bb.bad_blocks(), 1);
        assert_eq!(bb.bb_vector()[0], 123_456 / 4096);

        let (outcome, repaired) = fec_repair(&index, &damaged).unwrap();
        assert_eq!(outcome, RepairOutcome::Repaired);
        assert_eq!(repaired.unwrap(), data);
    }

    #[test]
    fn multi_block_repair_with_partial_last_block() {
        let data = test_data(100_000); // not a multiple of the block size
        let sidecar = fec_create(
            &data,
            &FecCreateOptions {
                fec_block_size: 1024,
                fec_blocks: 8,
                crc32: true,
                crc32c: true,
            },
        )
        .unwrap();
        let index = FecIndex::from_bytes(sidecar, false, false).unwrap();
        assert!(index.crc_array().is_some());
        assert!(index.crcc_array().is_some());

        let mut damaged = data.clone();
        damaged[0] ^= 1;
        damaged[50_000] ^= 2;
        damaged[99_999] ^= 4; // damage inside the partial last block
        let (outcome, repaired) = fec_repair(&index, &damaged).unwrap();
        assert_eq!(outcome, RepairOutcome::Repaired);
        assert_eq!(repaired.unwrap(), data);
    }

    #[test]
    fn too_many_bad_blocks_cannot_repair() {
        let data = test_data(64 * 1024);
        let sidecar = fec_create(
            &data,
            &FecCreateOptions {
                fec_block_size: 1024,
                fec_blocks: 2,
                crc32: false,
                crc32c: true,
            },
        )
        .unwrap();
        let index = FecIndex::from_bytes(sidecar, false, false).unwrap();
        let mut damaged = data.clone();
        damaged[0] ^= 1;
        damaged[10_000] ^= 1;
        damaged[30_000] ^= 1;
        let (outcome, _) = fec_repair(&index, &damaged).unwrap();
        match outcome {
            RepairOutcome::TooManyErrors {
                bad_blocks,
                fec_blocks,
            } => {
                assert_eq!(bad_blocks, 3);
                assert_eq!(fec_blocks, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn undamaged_file_checks_good() {
        let data = test_data(10_000);
        let sidecar = fec_create(&data, &FecCreateOptions::default()).unwrap();
        let index = FecIndex::from_bytes(sidecar, false, false).unwrap();
        let (outcome, _) = fec_repair(&index, &data).unwrap();
        assert_eq!(outcome, RepairOutcome::Good);
    }

    #[test]
    fn truncated_file_blocks_count_as_bad() {
        let data = test_data(32 * 1024);
        let sidecar = fec_create(
            &data,
            &FecCreateOptions {
                fec_block_size: 4096,
                fec_blocks: 4,
                crc32: false,
                crc32c: true,
            },
        )
        .unwrap();
        let index = FecIndex::from_bytes(sidecar, false, false).unwrap();
        let truncated = &data[..20 * 1024]; // lost 3 of 8 blocks
        let (bb, md5) = BadBlockIndex::find(&index, truncated);
        assert_eq!(bb.bad_blocks(), 3);
        assert!(md5.is_none());
        let (outcome, repaired) = fec_repair(&index, truncated).unwrap();
        assert_eq!(outcome, RepairOutcome::Repaired);
        assert_eq!(repaired.unwrap(), data);
    }

    #[test]
    fn contradictory_packets_are_fatal() {
        let data = test_data(8 * 1024);
        let mut sidecar = fec_create(&data, &FecCreateOptions::default()).unwrap();
        let mut second = fec_create(&data[..4096], &FecCreateOptions::default()).unwrap();
        sidecar.append(&mut second);
        match FecIndex::from_bytes(sidecar, false, false) {
            Err(Error::Corrupt(msg)) => assert!(msg.contains("Contradictory")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn corrupt_packet_skipped_with_ignore_errors() {
        let data = test_data(8 * 1024);
        let sidecar = fec_create(&data, &FecCreateOptions::default()).unwrap();
        let mut corrupt = b"garbage ".to_vec();
        corrupt.extend_from_slice(&sidecar);
        // without ignore_errors the leading garbage is fatal
        assert!(FecIndex::from_bytes(corrupt.clone(), false, false).is_err());
        let index = FecIndex::from_bytes(corrupt, true, false).unwrap();
        assert_eq!(index.prodata_size(), 8 * 1024);
        assert_eq!(index.fec_blocks(), 4);
    }

    #[test]
    fn bursted_block_heuristic_for_lz_files() {
        let mut data = test_data(8 * 1024);
        let mut sidecar = fec_create(
            &data,
            &FecCreateOptions {
                fec_block_size: 1024,
                fec_blocks: 2,
                crc32: false,
                crc32c: true,
            },
        )
        .unwrap();
        // corrupt the CRC array; with ignore_errors the chksum header is
        // still used but the array is dropped
        sidecar[52] ^= 0xFF;
        assert!(FecIndex::from_bytes(sidecar.clone(), false, true).is_err());
        let index = FecIndex::from_bytes(sidecar, true, true).unwrap();
        assert!(!index.has_array());

        // no long runs: no bad blocks detected
        let (bb, _) = BadBlockIndex::find(&index, &data);
        assert_eq!(bb.bad_blocks(), 0);
        // a burst of identical bytes marks its block bad
        for b in data[2000..2010].iter_mut() {
            *b = 0xEE;
        }
        let (bb, _) = BadBlockIndex::find(&index, &data);
        assert_eq!(bb.bb_vector(), [1]);
    }

    #[test]
    fn coverage_single_cluster_all_pass() {
        let data = test_data(16 * 1024);
        let sidecar = fec_create(
            &data,
            &FecCreateOptions {
                fec_block_size: 4096,
                fec_blocks: 2,
                crc32: false,
                crc32c: true,
            },
        )
        .unwrap();
        let index = FecIndex::from_bytes(sidecar, false, false).unwrap();
        let stats = coverage_clusters(&index, &data, 1).unwrap();
        assert!(stats.combinations >= 2);
        assert_eq!(stats.successes, stats.combinations);
        assert_eq!(stats.failed_comparisons, 0);

        let stats = coverage_sliding(&index, &data, 4096, 4096).unwrap();
        assert_eq!(stats.successes, stats.combinations);
        assert_eq!(stats.failed_comparisons, 0);
    }
}
