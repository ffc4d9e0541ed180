//! Parallel archive creation: a grouper thread fills tar headers and
//! routes them to N compression workers; a muxer writes the produced
//! lzip members to the archive in strict round-robin order.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use super::{ErrorSlot, SlotTally, Solidity, EOA_MEMBER};
use crate::header::MIN_DICTIONARY_SIZE;
use crate::lzma::{MemberEncoder, OPTION_MAPPING};
use crate::tar::{
    init_tar_header, print_octal, remove_leading_dotslash, round_up, size_in_ustar_range,
    time_in_ustar_range, uid_in_ustar_range, ustar_chksum, Extended, TarHeader, Typeflag,
    CHKSUM_L, CHKSUM_O, DEVMAJOR_L, DEVMAJOR_O, DEVMINOR_L, DEVMINOR_O, GID_L, GID_O,
    HEADER_SIZE, LINKNAME_L, LINKNAME_O, MODE_L, MODE_O, MTIME_L, MTIME_O, NAME_L, NAME_O,
    SIZE_L, SIZE_O, TYPEFLAG_O, UID_L, UID_O,
};
use crate::{Error, Result};

const MAX_PACKET_SIZE: usize = 1 << 20;
const IN_SLOTS_PER_WORKER: usize = 65536;
/// Smallest sensible bsolid target.
const MIN_DATA_SIZE: u64 = 2 * MIN_DICTIONARY_SIZE as u64;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Compression level 0-9.
    pub level: usize,
    pub solidity: Solidity,
    /// Target member data size for `BSolid`; 0 means twice the
    /// dictionary size of the level.
    pub data_size: u64,
    pub num_workers: usize,
    pub recursive: bool,
    pub verbosity: i32,
}

impl Default for CreateOptions {
    fn default() -> CreateOptions {
        CreateOptions {
            level: 6,
            solidity: Solidity::default(),
            data_size: 0,
            num_workers: 2,
            recursive: true,
            verbosity: 0,
        }
    }
}

enum Ipacket {
    File {
        path: PathBuf,
        file_size: u64,
        header: Box<TarHeader>,
        extended: Box<Extended>,
    },
    /// End of lzip member.
    EndOfGroup,
}

enum Opacket {
    Data(Vec<u8>),
    MemberEnd,
}

struct Shared {
    error: ErrorSlot,
    shutdown: AtomicBool,
    warnings: Mutex<Vec<String>>,
    /// Non-fatal per-file problems still fail the run with exit 1.
    soft_error: AtomicBool,
    prefix_reported: AtomicBool,
}

impl Shared {
    fn fatal(&self, member_id: usize, error: Error) {
        self.error.set(member_id, error);
        self.shutdown.store(true, Ordering::Release);
    }

    fn warn(&self, msg: String) {
        self.warnings.lock().unwrap().push(msg);
        self.soft_error.store(true, Ordering::Release);
    }
}

/// Fill the ustar header and extended records for one filesystem entry.
/// Returns the file data size to be stored.
fn fill_headers(path: &Path, extended: &mut Extended, header: &mut TarHeader) -> Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    init_tar_header(header);

    let name = path.to_string_lossy();
    let (stripped, prefix) = remove_leading_dotslash(&name);
    if !prefix.is_empty() {
        extended.removed_prefix = prefix.to_string();
    }
    let mut stored_name = stripped.to_string();
    if meta.is_dir() && !stored_name.ends_with('/') {
        stored_name.push('/');
    }
    if stored_name.len() <= NAME_L {
        header[NAME_O..NAME_O + stored_name.len()].copy_from_slice(stored_name.as_bytes());
    } else {
        extended.set_path(stored_name.trim_end_matches('/'));
    }

    #[cfg(unix)]
    let (mode, uid, gid, mtime) = {
        use std::os::unix::fs::MetadataExt;
        (
            meta.mode() & 0o7777,
            meta.uid() as i64,
            meta.gid() as i64,
            meta.mtime(),
        )
    };
    #[cfg(not(unix))]
    let (mode, uid, gid, mtime) = {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);
        (if meta.is_dir() { 0o755u32 } else { 0o644 }, 0i64, 0i64, mtime)
    };

    print_octal(&mut header[MODE_O..MODE_O + MODE_L - 1], u64::from(mode));
    if uid_in_ustar_range(uid) {
        print_octal(&mut header[UID_O..UID_O + UID_L - 1], uid as u64);
    } else {
        extended.set_uid(uid);
    }
    if uid_in_ustar_range(gid) {
        print_octal(&mut header[GID_O..GID_O + GID_L - 1], gid as u64);
    } else {
        extended.set_gid(gid);
    }
    if time_in_ustar_range(mtime) {
        print_octal(&mut header[MTIME_O..MTIME_O + MTIME_L - 1], mtime as u64);
    } else {
        extended.set_mtime(mtime);
    }
    print_octal(&mut header[DEVMAJOR_O..DEVMAJOR_O + DEVMAJOR_L - 1], 0);
    print_octal(&mut header[DEVMINOR_O..DEVMINOR_O + DEVMINOR_L - 1], 0);

    let file_type = meta.file_type();
    let mut file_size = 0u64;
    if file_type.is_dir() {
        header[TYPEFLAG_O] = Typeflag::Directory.byte();
    } else if file_type.is_symlink() {
        header[TYPEFLAG_O] = Typeflag::Symlink.byte();
        let target = std::fs::read_link(path)?;
        let target = target.to_string_lossy();
        if target.len() <= LINKNAME_L {
            header[LINKNAME_O..LINKNAME_O + target.len()].copy_from_slice(target.as_bytes());
        } else {
            extended.set_linkpath(&target);
        }
    } else if file_type.is_file() {
        header[TYPEFLAG_O] = Typeflag::Regular.byte();
        file_size = meta.len();
        if size_in_ustar_range(file_size) {
            print_octal(&mut header[SIZE_O..SIZE_O + SIZE_L - 1], file_size);
        } else {
            extended.set_file_size(file_size as i64);
        }
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if file_type.is_fifo() {
                header[TYPEFLAG_O] = Typeflag::Fifo.byte();
            } else {
                return Err(Error::Invalid(format!(
                    "{}: Unsupported file type, skipping.",
                    path.display()
                )));
            }
        }
        #[cfg(not(unix))]
        return Err(Error::Invalid(format!(
            "{}: Unsupported file type, skipping.",
            path.display()
        )));
    }
    let sum = ustar_chksum(header);
    print_octal(&mut header[CHKSUM_O..CHKSUM_O + CHKSUM_L - 1], u64::from(sum));
    Ok(file_size)
}

/// Start a new lzip member when the accumulated data would overflow the
/// target size.
fn block_is_full(
    extended_size: u64,
    file_size: u64,
    target_size: u64,
    partial_data_size: &mut u64,
) -> bool {
    let member_size = extended_size + HEADER_SIZE as u64 + round_up(file_size);
    if *partial_data_size >= target_size
        || (*partial_data_size >= MIN_DATA_SIZE
            && *partial_data_size + member_size / 2 > target_size)
    {
        *partial_data_size = member_size;
        return true;
    }
    *partial_data_size += member_size;
    false
}

/// Collect one command-line argument's entries in deterministic order.
fn collect_entries(arg: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    out.push(arg.to_path_buf());
    let meta = std::fs::symlink_metadata(arg)?;
    if meta.is_dir() && recursive {
        let mut children: Vec<PathBuf> = std::fs::read_dir(arg)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        children.sort();
        for child in children {
            collect_entries(&child, recursive, out)?;
        }
    }
    Ok(())
}

struct Grouper {
    opts: CreateOptions,
    shared: Arc<Shared>,
    tally: Arc<SlotTally>,
    senders: Vec<SyncSender<Ipacket>>,
    receive_id: usize,
    partial_data_size: u64,
    data_size: u64,
}

impl Grouper {
    fn send(&mut self, packet: Ipacket) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let end_of_group = matches!(packet, Ipacket::EndOfGroup);
        if !end_of_group {
            self.tally.get_slot();
        }
        if self.senders[self.receive_id].send(packet).is_err() {
            if !end_of_group {
                self.tally.leave_slot();
            }
            return false;
        }
        if end_of_group {
            self.receive_id = (self.receive_id + 1) % self.senders.len();
        }
        true
    }

    fn add_member(&mut self, path: &Path) -> bool {
        let mut extended = Box::new(Extended::new());
        let mut header: Box<TarHeader> = Box::new([0; HEADER_SIZE]);
        let file_size = match fill_headers(path, &mut extended, &mut header) {
            Ok(size) => size,
            Err(e) => {
                // skip entries that vanished or are unsupported
                self.shared.warn(e.to_string());
                return true;
            }
        };
        if !extended.removed_prefix.is_empty()
            && !self.shared.prefix_reported.swap(true, Ordering::AcqRel)
            && self.opts.verbosity >= 0
        {
            eprintln!(
                "Removing leading '{}' from member names.",
                extended.removed_prefix
            );
        }
        if self.opts.solidity == Solidity::BSolid {
            let ebsize = match extended.full_size() {
                Ok(size) => size,
                Err(e) => {
                    self.shared.fatal(0, e);
                    return false;
                }
            };
            if block_is_full(ebsize, file_size, self.data_size, &mut self.partial_data_size)
                && !self.send(Ipacket::EndOfGroup)
            {
                return false;
            }
        }
        if self.opts.verbosity >= 1 {
            eprintln!("{}", path.display());
        }
        if !self.send(Ipacket::File {
            path: path.to_path_buf(),
            file_size,
            header,
            extended,
        }) {
            return false;
        }
        if self.opts.solidity == Solidity::NoSolid {
            return self.send(Ipacket::EndOfGroup);
        }
        true
    }

    fn run(mut self, files: Vec<PathBuf>) {
        for arg in files {
            let mut entries = Vec::new();
            if let Err(e) = collect_entries(&arg, self.opts.recursive, &mut entries) {
                self.shared
                    .warn(format!("{}: {}", arg.display(), e));
                continue;
            }
            for entry in entries {
                if !self.add_member(&entry) {
                    return;
                }
            }
            if self.opts.solidity == Solidity::DSolid && !self.send(Ipacket::EndOfGroup) {
                return;
            }
        }
        // finish the last block or solid member
        match self.opts.solidity {
            Solidity::BSolid if self.partial_data_size > 0 => {
                self.send(Ipacket::EndOfGroup);
            }
            Solidity::ASolid | Solidity::Solid => {
                self.send(Ipacket::EndOfGroup);
            }
            _ => {}
        }
        // dropping the senders signals end of input
    }
}

/// Sink that cuts the compressed stream into bounded packets for the
/// muxer.
struct PacketSink {
    sender: SyncSender<Opacket>,
    buffer: Vec<u8>,
}

impl PacketSink {
    fn flush_packet(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let data = std::mem::take(&mut self.buffer);
            self.sender
                .send(Opacket::Data(data))
                .map_err(|_| std::io::Error::other("muxer is gone"))?;
        }
        Ok(())
    }
}

impl Write for PacketSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= MAX_PACKET_SIZE {
            self.flush_packet()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Worker {
    shared: Arc<Shared>,
    tally: Arc<SlotTally>,
    input: Receiver<Ipacket>,
    output: SyncSender<Opacket>,
    dictionary_size: u32,
    match_len_limit: usize,
    worker_id: usize,
    num_workers: usize,
}

impl Worker {
    fn run(self) {
        let mut encoder: Option<MemberEncoder<PacketSink>> = None;
        let mut group = 0usize;
        while let Ok(packet) = self.input.recv() {
            // global id of the lzip member this group becomes
            let member_id = group * self.num_workers + self.worker_id;
            if self.shared.shutdown.load(Ordering::Acquire) {
                if matches!(packet, Ipacket::File { .. }) {
                    self.tally.leave_slot();
                }
                encoder = None;
                continue; // drain until the grouper stops
            }
            match packet {
                Ipacket::EndOfGroup => {
                    if let Some(enc) = encoder.take() {
                        match enc.finish() {
                            Ok(mut sink) => {
                                if let Err(e) = sink.flush_packet() {
                                    self.shared.fatal(member_id, Error::Io(e));
                                    continue;
                                }
                            }
                            Err(e) => {
                                self.shared.fatal(member_id, e);
                                continue;
                            }
                        }
                    }
                    let _ = self.output.send(Opacket::MemberEnd);
                    group += 1;
                }
                Ipacket::File {
                    path,
                    file_size,
                    header,
                    mut extended,
                } => {
                    self.tally.leave_slot();
                    if let Err(e) =
                        self.compress_member(&mut encoder, &path, file_size, &header, &mut extended)
                    {
                        match e {
                            Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                                self.shared.warn(format!("{}: {}", path.display(), io));
                            }
                            e => {
                                encoder = None;
                                self.shared.fatal(member_id, e);
                            }
                        }
                    }
                }
            }
        }
        // the grouper closed the channel; nothing more to compress
        drop(encoder);
    }

    fn compress_member(
        &self,
        encoder: &mut Option<MemberEncoder<PacketSink>>,
        path: &Path,
        file_size: u64,
        header: &TarHeader,
        extended: &mut Extended,
    ) -> Result<()> {
        // open first so a vanished file does not leave a half member
        let mut infile = if file_size > 0 {
            Some(File::open(path)?)
        } else {
            None
        };
        if encoder.is_none() {
            let sink = PacketSink {
                sender: self.output.clone(),
                buffer: Vec::with_capacity(MAX_PACKET_SIZE),
            };
            *encoder = Some(MemberEncoder::new(
                self.dictionary_size,
                self.match_len_limit,
                sink,
            )?);
        }
        let enc = encoder.as_mut().unwrap();
        let ebsize = extended.format_block()?;
        if !ebsize.is_empty() {
            enc.write(&ebsize)?;
        }
        enc.write(header)?;

        if let Some(infile) = infile.as_mut() {
            let mut buf = [0u8; 32 * HEADER_SIZE];
            let mut rest = file_size;
            while rest > 0 {
                let size = (buf.len() as u64).min(rest) as usize;
                infile.read_exact(&mut buf[..size]).map_err(|_| {
                    Error::Invalid(format!(
                        "{}: File is shorter than expected.",
                        path.display()
                    ))
                })?;
                rest -= size as u64;
                if rest == 0 {
                    // pad the last read to a block multiple
                    let rem = (file_size % HEADER_SIZE as u64) as usize;
                    if rem > 0 {
                        let padding = HEADER_SIZE - rem;
                        let padded = size + padding;
                        buf[size..padded].fill(0);
                        enc.write(&buf[..padded])?;
                        break;
                    }
                }
                enc.write(&buf[..size])?;
            }
        }
        Ok(())
    }
}

/// Create a tar.lz archive from `files`, writing it to `out`.
///
/// The output is byte-identical for any worker count under the same
/// options, because members are assembled in strict grouper order.
pub fn create_archive<W: Write>(
    opts: &CreateOptions,
    files: &[PathBuf],
    out: &mut W,
) -> Result<()> {
    let num_workers = opts.num_workers.max(1);
    let (dictionary_size, match_len_limit) = OPTION_MAPPING[opts.level.min(9)];
    let data_size = match opts.data_size {
        0 => 2 * u64::from(dictionary_size),
        s => s,
    };
    let total_in_slots = IN_SLOTS_PER_WORKER.saturating_mul(num_workers);

    let shared = Arc::new(Shared {
        error: ErrorSlot::new(),
        shutdown: AtomicBool::new(false),
        warnings: Mutex::new(Vec::new()),
        soft_error: AtomicBool::new(false),
        prefix_reported: AtomicBool::new(false),
    });
    let tally = Arc::new(SlotTally::new(total_in_slots));

    let mut isenders = Vec::new();
    let mut worker_handles = Vec::new();
    let mut oreceivers = Vec::new();
    for _ in 0..num_workers {
        let (itx, irx) = mpsc::sync_channel::<Ipacket>(IN_SLOTS_PER_WORKER);
        let (otx, orx) = mpsc::sync_channel::<Opacket>(64);
        isenders.push(itx);
        oreceivers.push(orx);
        let worker = Worker {
            shared: Arc::clone(&shared),
            tally: Arc::clone(&tally),
            input: irx,
            output: otx,
            dictionary_size,
            match_len_limit,
            worker_id: worker_handles.len(),
            num_workers,
        };
        worker_handles.push(thread::spawn(move || worker.run()));
    }

    let grouper = Grouper {
        opts: opts.clone(),
        shared: Arc::clone(&shared),
        tally: Arc::clone(&tally),
        senders: isenders,
        receive_id: 0,
        partial_data_size: 0,
        data_size,
    };
    let file_list = files.to_vec();
    let grouper_handle = thread::spawn(move || grouper.run(file_list));

    // muxer: strict round-robin over the worker output queues
    let mut closed = vec![false; num_workers];
    let mut deliver_id = 0usize;
    while closed.iter().any(|&c| !c) {
        if closed[deliver_id] {
            deliver_id = (deliver_id + 1) % num_workers;
            continue;
        }
        match oreceivers[deliver_id].recv() {
            Ok(Opacket::Data(data)) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    if let Err(e) = out.write_all(&data) {
                        shared.fatal(usize::MAX, Error::Io(e));
                    }
                }
            }
            Ok(Opacket::MemberEnd) => deliver_id = (deliver_id + 1) % num_workers,
            Err(_) => {
                closed[deliver_id] = true;
                deliver_id = (deliver_id + 1) % num_workers;
            }
        }
    }

    grouper_handle.join().map_err(|_| Error::Internal("grouper panicked"))?;
    for handle in worker_handles {
        handle.join().map_err(|_| Error::Internal("worker panicked"))?;
    }

    for msg in shared.warnings.lock().unwrap().iter() {
        if opts.verbosity >= 0 {
            eprintln!("{}", msg);
        }
    }
    if let Some(e) = shared.error.take() {
        return Err(e);
    }
    // write the End-Of-Archive member
    out.write_all(&EOA_MEMBER)?;
    if shared.soft_error.load(Ordering::Acquire) {
        return Err(Error::Invalid("Some files were skipped.".into()));
    }
    Ok(())
}
