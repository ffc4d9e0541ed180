//! Archive decode: listing and extraction, either member-parallel over
//! an indexed archive or serial over a stream.
//!
//! Parallel decode does not skip damaged data; it exits at the first
//! error. When a worker detects a problem it requests mastership, the
//! courier discards every other worker's packets, and the muxer drains.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::thread;

use super::reader::{ArchiveRead, IndexedReader, SerialReader};
use super::{ArchiveDescriptor, NameMonitor};
use crate::tar::{
    block_is_zero, check_ustar_chksum, contains_dotdot, parse_octal, round_up, Extended,
    TarHeader, Typeflag, UnknownKeywords, HEADER_SIZE, MODE_L, MODE_O, TYPEFLAG_O,
};
use crate::{Error, Result};

const OUT_SLOTS: usize = 65536; // max small files (<=512B) in 64 MiB

pub const END_MSG: &str = "Archive ends unexpectedly.";
const BAD_HDR_MSG: &str = "Corrupt or invalid tar header.";
const POSIX_LZ_MSG: &str = "This does not look like a POSIX tar.lz archive.";
const FV_MSG1: &str = "Format violation: extended header followed by EOA blocks.";
const FV_MSG2: &str = "Format violation: extended header followed by global header.";
const FV_MSG3: &str = "Format violation: consecutive extended headers found.";
const MISCRC_MSG: &str = "Missing CRC in extended records.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    List,
    Extract,
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub mode: DecodeMode,
    pub num_workers: usize,
    pub permissive: bool,
    /// Reject extended records without a CRC record.
    pub missing_crc: bool,
    /// Keep the decoded prefix of files damaged by archive corruption.
    pub keep_damaged: bool,
    pub verbosity: i32,
}

impl Default for DecodeOptions {
    fn default() -> DecodeOptions {
        DecodeOptions {
            mode: DecodeMode::List,
            num_workers: 2,
            permissive: false,
            missing_crc: false,
            keep_damaged: false,
            verbosity: 0,
        }
    }
}

enum PacketKind {
    /// Member line for the listing output.
    Line(String),
    /// Diagnostic for stderr.
    Diag(String),
    /// Removed-prefix notice; printed once globally.
    Prefix(String),
    /// Current lzip member fully processed.
    MemberDone,
    Error(Error),
}

struct Packet {
    member_id: usize,
    kind: PacketKind,
}

struct CourierState {
    queues: Vec<VecDeque<Packet>>,
    deliver_id: usize,
    master_id: Option<usize>,
    error_member_id: Option<usize>,
    num_working: usize,
    eoa_found: bool,
}

/// Moves packets from the workers to the muxer, preserving member order
/// and granting mastership on the first error.
struct Courier {
    state: Mutex<CourierState>,
    oav_or_exit: Condvar,
    slot_av: Vec<Condvar>,
    check_master: Condvar,
    num_workers: usize,
}

impl Courier {
    fn new(num_workers: usize) -> Courier {
        Courier {
            state: Mutex::new(CourierState {
                queues: (0..num_workers).map(|_| VecDeque::new()).collect(),
                deliver_id: 0,
                master_id: None,
                error_member_id: None,
                num_working: num_workers,
                eoa_found: false,
            }),
            oav_or_exit: Condvar::new(),
            slot_av: (0..num_workers).map(|_| Condvar::new()).collect(),
            check_master: Condvar::new(),
            num_workers,
        }
    }

    fn report_eoa(&self) {
        self.state.lock().unwrap().eoa_found = true;
    }

    fn eoa_found(&self) -> bool {
        self.state.lock().unwrap().eoa_found
    }

    /* The worker that found the error of the lowest member id becomes
    master: every other queue is purged and later packets from other
    workers are rejected. The caller must wait until the muxer has
    delivered all packets of the preceding members. */
    fn request_mastership(&self, member_id: usize, worker_id: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(master) = state.master_id {
            return master == worker_id;
        }
        if state.error_member_id.map_or(true, |id| id > member_id) {
            state.error_member_id = Some(member_id);
        }
        while state.master_id.is_none()
            && (worker_id != state.deliver_id || !state.queues[state.deliver_id].is_empty())
        {
            state = self.check_master.wait(state).unwrap();
        }
        if state.master_id.is_none() {
            state.master_id = Some(worker_id); // grant mastership
            for (i, queue) in state.queues.iter_mut().enumerate() {
                queue.clear();
                self.slot_av[i].notify_all();
            }
            self.check_master.notify_all();
            return true;
        }
        state.master_id == Some(worker_id)
    }

    fn worker_finished(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_working -= 1;
        if state.num_working == 0 {
            self.oav_or_exit.notify_one();
        }
    }

    /// Collect a packet from a worker. A rejected packet means the
    /// worker must terminate.
    fn collect_packet(&self, packet: Packet, worker_id: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.master_id.is_some_and(|m| m != worker_id)
            || state
                .error_member_id
                .is_some_and(|id| id < packet.member_id)
        {
            return false; // reject packet
        }
        while state.queues[worker_id].len() >= OUT_SLOTS {
            state = self.slot_av[worker_id].wait(state).unwrap();
            if state.master_id.is_some_and(|m| m != worker_id) {
                return false;
            }
        }
        state.queues[worker_id].push_back(packet);
        if worker_id == state.deliver_id {
            self.oav_or_exit.notify_one();
        }
        true
    }

    /// Deliver the next batch of packets in member order. An empty batch
    /// means all workers exited and the queues are drained.
    fn deliver_packets(&self, batch: &mut Vec<Packet>) {
        batch.clear();
        let mut state = self.state.lock().unwrap();
        loop {
            while state.queues[state.deliver_id].is_empty() && state.num_working > 0 {
                if state.master_id.is_none() && state.error_member_id.is_some() {
                    // mastership requested but not yet granted
                    self.check_master.notify_all();
                }
                state = self.oav_or_exit.wait(state).unwrap();
            }
            while let Some(packet) = {
                let deliver_id = state.deliver_id;
                state.queues[deliver_id].pop_front()
            } {
                let deliver_id = state.deliver_id;
                if state.queues[deliver_id].len() + 1 == OUT_SLOTS {
                    self.slot_av[deliver_id].notify_all();
                }
                let done = matches!(packet.kind, PacketKind::MemberDone);
                if done && state.master_id.is_none() {
                    state.deliver_id = (state.deliver_id + 1) % self.num_workers;
                }
                batch.push(packet);
                if done {
                    break;
                }
            }
            if !batch.is_empty() || state.num_working == 0 {
                return;
            }
        }
    }

    fn finished(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.num_working == 0 && state.queues.iter().all(VecDeque::is_empty)
    }
}

/// Target sink for worker results, hiding courier vs direct output.
trait DecodeSink {
    /// Returns false when the worker must terminate.
    fn line(&mut self, member_id: usize, line: String) -> bool;
    fn diag(&mut self, member_id: usize, line: String) -> bool;
    fn prefix(&mut self, member_id: usize, line: String) -> bool;
}

struct CourierSink<'a> {
    courier: &'a Courier,
    worker_id: usize,
}

impl DecodeSink for CourierSink<'_> {
    fn line(&mut self, member_id: usize, line: String) -> bool {
        self.courier.collect_packet(
            Packet {
                member_id,
                kind: PacketKind::Line(line),
            },
            self.worker_id,
        )
    }

    fn diag(&mut self, member_id: usize, line: String) -> bool {
        self.courier.collect_packet(
            Packet {
                member_id,
                kind: PacketKind::Diag(line),
            },
            self.worker_id,
        )
    }

    fn prefix(&mut self, member_id: usize, line: String) -> bool {
        self.courier.collect_packet(
            Packet {
                member_id,
                kind: PacketKind::Prefix(line),
            },
            self.worker_id,
        )
    }
}

struct DirectSink<'a, W: Write> {
    out: &'a mut W,
    verbosity: i32,
    prefix_reported: bool,
}

impl<W: Write> DecodeSink for DirectSink<'_, W> {
    fn line(&mut self, _member_id: usize, line: String) -> bool {
        let _ = self.out.write_all(line.as_bytes());
        true
    }

    fn diag(&mut self, _member_id: usize, line: String) -> bool {
        if self.verbosity >= 0 {
            eprintln!("{}", line.trim_end());
        }
        true
    }

    fn prefix(&mut self, _member_id: usize, line: String) -> bool {
        if !self.prefix_reported {
            self.prefix_reported = true;
            if self.verbosity >= 0 {
                eprintln!("{}", line.trim_end());
            }
        }
        true
    }
}

/// Format a member line the way tar -t does: bare name, or a long line
/// with mode, ids, size, and name.
fn format_member_name(extended: &Extended, header: &TarHeader, long: bool) -> String {
    if !long {
        return format!("{}\n", extended.path());
    }
    let mode = parse_octal(&header[MODE_O..MODE_O + MODE_L]);
    format!(
        "{:04o} {}/{} {:9} {}\n",
        mode,
        extended.uid(),
        extended.gid(),
        extended.file_size(),
        extended.path()
    )
}

fn list_member(
    ar: &mut dyn ArchiveRead,
    sink: &mut dyn DecodeSink,
    extended: &Extended,
    header: &TarHeader,
    member_id: usize,
    verbosity: i32,
) -> Result<()> {
    let line = if verbosity >= 0 {
        format_member_name(extended, header, verbosity > 0)
    } else {
        String::new()
    };
    let typeflag = Typeflag::from(header[TYPEFLAG_O]);
    // print the name even on a data read error
    let skip_result = if typeflag.data_may_follow() {
        ar.skip_member(extended)
    } else {
        Ok(())
    };
    if !line.is_empty() && !sink.line(member_id, line) {
        return Err(Error::OtherWorker);
    }
    skip_result
}

fn make_parent_dirs(name: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(name).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn extract_member(
    ar: &mut dyn ArchiveRead,
    sink: &mut dyn DecodeSink,
    extended: &Extended,
    header: &TarHeader,
    member_id: usize,
    opts: &DecodeOptions,
    name_monitor: Option<&NameMonitor>,
    worker_id: usize,
) -> Result<()> {
    let filename = extended.path().to_string();
    let typeflag = Typeflag::from(header[TYPEFLAG_O]);
    let skip_data = |ar: &mut dyn ArchiveRead| {
        if typeflag.data_may_follow() {
            ar.skip_member(extended)
        } else {
            Ok(())
        }
    };
    if filename.is_empty() || contains_dotdot(&filename) {
        if !filename.is_empty()
            && !sink.diag(
                member_id,
                format!("{}: Contains a '..' component, skipping.", filename),
            )
        {
            return Err(Error::OtherWorker);
        }
        return skip_data(ar);
    }
    // skip if another thread is already extracting the same name
    if let Some(monitor) = name_monitor {
        if !monitor.reserve_name(worker_id, &filename) {
            return skip_data(ar);
        }
    }
    if opts.verbosity >= 1 && !sink.line(member_id, format!("{}\n", filename)) {
        return Err(Error::OtherWorker);
    }
    if make_parent_dirs(&filename).is_err() {
        if !sink.diag(
            member_id,
            format!("{}: Failed to create intermediate directory.", filename),
        ) {
            return Err(Error::OtherWorker);
        }
        return skip_data(ar);
    }
    // remove files before extraction to prevent following links; keep
    // directories, another thread may need them
    let existing = fs::symlink_metadata(&filename).ok();
    if let Some(meta) = &existing {
        if typeflag != Typeflag::Directory || !meta.is_dir() {
            let _ = fs::remove_file(&filename);
        }
    }

    let mode = (parse_octal(&header[MODE_O..MODE_O + MODE_L]) & 0o7777) as u32;
    match typeflag {
        Typeflag::Regular | Typeflag::Hiperf => {
            let mut outfile = match fs::File::create(&filename) {
                Ok(f) => f,
                Err(e) => {
                    if !sink.diag(member_id, format!("{}: Can't create file: {}", filename, e)) {
                        return Err(Error::OtherWorker);
                    }
                    return skip_data(ar);
                }
            };
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = outfile.set_permissions(fs::Permissions::from_mode(mode));
            }
            let mut buf = [0u8; 32 * HEADER_SIZE];
            let mut rest = extended.file_size() as u64;
            let padding = (round_up(rest) - rest) as usize;
            while rest > 0 {
                let wsize = (buf.len() as u64).min(rest) as usize;
                let rsize = if rest >= buf.len() as u64 {
                    buf.len()
                } else {
                    wsize + padding
                };
                if let Err(e) = ar.read_exact(&mut buf[..rsize]) {
                    drop(outfile);
                    if !opts.keep_damaged {
                        let _ = fs::remove_file(&filename);
                    }
                    return Err(e);
                }
                outfile.write_all(&buf[..wsize])?;
                rest -= wsize as u64;
            }
            if let Some(mtime) = system_time_of(extended.mtime().sec()) {
                let _ = outfile.set_modified(mtime);
            }
        }
        Typeflag::Directory => {
            if existing.as_ref().map_or(true, |m| !m.is_dir()) {
                if let Err(e) = fs::create_dir_all(&filename) {
                    if !sink.diag(
                        member_id,
                        format!("{}: Can't create directory: {}", filename, e),
                    ) {
                        return Err(Error::OtherWorker);
                    }
                }
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&filename, fs::Permissions::from_mode(mode));
            }
        }
        Typeflag::Link | Typeflag::Symlink => {
            let linkname = extended.linkpath().to_string();
            let result = if typeflag == Typeflag::Link {
                fs::hard_link(&linkname, &filename)
            } else {
                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(&linkname, &filename)
                }
                #[cfg(not(unix))]
                {
                    Err(std::io::Error::other("symlinks not supported"))
                }
            };
            if let Err(e) = result {
                if !sink.diag(
                    member_id,
                    format!(
                        "Can't {}link '{}' to '{}': {}",
                        if typeflag == Typeflag::Link { "" } else { "sym" },
                        linkname,
                        filename,
                        e
                    ),
                ) {
                    return Err(Error::OtherWorker);
                }
            }
        }
        Typeflag::Chardev | Typeflag::Blockdev | Typeflag::Fifo => {
            // special files need platform-specific creation; report and
            // keep going
            if !sink.diag(
                member_id,
                format!("{}: Special file not extracted.", filename),
            ) {
                return Err(Error::OtherWorker);
            }
        }
        _ => {
            if !sink.diag(
                member_id,
                format!(
                    "{}: Unknown member type '{}', skipping.",
                    filename, header[TYPEFLAG_O] as char
                ),
            ) {
                return Err(Error::OtherWorker);
            }
            return skip_data(ar);
        }
    }
    Ok(())
}

fn system_time_of(sec: i64) -> Option<std::time::SystemTime> {
    if sec >= 0 {
        std::time::UNIX_EPOCH.checked_add(std::time::Duration::from_secs(sec as u64))
    } else {
        std::time::UNIX_EPOCH.checked_sub(std::time::Duration::from_secs(sec.unsigned_abs()))
    }
}

/// Outcome of processing the tar members of one lzip member.
enum MemberOutcome {
    Done,
    Eoa,
    Fatal(Error),
}

/* Process the tar members whose headers live in lzip member `i`. */
#[allow(clippy::too_many_arguments)]
fn process_lzip_member(
    ar: &mut IndexedReader,
    sink: &mut dyn DecodeSink,
    courier: &Courier,
    worker_id: usize,
    member_id: usize,
    opts: &DecodeOptions,
    keywords: &UnknownKeywords,
    name_monitor: Option<&NameMonitor>,
    udata_size: u64,
) -> MemberOutcome {
    let mut data_end = ar.mdata_end();
    let mut extended = Extended::new();
    let mut prev_extended = false;

    loop {
        if ar.data_pos() >= data_end {
            if ar.data_pos() == data_end && !prev_extended {
                return MemberOutcome::Done;
            }
            // member end exceeded or member ends in an extended header:
            // this worker takes over the rest of the archive
            if !courier.request_mastership(member_id, worker_id) {
                return MemberOutcome::Fatal(Error::OtherWorker);
            }
            if data_end >= udata_size {
                return MemberOutcome::Fatal(Error::Corrupt(END_MSG.into()));
            }
            data_end = udata_size;
            if ar.data_pos() == data_end && !prev_extended {
                return MemberOutcome::Done;
            }
        }
        let mut header: TarHeader = [0; HEADER_SIZE];
        if let Err(e) = ar.read_exact(&mut header) {
            return MemberOutcome::Fatal(e);
        }
        if !check_ustar_chksum(&header) {
            if block_is_zero(&header) {
                // End Of Archive
                if prev_extended && !opts.permissive {
                    return MemberOutcome::Fatal(Error::Corrupt(FV_MSG1.into()));
                }
                return MemberOutcome::Eoa;
            }
            return MemberOutcome::Fatal(Error::Corrupt(
                if ar.data_pos() > HEADER_SIZE as u64 {
                    BAD_HDR_MSG
                } else {
                    POSIX_LZ_MSG
                }
                .into(),
            ));
        }

        let typeflag = Typeflag::from(header[TYPEFLAG_O]);
        if typeflag == Typeflag::Global {
            if prev_extended && !opts.permissive {
                return MemberOutcome::Fatal(Error::Corrupt(FV_MSG2.into()));
            }
            let mut dummy = Extended::new(); // parsed and ignored
            let mut msgs = Vec::new();
            if let Err(e) = ar.parse_records(&mut dummy, &header, true, keywords, &mut msgs) {
                return MemberOutcome::Fatal(e);
            }
            if ar.data_pos() == data_end {
                return MemberOutcome::Done;
            }
            continue;
        }
        if typeflag == Typeflag::Extended {
            if prev_extended && !opts.permissive {
                return MemberOutcome::Fatal(Error::Corrupt(FV_MSG3.into()));
            }
            let mut msgs = Vec::new();
            if let Err(e) =
                ar.parse_records(&mut extended, &header, opts.permissive, keywords, &mut msgs)
            {
                return MemberOutcome::Fatal(e);
            }
            for msg in msgs {
                if !sink.diag(member_id, msg) {
                    return MemberOutcome::Fatal(Error::OtherWorker);
                }
            }
            if !extended.crc_present() && opts.missing_crc {
                return MemberOutcome::Fatal(Error::Corrupt(MISCRC_MSG.into()));
            }
            prev_extended = true;
            continue;
        }
        prev_extended = false;
        extended.fill_from_ustar(&header);
        if !extended.removed_prefix.is_empty() {
            let msg = format!(
                "Removing leading '{}' from member names.",
                extended.removed_prefix
            );
            if !sink.prefix(member_id, msg) {
                return MemberOutcome::Fatal(Error::OtherWorker);
            }
        }

        let result = match opts.mode {
            DecodeMode::List => {
                list_member(ar, sink, &extended, &header, member_id, opts.verbosity)
            }
            DecodeMode::Extract => extract_member(
                ar,
                sink,
                &extended,
                &header,
                member_id,
                opts,
                name_monitor,
                worker_id,
            ),
        };
        if let Err(e) = result {
            return MemberOutcome::Fatal(e);
        }
        extended.reset();
    }
}

struct WorkerCtx<'a> {
    ad: &'a ArchiveDescriptor,
    courier: &'a Courier,
    name_monitor: &'a NameMonitor,
    keywords: &'a UnknownKeywords,
    opts: &'a DecodeOptions,
    worker_id: usize,
    num_workers: usize,
}

/// Read lzip members from the archive, decode their tar members, and
/// hand the packets produced to the courier.
fn decode_worker(ctx: WorkerCtx) {
    let WorkerCtx {
        ad,
        courier,
        name_monitor,
        keywords,
        opts,
        worker_id,
        num_workers,
    } = ctx;
    let mut sink = CourierSink { courier, worker_id };
    let mut ar = IndexedReader::new(ad);
    let udata_size = ad.index.udata_size();

    let mut i = worker_id;
    while i < ad.index.members() {
        if ad.index.dblock(i).size() == 0 {
            // empty lzip member
            if courier.collect_packet(
                Packet {
                    member_id: i,
                    kind: PacketKind::MemberDone,
                },
                worker_id,
            ) {
                i += num_workers;
                continue;
            }
            break;
        }
        if let Err(e) = ar.set_member(i) {
            if courier.request_mastership(i, worker_id) {
                courier.collect_packet(
                    Packet {
                        member_id: i,
                        kind: PacketKind::Error(e),
                    },
                    worker_id,
                );
            }
            break;
        }
        match process_lzip_member(
            &mut ar,
            &mut sink,
            courier,
            worker_id,
            i,
            opts,
            keywords,
            Some(name_monitor),
            udata_size,
        ) {
            MemberOutcome::Done => {
                if !courier.collect_packet(
                    Packet {
                        member_id: i,
                        kind: PacketKind::MemberDone,
                    },
                    worker_id,
                ) {
                    break;
                }
            }
            MemberOutcome::Eoa => {
                if courier.request_mastership(i, worker_id) {
                    courier.report_eoa();
                }
                break;
            }
            MemberOutcome::Fatal(Error::OtherWorker) => break,
            MemberOutcome::Fatal(e) => {
                if courier.request_mastership(i, worker_id) {
                    courier.collect_packet(
                        Packet {
                            member_id: i,
                            kind: PacketKind::Error(e),
                        },
                        worker_id,
                    );
                }
                break;
            }
        }
        i += num_workers;
    }
    courier.worker_finished();
}

/// Get the sorted packets from the courier; print member lines to `out`
/// and diagnostics to stderr.
fn muxer<W: Write>(courier: &Courier, verbosity: i32, out: &mut W) -> Result<()> {
    let mut batch = Vec::new();
    let mut prefix_reported = false;
    let mut first_error: Option<Error> = None;
    loop {
        courier.deliver_packets(&mut batch);
        if batch.is_empty() {
            break; // queues empty, all workers exited
        }
        for packet in batch.drain(..) {
            if first_error.is_some() {
                continue; // drain only
            }
            match packet.kind {
                PacketKind::Line(line) => {
                    out.write_all(line.as_bytes())?;
                }
                PacketKind::Diag(line) => {
                    if verbosity >= 0 {
                        eprintln!("{}", line.trim_end());
                    }
                }
                PacketKind::Prefix(line) => {
                    if !prefix_reported {
                        prefix_reported = true;
                        if verbosity >= 0 {
                            eprintln!("{}", line.trim_end());
                        }
                    }
                }
                PacketKind::MemberDone => {}
                PacketKind::Error(e) => first_error = Some(e),
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Decode an indexed archive with `num_workers` parallel readers.
pub fn decode_archive_indexed<W: Write>(
    ad: &ArchiveDescriptor,
    opts: &DecodeOptions,
    out: &mut W,
) -> Result<()> {
    let num_workers = opts.num_workers.clamp(1, ad.index.members().max(1));
    let courier = Courier::new(num_workers);
    let name_monitor = NameMonitor::new(num_workers);
    let keywords = UnknownKeywords::new();

    let result = thread::scope(|scope| {
        for worker_id in 0..num_workers {
            let ctx = WorkerCtx {
                ad,
                courier: &courier,
                name_monitor: &name_monitor,
                keywords: &keywords,
                opts,
                worker_id,
                num_workers,
            };
            scope.spawn(move || decode_worker(ctx));
        }
        muxer(&courier, opts.verbosity, out)
    });
    if !courier.finished() {
        return Err(Error::Internal("courier not finished."));
    }
    result?;
    if !courier.eoa_found() {
        return Err(Error::Corrupt(END_MSG.into()));
    }
    Ok(())
}

/// Serial decode over a stream; used for non-seekable input. Recovers
/// from a corrupt tar header by skipping block-wise to the next valid
/// header, with a single warning per run.
pub fn decode_archive_serial<R: Read, W: Write>(
    reader: R,
    opts: &DecodeOptions,
    out: &mut W,
) -> Result<()> {
    let mut ar = SerialReader::new(reader);
    let mut sink = DirectSink {
        out,
        verbosity: opts.verbosity,
        prefix_reported: false,
    };
    let keywords = UnknownKeywords::new();
    let mut extended = Extended::new();
    let mut prev_extended = false;
    let mut skip_warned = false;
    let mut zero_blocks = 0u32;

    loop {
        if ar.finished() {
            if zero_blocks > 0 {
                return Ok(()); // single zero block at EOF counts as EOA
            }
            return Err(Error::Corrupt(END_MSG.into()));
        }
        let mut header: TarHeader = [0; HEADER_SIZE];
        ar.read_exact(&mut header)?;
        if !check_ustar_chksum(&header) {
            if block_is_zero(&header) {
                zero_blocks += 1;
                if prev_extended && !opts.permissive {
                    return Err(Error::Corrupt(FV_MSG1.into()));
                }
                if zero_blocks >= 2 {
                    return Ok(()); // canonical End Of Archive
                }
                continue;
            }
            // skip to the next header, warning once
            if !skip_warned {
                skip_warned = true;
                if opts.verbosity >= 0 {
                    eprintln!("Skipping to next header.");
                }
            }
            zero_blocks = 0;
            prev_extended = false;
            extended.reset();
            continue;
        }
        zero_blocks = 0;

        let typeflag = Typeflag::from(header[TYPEFLAG_O]);
        if typeflag == Typeflag::Global {
            if prev_extended && !opts.permissive {
                return Err(Error::Corrupt(FV_MSG2.into()));
            }
            let mut dummy = Extended::new();
            let mut msgs = Vec::new();
            ar.parse_records(&mut dummy, &header, true, &keywords, &mut msgs)?;
            continue;
        }
        if typeflag == Typeflag::Extended {
            if prev_extended && !opts.permissive {
                return Err(Error::Corrupt(FV_MSG3.into()));
            }
            let mut msgs = Vec::new();
            ar.parse_records(&mut extended, &header, opts.permissive, &keywords, &mut msgs)?;
            for msg in msgs {
                sink.diag(0, msg);
            }
            if !extended.crc_present() && opts.missing_crc {
                return Err(Error::Corrupt(MISCRC_MSG.into()));
            }
            prev_extended = true;
            continue;
        }
        prev_extended = false;
        extended.fill_from_ustar(&header);
        if !extended.removed_prefix.is_empty() {
            let msg = format!(
                "Removing leading '{}' from member names.",
                extended.removed_prefix
            );
            sink.prefix(0, msg);
        }
        match opts.mode {
            DecodeMode::List => {
                list_member(&mut ar, &mut sink, &extended, &header, 0, opts.verbosity)?
            }
            DecodeMode::Extract => extract_member(
                &mut ar,
                &mut sink,
                &extended,
                &header,
                0,
                opts,
                None,
                0,
            )?,
        }
        extended.reset();
    }
}

/// Decode an archive file: parallel when the archive is a seekable
/// multimember file, serial otherwise.
pub fn decode_archive<W: Write>(
    archive: &Path,
    opts: &DecodeOptions,
    out: &mut W,
) -> Result<()> {
    match ArchiveDescriptor::open(archive) {
        Ok(ad) => decode_archive_indexed(&ad, opts, out),
        Err(Error::Io(e)) => Err(Error::Io(e)),
        Err(_) => {
            // not an indexable lzip file; fall back to the serial reader
            let file = fs::File::open(archive)?;
            decode_archive_serial(file, opts, out)
        }
    }
}
