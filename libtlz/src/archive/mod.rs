//! tar.lz archives: aligned tar-in-lzip, with one tar member group per
//! lzip member, parallel create and decode pipelines, and serial
//! fallbacks for non-seekable input.

mod create;
mod decode;
mod reader;

pub use create::{create_archive, CreateOptions};
pub use decode::{
    decode_archive, decode_archive_indexed, decode_archive_serial, DecodeMode, DecodeOptions,
};
pub use reader::{ArchiveRead, IndexedReader, SerialReader};

use std::fs::File;
use std::path::Path;
use std::sync::{Condvar, Mutex};

use crate::index::LzipIndex;
use crate::io::CRC32C;
use crate::{Error, Result};

/// The End-Of-Archive member: a pre-compressed lzip member holding the
/// two zeroed blocks that terminate a tar archive.
pub const EOA_MEMBER: [u8; 44] = [
    0x4C, 0x5A, 0x49, 0x50, 0x01, 0x0C, 0x00, 0x00, 0x6F, 0xFD, 0xFF, 0xFF, 0xA3, 0xB7, 0x80,
    0x0C, 0x82, 0xDB, 0xFF, 0xFF, 0x9F, 0xF0, 0x00, 0x00, 0x2E, 0xAF, 0xB5, 0xEF, 0x00, 0x04,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Grouping policy choosing how tar members are packed into lzip members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solidity {
    /// One lzip member per file.
    NoSolid,
    /// Start a new lzip member when the accumulated data crosses a
    /// target size.
    #[default]
    BSolid,
    /// One lzip member per directory given in the command line.
    DSolid,
    /// One single lzip member for the whole archive (appendable).
    ASolid,
    /// One single lzip member for the whole archive.
    Solid,
}

/// A seekable archive plus its member index, shared read-only by the
/// parallel decode workers.
#[derive(Debug)]
pub struct ArchiveDescriptor {
    pub file: File,
    pub index: LzipIndex,
}

impl ArchiveDescriptor {
    pub fn open(path: &Path) -> Result<ArchiveDescriptor> {
        let file = File::open(path)?;
        let index = LzipIndex::new(&file, false)?;
        Ok(ArchiveDescriptor { file, index })
    }
}

/// Prevents two workers from extracting the same output path at the same
/// time. Holds one reservation slot per worker, keyed by the CRC32-C of
/// the path; names are compared only on CRC collision.
pub struct NameMonitor {
    slots: Mutex<Vec<(u32, String)>>,
}

impl NameMonitor {
    pub fn new(num_workers: usize) -> NameMonitor {
        NameMonitor {
            slots: Mutex::new(vec![(0, String::new()); num_workers]),
        }
    }

    /// Reserve `filename` for `worker_id`, replacing the worker's prior
    /// reservation. Returns false if another worker holds the name.
    pub fn reserve_name(&self, worker_id: usize, filename: &str) -> bool {
        let crc = CRC32C.checksum(filename.as_bytes());
        let mut slots = self.slots.lock().unwrap();
        for (i, (slot_crc, slot_name)) in slots.iter().enumerate() {
            if *slot_crc == crc && crc != 0 && i != worker_id && slot_name == filename {
                return false; // already being extracted by another thread
            }
        }
        slots[worker_id] = (crc, filename.to_string());
        true
    }
}

/// Gates producers so the input queues cannot exceed a total slot count.
pub(crate) struct SlotTally {
    num_slots: usize,
    free: Mutex<usize>,
    slot_av: Condvar,
}

impl SlotTally {
    pub fn new(slots: usize) -> SlotTally {
        SlotTally {
            num_slots: slots,
            free: Mutex::new(slots),
            slot_av: Condvar::new(),
        }
    }

    pub fn all_free(&self) -> bool {
        *self.free.lock().unwrap() == self.num_slots
    }

    /// Wait for a free slot.
    pub fn get_slot(&self) {
        let mut free = self.free.lock().unwrap();
        while *free == 0 {
            free = self.slot_av.wait(free).unwrap();
        }
        *free -= 1;
    }

    /// Return a slot to the tally.
    pub fn leave_slot(&self) {
        let mut free = self.free.lock().unwrap();
        *free += 1;
        if *free == 1 {
            self.slot_av.notify_one();
        }
    }
}

/// First-error-wins slot shared by the members of a pipeline. The error
/// of the lowest member id is kept; ties go to the first reporter.
pub(crate) struct ErrorSlot {
    slot: Mutex<Option<(usize, Error)>>,
}

impl ErrorSlot {
    pub fn new() -> ErrorSlot {
        ErrorSlot {
            slot: Mutex::new(None),
        }
    }

    pub fn set(&self, member_id: usize, error: Error) {
        let mut slot = self.slot.lock().unwrap();
        let replace = match &*slot {
            Some((winner, _)) => *winner > member_id,
            None => true,
        };
        if replace {
            *slot = Some((member_id, error));
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    pub fn take(&self) -> Option<Error> {
        self.slot.lock().unwrap().take().map(|(_, e)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_monitor_excludes_duplicates() {
        let monitor = NameMonitor::new(3);
        assert!(monitor.reserve_name(0, "a/b"));
        assert!(!monitor.reserve_name(1, "a/b"));
        assert!(monitor.reserve_name(1, "a/c"));
        // replacing worker 0's reservation frees the old name
        assert!(monitor.reserve_name(0, "a/d"));
        assert!(monitor.reserve_name(1, "a/b"));
        // the same worker may re-reserve its own name
        assert!(monitor.reserve_name(1, "a/b"));
    }

    #[test]
    fn error_slot_lowest_member_wins() {
        let slot = ErrorSlot::new();
        slot.set(5, Error::BadMagic);
        slot.set(2, Error::Internal("x"));
        slot.set(7, Error::BadDictSize);
        match slot.take() {
            Some(Error::Internal(_)) => {}
            other => panic!("wrong winner: {:?}", other),
        }
    }

    #[test]
    fn slot_tally_counts() {
        let tally = SlotTally::new(2);
        tally.get_slot();
        tally.get_slot();
        assert!(!tally.all_free());
        tally.leave_slot();
        tally.leave_slot();
        assert!(tally.all_free());
    }
}
