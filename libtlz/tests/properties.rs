//! Cross-component properties: parallel pipelines against their serial
//! equivalents, archive ordering, and stream catenation laws.

use std::fs;
use std::path::PathBuf;

use libtlz::archive::{
    create_archive, decode_archive_indexed, ArchiveDescriptor, CreateOptions, DecodeMode,
    DecodeOptions, Solidity, EOA_MEMBER,
};
use libtlz::stream::decompress_stream;
use libtlz::LzipIndex;

struct Lcg(u32);

impl Lcg {
    fn next_u8(&mut self) -> u8 {
        self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
        (self.0 >> 16) as u8
    }

    fn fill(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.next_u8() % 41).collect()
    }
}

fn make_tree(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut rng = Lcg(0x5EED);
    let a = dir.join("a.dat");
    fs::write(&a, rng.fill(1000)).unwrap();
    let b = dir.join("b.dat");
    fs::write(&b, rng.fill(500)).unwrap();
    let sub = dir.join("sub");
    fs::create_dir(&sub).unwrap();
    let c = sub.join("c.dat");
    fs::write(&c, rng.fill(1000)).unwrap();
    vec![a, b, sub]
}

fn create(files: &[PathBuf], solidity: Solidity, num_workers: usize) -> Vec<u8> {
    let opts = CreateOptions {
        level: 1,
        solidity,
        num_workers,
        verbosity: -1,
        ..CreateOptions::default()
    };
    let mut out = Vec::new();
    create_archive(&opts, files, &mut out).unwrap();
    out
}

#[test]
fn parallel_create_equals_serial() {
    let dir = tempfile::tempdir().unwrap();
    let files = make_tree(dir.path());
    for solidity in [Solidity::NoSolid, Solidity::DSolid] {
        let serial = create(&files, solidity, 1);
        for workers in [2, 4, 8] {
            let parallel = create(&files, solidity, workers);
            assert_eq!(
                serial, parallel,
                "output differs for {:?} with {} workers",
                solidity, workers
            );
        }
    }
}

#[test]
fn archive_ends_with_the_eoa_member() {
    let dir = tempfile::tempdir().unwrap();
    let files = make_tree(dir.path());
    let archive = create(&files, Solidity::NoSolid, 2);
    assert!(archive.len() > EOA_MEMBER.len());
    assert_eq!(&archive[archive.len() - EOA_MEMBER.len()..], &EOA_MEMBER);
    // the archive is a valid multimember lzip stream
    let index = LzipIndex::new(archive.as_slice(), false).unwrap();
    // one member per entry (2 files + 1 dir + 1 file in dir) plus EOA
    assert_eq!(index.members(), 5);
    // the decompressed archive is a multiple of the tar block size
    let mut tar_bytes = Vec::new();
    decompress_stream(&archive[..], &mut tar_bytes, false).unwrap();
    assert_eq!(tar_bytes.len() % 512, 0);
}

#[test]
fn parallel_list_prints_members_in_archive_order() {
    let dir = tempfile::tempdir().unwrap();
    let files = make_tree(dir.path());
    let archive_path = dir.path().join("test.tar.lz");
    fs::write(&archive_path, create(&files, Solidity::NoSolid, 1)).unwrap();

    let ad = ArchiveDescriptor::open(&archive_path).unwrap();
    for workers in [1, 2, 3, 8] {
        let opts = DecodeOptions {
            mode: DecodeMode::List,
            num_workers: workers,
            verbosity: 0,
            ..DecodeOptions::default()
        };
        let mut out = Vec::new();
        decode_archive_indexed(&ad, &opts, &mut out).unwrap();
        let listing = String::from_utf8(out).unwrap();
        let names: Vec<&str> = listing.lines().collect();
        assert_eq!(names.len(), 4, "listing: {:?}", names);
        // strict archive order regardless of which worker finished first
        assert!(names[0].ends_with("a.dat"));
        assert!(names[1].ends_with("b.dat"));
        assert!(names[2].ends_with("sub/") || names[2].ends_with("sub"));
        assert!(names[3].ends_with("c.dat"));
    }
}

#[test]
fn solid_archive_holds_a_single_member() {
    let dir = tempfile::tempdir().unwrap();
    let files = make_tree(dir.path());
    let archive = create(&files, Solidity::Solid, 4);
    let index = LzipIndex::new(archive.as_slice(), false).unwrap();
    assert_eq!(index.members(), 2); // one data member + EOA
}

#[test]
fn catenated_archives_list_both() {
    // catenation of two archives is a valid archive of both contents
    // once the EOA of the first is removed
    let dir = tempfile::tempdir().unwrap();
    let one = dir.path().join("one.txt");
    fs::write(&one, b"first archive file").unwrap();
    let two = dir.path().join("two.txt");
    fs::write(&two, b"second archive file").unwrap();

    let a = create(&[one], Solidity::NoSolid, 1);
    let b = create(&[two], Solidity::NoSolid, 1);
    let mut joined = a[..a.len() - EOA_MEMBER.len()].to_vec();
    joined.extend_from_slice(&b);
    let archive_path = dir.path().join("joined.tar.lz");
    fs::write(&archive_path, &joined).unwrap();

    let ad = ArchiveDescriptor::open(&archive_path).unwrap();
    let opts = DecodeOptions {
        mode: DecodeMode::List,
        num_workers: 2,
        verbosity: 0,
        ..DecodeOptions::default()
    };
    let mut out = Vec::new();
    decode_archive_indexed(&ad, &opts, &mut out).unwrap();
    let listing = String::from_utf8(out).unwrap();
    let names: Vec<&str> = listing.lines().collect();
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with("one.txt"));
    assert!(names[1].ends_with("two.txt"));
}

#[test]
fn truncated_archive_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let files = make_tree(dir.path());
    let archive = create(&files, Solidity::NoSolid, 1);
    // cut away the EOA member: decode must report the missing end
    let archive_path = dir.path().join("cut.tar.lz");
    fs::write(&archive_path, &archive[..archive.len() - EOA_MEMBER.len()]).unwrap();
    let ad = ArchiveDescriptor::open(&archive_path).unwrap();
    let opts = DecodeOptions {
        mode: DecodeMode::List,
        num_workers: 2,
        verbosity: -1,
        ..DecodeOptions::default()
    };
    let mut out = Vec::new();
    let err = decode_archive_indexed(&ad, &opts, &mut out).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
