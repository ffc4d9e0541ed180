//! End-to-end create/extract round trip. Runs as a single test because
//! extraction resolves member names against the current directory.

use std::fs;
use std::path::PathBuf;

use libtlz::archive::{
    create_archive, decode_archive_indexed, ArchiveDescriptor, CreateOptions, DecodeMode,
    DecodeOptions, Solidity,
};

#[test]
fn create_then_extract_round_trip() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let archive_path = src_dir.path().join("backup.tar.lz");

    // build a source tree with data, an empty file, a subdirectory, a
    // name too long for the ustar name field, and a symlink
    std::env::set_current_dir(src_dir.path()).unwrap();
    fs::create_dir("tree").unwrap();
    fs::write("tree/small.txt", b"twelve bytes").unwrap();
    fs::write("tree/empty", b"").unwrap();
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 77) as u8).collect();
    fs::write("tree/big.bin", &big).unwrap();
    fs::create_dir("tree/deep").unwrap();
    let long_name = format!("tree/deep/{}.dat", "x".repeat(120));
    fs::write(&long_name, b"long named file").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("small.txt", "tree/link").unwrap();

    let opts = CreateOptions {
        level: 1,
        solidity: Solidity::BSolid,
        data_size: 8192,
        num_workers: 3,
        verbosity: -1,
        ..CreateOptions::default()
    };
    let mut out = Vec::new();
    create_archive(&opts, &[PathBuf::from("tree")], &mut out).unwrap();
    fs::write(&archive_path, &out).unwrap();

    // extract into a fresh directory with parallel workers
    std::env::set_current_dir(dst_dir.path()).unwrap();
    let ad = ArchiveDescriptor::open(&archive_path).unwrap();
    let opts = DecodeOptions {
        mode: DecodeMode::Extract,
        num_workers: 3,
        verbosity: -1,
        ..DecodeOptions::default()
    };
    let mut sink = Vec::new();
    decode_archive_indexed(&ad, &opts, &mut sink).unwrap();

    assert_eq!(fs::read("tree/small.txt").unwrap(), b"twelve bytes");
    assert_eq!(fs::read("tree/empty").unwrap(), b"");
    assert_eq!(fs::read("tree/big.bin").unwrap(), big);
    assert_eq!(fs::read(&long_name).unwrap(), b"long named file");
    #[cfg(unix)]
    {
        let target = fs::read_link("tree/link").unwrap();
        assert_eq!(target, PathBuf::from("small.txt"));
    }

    // keep the temp dirs alive until the end
    drop(ad);
    std::env::set_current_dir("/").unwrap();
}
