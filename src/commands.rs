use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::ArgMatches;
use libtlz::archive::{
    create_archive, decode_archive, CreateOptions, DecodeMode, DecodeOptions, Solidity,
};
use libtlz::edit::{append_tdata, dump_members, nonzero_repair, remove_members};
use libtlz::fec::{
    fec_create, fec_repair, FecCreateOptions, FecData, FecIndex, RepairOutcome,
};
use libtlz::stream::{compress_stream, decompress_stream, decompress_range, list_members};
use libtlz::{Block, Error, LzipIndex, MemberList, Result};

pub fn dispatch(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("compress", m)) => compress(m),
        Some(("decompress", m)) => decompress(m),
        Some(("list", m)) => list(m),
        Some(("cat", m)) => cat(m),
        Some(("create", m)) => create(m),
        Some(("tlist", m)) => decode(m, DecodeMode::List),
        Some(("extract", m)) => decode(m, DecodeMode::Extract),
        Some(("fec", m)) => fec(m),
        Some(("edit", m)) => edit(m),
        _ => unreachable!("subcommand required"),
    }
}

fn input_path(matches: &ArgMatches) -> PathBuf {
    PathBuf::from(matches.get_one::<String>("input").unwrap())
}

fn verbosity(matches: &ArgMatches) -> i32 {
    matches.get_count("verbose") as i32
}

fn compress(matches: &ArgMatches) -> Result<()> {
    let input = input_path(matches);
    let output = match matches.get_one::<String>("output") {
        Some(name) => PathBuf::from(name),
        None => {
            let mut name = input.clone().into_os_string();
            name.push(".lz");
            PathBuf::from(name)
        }
    };
    let level = *matches.get_one::<usize>("level").unwrap();
    let infile = File::open(&input)?;
    let outfile = BufWriter::new(File::create(&output)?);
    let stats = compress_stream(infile, outfile, level)?;
    if verbosity(matches) >= 1 {
        eprintln!(
            "{}: {} bytes in, {} bytes out",
            input.display(),
            stats.data_size,
            stats.member_size
        );
    }
    Ok(())
}

fn decompress(matches: &ArgMatches) -> Result<()> {
    let input = input_path(matches);
    let output = match matches.get_one::<String>("output") {
        Some(name) => PathBuf::from(name),
        None => match input.extension() {
            Some(ext) if ext == "lz" => input.with_extension(""),
            _ => {
                return Err(Error::Invalid(format!(
                    "{}: Unknown extension; use --output.",
                    input.display()
                )))
            }
        },
    };
    let infile = File::open(&input)?;
    let mut outfile = BufWriter::new(File::create(&output)?);
    let ignore_trailing = !matches.get_flag("no-ignore-trailing");
    let result = decompress_stream(infile, &mut outfile, ignore_trailing);
    match result {
        Ok(stats) => {
            if verbosity(matches) >= 1 {
                eprintln!(
                    "{}: {} members, {} bytes out",
                    input.display(),
                    stats.members,
                    stats.data_size
                );
            }
            Ok(())
        }
        Err(e) => {
            // do not leave a partial output file behind
            drop(outfile);
            let _ = std::fs::remove_file(&output);
            Err(e)
        }
    }
}

fn list(matches: &ArgMatches) -> Result<()> {
    let input = input_path(matches);
    let file = File::open(&input)?;
    let index = LzipIndex::new(&file, false)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "   dict   compressed  uncompressed  member")?;
    for info in list_members(&index) {
        writeln!(
            out,
            "{:7} {:12} {:13} {:7}",
            info.dictionary_size, info.member_size, info.data_size, info.member
        )?;
    }
    Ok(())
}

fn cat(matches: &ArgMatches) -> Result<()> {
    let input = input_path(matches);
    let from = *matches.get_one::<u64>("from").unwrap();
    let size = *matches.get_one::<u64>("size").unwrap();
    let file = File::open(&input)?;
    let index = LzipIndex::new(&file, false)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    decompress_range(&file, &index, Block::new(from, size), &mut out)?;
    Ok(())
}

fn create(matches: &ArgMatches) -> Result<()> {
    let archive = PathBuf::from(matches.get_one::<String>("archive").unwrap());
    let solidity = match matches.get_one::<String>("solidity").unwrap().as_str() {
        "no-solid" => Solidity::NoSolid,
        "dsolid" => Solidity::DSolid,
        "asolid" => Solidity::ASolid,
        "solid" => Solidity::Solid,
        _ => Solidity::BSolid,
    };
    let opts = CreateOptions {
        level: *matches.get_one::<usize>("level").unwrap(),
        solidity,
        data_size: matches.get_one::<u64>("data-size").copied().unwrap_or(0),
        num_workers: *matches.get_one::<usize>("workers").unwrap(),
        recursive: !matches.get_flag("no-recursive"),
        verbosity: verbosity(matches),
    };
    let files: Vec<PathBuf> = matches
        .get_many::<String>("files")
        .unwrap()
        .map(PathBuf::from)
        .collect();
    let mut out = BufWriter::new(File::create(&archive)?);
    match create_archive(&opts, &files, &mut out) {
        Ok(()) => Ok(()),
        // skipped files leave a usable archive behind
        Err(e @ Error::Invalid(_)) => Err(e),
        Err(e) => {
            drop(out);
            let _ = std::fs::remove_file(&archive);
            Err(e)
        }
    }
}

fn decode(matches: &ArgMatches, mode: DecodeMode) -> Result<()> {
    let archive = PathBuf::from(matches.get_one::<String>("archive").unwrap());
    let opts = DecodeOptions {
        mode,
        num_workers: *matches.get_one::<usize>("workers").unwrap(),
        permissive: matches.get_flag("permissive"),
        missing_crc: matches.get_flag("missing-crc"),
        keep_damaged: matches
            .try_get_one::<bool>("keep-damaged")
            .ok()
            .flatten()
            .copied()
            .unwrap_or(false),
        verbosity: verbosity(matches),
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    decode_archive(&archive, &opts, &mut out)
}

fn fec_sidecar_path(matches: &ArgMatches, input: &Path) -> PathBuf {
    match matches.get_one::<String>("fec-file") {
        Some(name) => PathBuf::from(name),
        None => {
            let mut name = input.to_path_buf().into_os_string();
            name.push(".fec");
            PathBuf::from(name)
        }
    }
}

fn fec(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("create", m)) => {
            let input = input_path(m);
            let output = match m.get_one::<String>("output") {
                Some(name) => PathBuf::from(name),
                None => fec_sidecar_path(m, &input),
            };
            let prodata = FecData::open(&input)?;
            let opts = FecCreateOptions {
                fec_block_size: *m.get_one::<u64>("fbs").unwrap(),
                fec_blocks: *m.get_one::<usize>("blocks").unwrap(),
                crc32: m.get_flag("crc32"),
                crc32c: true,
            };
            let sidecar = fec_create(&prodata, &opts)?;
            std::fs::write(&output, sidecar)?;
            Ok(())
        }
        Some(("test", m)) => {
            let input = input_path(m);
            let fec_path = fec_sidecar_path(m, &input);
            let is_lz = input.extension().is_some_and(|e| e == "lz" || e == "tlz");
            let index = FecIndex::open(&fec_path, m.get_flag("ignore-errors"), is_lz)?;
            let prodata = FecData::open(&input)?;
            match fec_repair(&index, &prodata)? {
                (RepairOutcome::Good, _) => {
                    if verbosity(m) >= 1 {
                        eprintln!("Protected data checked successfully.");
                    }
                    Ok(())
                }
                (RepairOutcome::TooManyErrors { bad_blocks, fec_blocks }, _) => {
                    Err(Error::Corrupt(format!(
                        "Too many damaged blocks ({}).\n  Can't repair file if it \
                         contains more than {} damaged blocks.",
                        bad_blocks, fec_blocks
                    )))
                }
                _ => Err(Error::Corrupt("Protected data does not check.".into())),
            }
        }
        Some(("repair", m)) => {
            let input = input_path(m);
            let fec_path = fec_sidecar_path(m, &input);
            let is_lz = input.extension().is_some_and(|e| e == "lz" || e == "tlz");
            let index = FecIndex::open(&fec_path, m.get_flag("ignore-errors"), is_lz)?;
            let prodata = FecData::open(&input)?;
            let (outcome, repaired) = fec_repair(&index, &prodata)?;
            match outcome {
                RepairOutcome::Good => {
                    if verbosity(m) >= 1 {
                        eprintln!("Protected data checked successfully. Repair not needed.");
                    }
                    Ok(())
                }
                RepairOutcome::Repaired => {
                    let output = match m.get_one::<String>("output") {
                        Some(name) => PathBuf::from(name),
                        None => {
                            let mut name = input.clone().into_os_string();
                            name.push(".fixed");
                            PathBuf::from(name)
                        }
                    };
                    std::fs::write(&output, repaired.unwrap())?;
                    if verbosity(m) >= 1 {
                        eprintln!(
                            "Repaired copy of '{}' written to '{}'",
                            input.display(),
                            output.display()
                        );
                    }
                    Ok(())
                }
                RepairOutcome::TooManyErrors { bad_blocks, fec_blocks } => {
                    Err(Error::Corrupt(format!(
                        "Too many damaged blocks ({}).\n  Can't repair file if it \
                         contains more than {} damaged blocks.",
                        bad_blocks, fec_blocks
                    )))
                }
                RepairOutcome::VerifyFailed => {
                    Err(Error::Corrupt("Repair failed; MD5 mismatch.".into()))
                }
            }
        }
        Some(("list", m)) => {
            let input = input_path(m);
            let index = FecIndex::open(&input, m.get_flag("ignore-errors"), false)?;
            println!(
                "Protected size: {:11}   Block size: {:5}   Data blocks: {}",
                index.prodata_size(),
                index.fec_block_size(),
                index.prodata_blocks()
            );
            println!(
                "      Fec size: {:11}   Fec blocks: {}",
                index.fec_net_size(),
                index.fec_blocks()
            );
            println!(
                "      Features: GF(2^{}){}{}",
                if index.gf16() { "16" } else { "8" },
                if index.crc_array().is_some() { " CRC32" } else { "" },
                if index.crcc_array().is_some() { " CRC32-C" } else { "" },
            );
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

fn parse_selection(arg: &str) -> Result<MemberList> {
    match arg {
        "damaged" => Ok(MemberList::damaged_only()),
        "empty" => Ok(MemberList {
            empty: true,
            ..MemberList::new()
        }),
        "tdata" => Ok(MemberList::tdata_only()),
        range => {
            let (first, last) = match range.split_once('-') {
                Some((a, b)) => (a, b),
                None => (range, range),
            };
            let first: u64 = first
                .parse()
                .map_err(|_| Error::Invalid(format!("Invalid selection '{}'.", range)))?;
            let last: u64 = last
                .parse()
                .map_err(|_| Error::Invalid(format!("Invalid selection '{}'.", range)))?;
            if last < first {
                return Err(Error::Invalid(format!("Invalid selection '{}'.", range)));
            }
            Ok(MemberList::from_range(first, last - first + 1))
        }
    }
}

fn edit(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("dump", m)) | Some(("strip", m)) => {
            let strip = matches.subcommand().unwrap().0 == "strip";
            let input = input_path(m);
            let member_list = parse_selection(m.get_one::<String>("select").unwrap())?;
            let file = File::open(&input)?;
            let index = LzipIndex::new(&file, false)?;
            match m.get_one::<String>("output") {
                Some(name) => {
                    let mut out = BufWriter::new(File::create(name)?);
                    dump_members(&file, &index, &member_list, strip, &mut out)?;
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut out = stdout.lock();
                    dump_members(&file, &index, &member_list, strip, &mut out)?;
                }
            }
            Ok(())
        }
        Some(("remove", m)) => {
            let input = input_path(m);
            let member_list = parse_selection(m.get_one::<String>("select").unwrap())?;
            remove_members(&input, &member_list)?;
            Ok(())
        }
        Some(("nonzero-repair", m)) => {
            let input = input_path(m);
            let cleared = nonzero_repair(&input)?;
            eprintln!(
                "{} {} cleared.",
                cleared,
                if cleared == 1 { "member" } else { "members" }
            );
            Ok(())
        }
        Some(("append-tdata", m)) => {
            let input = input_path(m);
            let data = std::fs::read(m.get_one::<String>("data").unwrap())?;
            append_tdata(&input, &data, m.get_flag("boxed"))
        }
        _ => unreachable!("subcommand required"),
    }
}
