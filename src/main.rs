mod commands;

use std::process;

use clap::{Arg, ArgAction, Command, value_parser};

fn build_command() -> Command {
    let archive_arg = Arg::new("archive")
        .help("Archive file")
        .short('f')
        .long("file")
        .value_name("ARCHIVE")
        .required(true);
    let workers_arg = Arg::new("workers")
        .help("Number of worker threads")
        .short('n')
        .long("threads")
        .value_name("N")
        .value_parser(value_parser!(usize))
        .default_value("2");
    let level_arg = Arg::new("level")
        .help("Compression level (0-9)")
        .short('l')
        .long("level")
        .value_name("N")
        .value_parser(value_parser!(usize))
        .default_value("6");
    let verbose_arg = Arg::new("verbose")
        .help("Show more information")
        .short('v')
        .long("verbose")
        .action(ArgAction::Count);
    let output_arg = Arg::new("output")
        .help("Output file (defaults derive from the input name)")
        .short('o')
        .long("output")
        .value_name("FILE");
    let fec_file_arg = Arg::new("fec-file")
        .help("Fec sidecar file (defaults to FILE.fec)")
        .long("fec")
        .value_name("FECFILE");

    Command::new("tlz")
        .about("Archiver and recovery toolkit for the lzip format")
        .version(env!("CARGO_PKG_VERSION"))
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("compress")
                .about("Compress a file into a lzip member")
                .arg(Arg::new("input").value_name("FILE").required(true))
                .arg(level_arg.clone())
                .arg(output_arg.clone())
                .arg(verbose_arg.clone()),
        )
        .subcommand(
            Command::new("decompress")
                .about("Decompress a (multimember) lzip file")
                .arg(Arg::new("input").value_name("FILE").required(true))
                .arg(output_arg.clone())
                .arg(
                    Arg::new("no-ignore-trailing")
                        .help("Reject trailing data after the last member")
                        .long("no-ignore-trailing")
                        .action(ArgAction::SetTrue),
                )
                .arg(verbose_arg.clone()),
        )
        .subcommand(
            Command::new("list")
                .about("List the members of a lzip file")
                .arg(Arg::new("input").value_name("FILE").required(true))
                .arg(verbose_arg.clone()),
        )
        .subcommand(
            Command::new("cat")
                .about("Decompress a byte range of the decoded data to stdout")
                .arg(Arg::new("input").value_name("FILE").required(true))
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("POS")
                        .value_parser(value_parser!(u64))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("size")
                        .long("size")
                        .value_name("BYTES")
                        .value_parser(value_parser!(u64))
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("create")
                .about("Create a tar.lz archive")
                .arg(archive_arg.clone())
                .arg(level_arg.clone())
                .arg(workers_arg.clone())
                .arg(
                    Arg::new("solidity")
                        .help("Member grouping policy")
                        .long("solidity")
                        .value_name("POLICY")
                        .value_parser(["no-solid", "bsolid", "dsolid", "asolid", "solid"])
                        .default_value("bsolid"),
                )
                .arg(
                    Arg::new("data-size")
                        .help("Target member data size for bsolid")
                        .short('B')
                        .long("data-size")
                        .value_name("BYTES")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("no-recursive")
                        .long("no-recursive")
                        .action(ArgAction::SetTrue),
                )
                .arg(verbose_arg.clone())
                .arg(
                    Arg::new("files")
                        .value_name("FILES")
                        .num_args(1..)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("tlist")
                .about("List the contents of a tar.lz archive")
                .arg(archive_arg.clone())
                .arg(workers_arg.clone())
                .arg(
                    Arg::new("permissive")
                        .long("permissive")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("missing-crc")
                        .help("Reject extended records without a CRC record")
                        .long("missing-crc")
                        .action(ArgAction::SetTrue),
                )
                .arg(verbose_arg.clone()),
        )
        .subcommand(
            Command::new("extract")
                .about("Extract the contents of a tar.lz archive")
                .arg(archive_arg.clone())
                .arg(workers_arg.clone())
                .arg(
                    Arg::new("permissive")
                        .long("permissive")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("missing-crc")
                        .long("missing-crc")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("keep-damaged")
                        .help("Keep the decoded prefix of damaged files")
                        .long("keep-damaged")
                        .action(ArgAction::SetTrue),
                )
                .arg(verbose_arg.clone()),
        )
        .subcommand(
            Command::new("fec")
                .about("Create, test, and use forward-error-correction data")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(output_arg.clone())
                        .arg(
                            Arg::new("fbs")
                                .help("Fec block size (multiple of 4)")
                                .long("fbs")
                                .value_name("BYTES")
                                .value_parser(value_parser!(u64))
                                .default_value("4096"),
                        )
                        .arg(
                            Arg::new("blocks")
                                .help("Number of fec blocks to generate")
                                .long("blocks")
                                .value_name("N")
                                .value_parser(value_parser!(usize))
                                .default_value("4"),
                        )
                        .arg(
                            Arg::new("crc32")
                                .help("Also store a CRC32 array")
                                .long("crc32")
                                .action(ArgAction::SetTrue),
                        ),
                )
                .subcommand(
                    Command::new("test")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(fec_file_arg.clone())
                        .arg(
                            Arg::new("ignore-errors")
                                .long("ignore-errors")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(verbose_arg.clone()),
                )
                .subcommand(
                    Command::new("repair")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(fec_file_arg.clone())
                        .arg(output_arg.clone())
                        .arg(
                            Arg::new("ignore-errors")
                                .long("ignore-errors")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(verbose_arg.clone()),
                )
                .subcommand(
                    Command::new("list")
                        .arg(Arg::new("input").value_name("FECFILE").required(true))
                        .arg(
                            Arg::new("ignore-errors")
                                .long("ignore-errors")
                                .action(ArgAction::SetTrue),
                        ),
                ),
        )
        .subcommand(
            Command::new("edit")
                .about("Surgical edits over an indexed multimember file")
                .subcommand_required(true)
                .subcommand(
                    Command::new("dump")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(output_arg.clone())
                        .arg(selection_args()),
                )
                .subcommand(
                    Command::new("strip")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(output_arg.clone())
                        .arg(selection_args()),
                )
                .subcommand(
                    Command::new("remove")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(selection_args()),
                )
                .subcommand(
                    Command::new("nonzero-repair")
                        .arg(Arg::new("input").value_name("FILE").required(true)),
                )
                .subcommand(
                    Command::new("append-tdata")
                        .arg(Arg::new("input").value_name("FILE").required(true))
                        .arg(
                            Arg::new("data")
                                .help("File whose bytes are appended")
                                .long("data")
                                .value_name("FILE")
                                .required(true),
                        )
                        .arg(
                            Arg::new("boxed")
                                .help("Wrap the data in a TDATABOX")
                                .long("boxed")
                                .action(ArgAction::SetTrue),
                        ),
                ),
        )
}

fn selection_args() -> Arg {
    Arg::new("select")
        .help("Member selection: N, N-M, 'damaged', 'empty', or 'tdata'")
        .long("select")
        .value_name("WHAT")
        .required(true)
}

fn main() {
    let matches = build_command().get_matches();
    match commands::dispatch(&matches) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("tlz: {}", e);
            process::exit(e.exit_code());
        }
    }
}
