// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! Compile one SVF file per chain device into a VME file.

use std::fs;
use std::time::Instant;

use clap::{Arg, ArgAction, Command, crate_description, crate_version, value_parser};
use clap_num::si_number;

use svf2vme::{compile_chain, Config, Device, RowSize, TckLimit, Vendor};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("svf2vme")
        .version(crate_version!())
        .about(crate_description!())
        .arg_required_else_help(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet"))
        .arg(Arg::new("output")
             .help("Path of VME file to write")
             .long("output")
             .short('o')
             .action(ArgAction::Set)
             .required(true))
        .arg(Arg::new("vendor")
             .help("Vendor of every device (lattice, altera or xilinx)")
             .long("vendor")
             .action(ArgAction::Set)
             .default_value("lattice")
             .value_parser(|s: &str| s.parse::<Vendor>()))
        .arg(Arg::new("freq")
             .help("Maximum TCK frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .value_parser(si_number::<u32>))
        .arg(Arg::new("max-tck")
             .help("Longest RUNTEST TCK count before converting to a delay, or 'no'")
             .long("max-tck")
             .action(ArgAction::Set)
             .default_value("1000")
             .value_parser(|s: &str| s.parse::<TckLimit>()))
        .arg(Arg::new("row-size")
             .help("Maximum scan row in thousands of bits (8, 16, 32, 64, 128 or 256)")
             .long("row-size")
             .action(ArgAction::Set)
             .default_value("64")
             .value_parser(|s: &str| -> anyhow::Result<RowSize> { Ok(RowSize::from_kilobits(s.parse()?)?) }))
        .arg(Arg::new("full")
             .help("Store scan data uncompressed")
             .long("full")
             .action(ArgAction::SetTrue))
        .arg(Arg::new("comments")
             .help("Copy SVF comments into the VME file")
             .long("comments")
             .action(ArgAction::SetTrue))
        .arg(Arg::new("header")
             .help("Text to write as a comment at the start of the VME file")
             .long("header")
             .action(ArgAction::Set))
        .arg(Arg::new("files")
             .help("SVF files, one per device in chain order")
             .action(ArgAction::Append)
             .required(true))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    let config = Config {
        row_size: *matches.get_one::<RowSize>("row-size").unwrap(),
        compress: !matches.get_flag("full"),
        preserve_comments: matches.get_flag("comments"),
        header: matches.get_one::<String>("header").cloned(),
    };
    let device = Device {
        vendor: *matches.get_one::<Vendor>("vendor").unwrap(),
        frequency: matches.get_one::<u32>("freq").copied(),
        tck_limit: *matches.get_one::<TckLimit>("max-tck").unwrap(),
        fill: None,
    };

    let mut sources = Vec::new();
    for path in matches.get_many::<String>("files").unwrap() {
        sources.push(fs::read_to_string(path)?);
    }
    let devices: Vec<(Device, &str)> = sources.iter().map(|s| (device.clone(), s.as_str())).collect();
    let vme = compile_chain(&config, &devices)?;

    let path = matches.get_one::<String>("output").unwrap();
    fs::write(path, &vme)?;
    if !quiet {
        println!("Wrote {} bytes to {} in {:.2}s", vme.len(), path, t0.elapsed().as_secs_f32());
    }

    Ok(())
}
