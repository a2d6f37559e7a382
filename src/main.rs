// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};

use mfdlib::catalog::CatalogFileRequest;
use mfdlib::config::ExecConfig;
use mfdlib::device::{DiskChannel, FileSystemDiskDevice};
use mfdlib::exec::{AutoConsole, ConsoleExec, ExecLink};
use mfdlib::facstatus::FacResult;
use mfdlib::fspec::{self, FileSpecification};
use mfdlib::mfd::MfdManager;
use mfdlib::pack;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cmd = Command::new("mfdutil")
        .bin_name("mfdutil")
        .version("0.1.0")
        .about("Pack image and master file directory utility")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Exec configuration file (JSON)"),
        )
        .subcommand(
            Command::new("prep")
                .about("Writes a VOL1 label and initial directory track")
                .arg(Arg::new("FILE").required(true).help("The pack image to prep"))
                .arg(Arg::new("PACKNAME").required(true).help("Pack name (1-6 characters)"))
                .arg(
                    Arg::new("prep-factor")
                        .short('p')
                        .long("prep-factor")
                        .value_name("WORDS")
                        .default_value("448")
                        .help("Words per block (28, 56, 112, 224, 448, 896, or 1792)"),
                )
                .arg(
                    Arg::new("track-count")
                        .short('t')
                        .long("track-count")
                        .value_name("TRACKS")
                        .default_value("10000")
                        .help("Pack size in tracks (at least 10000)"),
                )
                .arg(
                    Arg::new("removable")
                        .long("removable")
                        .action(ArgAction::SetTrue)
                        .help("Prep as a removable pack instead of a fixed one"),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("Displays the label and directory summary of a pack image")
                .arg(Arg::new("FILE").required(true).help("The pack image to inspect")),
        )
        .subcommand(
            Command::new("init")
                .about("Initializes a fixed pool over the given pack images")
                .arg(
                    Arg::new("FILES")
                        .required(true)
                        .num_args(1..)
                        .help("Prepped fixed pack images"),
                )
                .arg(
                    Arg::new("yes")
                        .short('y')
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Answer the initialization confirmation with Y"),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("Recovers a fixed pool and lists its catalog")
                .arg(
                    Arg::new("FILES")
                        .required(true)
                        .num_args(1..)
                        .help("Initialized fixed pack images"),
                ),
        )
        .subcommand(
            Command::new("catalog")
                .about("Recovers a fixed pool and catalogs a file")
                .arg(
                    Arg::new("FSPEC")
                        .required(true)
                        .help("File specification, e.g. QUAL*FILE(+1)/RKEY/WKEY."),
                )
                .arg(
                    Arg::new("FILES")
                        .required(true)
                        .num_args(1..)
                        .help("Initialized fixed pack images"),
                )
                .arg(
                    Arg::new("mnemonic")
                        .short('m')
                        .long("mnemonic")
                        .value_name("MNEMONIC")
                        .default_value("F")
                        .help("Assign mnemonic"),
                )
                .arg(
                    Arg::new("options")
                        .short('o')
                        .long("options")
                        .value_name("LETTERS")
                        .default_value("")
                        .help("Option letters, e.g. GV"),
                ),
        );

    let matches = cmd.get_matches();
    let config = match matches.get_one::<String>("config") {
        Some(path) => ExecConfig::from_file(Path::new(path))?,
        None => ExecConfig::default(),
    };

    match matches.subcommand() {
        Some(("prep", sub)) => {
            let file = sub.get_one::<String>("FILE").unwrap();
            let pack_name = sub.get_one::<String>("PACKNAME").unwrap();
            let prep_factor: u32 = sub.get_one::<String>("prep-factor").unwrap().parse()?;
            let track_count: u64 = sub.get_one::<String>("track-count").unwrap().parse()?;
            let removable = sub.get_flag("removable");

            let mut device = FileSystemDiskDevice::open(Path::new(file))?;
            pack::prep_pack(&mut device, pack_name, prep_factor, track_count, removable)?;
            println!(
                "Prepped {} as {} ({} words/block, {} tracks{})",
                file,
                pack_name,
                prep_factor,
                track_count,
                if removable { ", removable" } else { "" }
            );
        }
        Some(("show", sub)) => {
            let file = sub.get_one::<String>("FILE").unwrap();
            let mut device = FileSystemDiskDevice::open(Path::new(file))?;
            let info = pack::pack_info(&mut device)?;
            print!("{}", info);
        }
        Some(("init", sub)) => {
            let files: Vec<PathBuf> = sub
                .get_many::<String>("FILES")
                .unwrap()
                .map(PathBuf::from)
                .collect();
            let console: Arc<dyn ExecLink> = if sub.get_flag("yes") {
                Arc::new(AutoConsole::replying("Y"))
            } else {
                Arc::new(ConsoleExec::new())
            };

            let channel = Arc::new(DiskChannel::new());
            for file in &files {
                channel.attach(FileSystemDiskDevice::open(file)?);
            }

            let manager = MfdManager::new(config, console, channel);
            if let Err(e) = manager.initialize_mass_storage() {
                return Err(format!("initialization failed: {}", e).into());
            }
            for ldat in manager.pack_ldats() {
                println!(
                    "LDAT {:04o}  {}  {} tracks free",
                    ldat,
                    manager.pack_name_of(ldat).unwrap_or_default(),
                    manager.pack_free_track_count(ldat).unwrap_or_default()
                );
            }
        }
        Some(("list", sub)) => {
            let files: Vec<PathBuf> = sub
                .get_many::<String>("FILES")
                .unwrap()
                .map(PathBuf::from)
                .collect();

            let channel = Arc::new(DiskChannel::new());
            for file in &files {
                channel.attach(FileSystemDiskDevice::open(file)?);
            }

            let manager = MfdManager::new(
                config,
                Arc::new(AutoConsole::quiet("Y")),
                channel,
            );
            if let Err(e) = manager.recover_mass_storage() {
                return Err(format!("recovery failed: {}", e).into());
            }

            println!("Qualifier*Filename          Type   Cycles");
            println!("------------------          ----   ------");
            for info in manager.list_filesets()? {
                let cycles: Vec<String> = info
                    .cycle_info
                    .iter()
                    .flatten()
                    .map(|c| c.absolute_cycle.to_string())
                    .collect();
                println!(
                    "{:<27} {:<6} {}",
                    format!("{}*{}", info.qualifier, info.filename),
                    format!("{:?}", info.file_type),
                    cycles.join(",")
                );
            }
        }
        Some(("catalog", sub)) => {
            let fspec_image = sub.get_one::<String>("FSPEC").unwrap();
            let files: Vec<PathBuf> = sub
                .get_many::<String>("FILES")
                .unwrap()
                .map(PathBuf::from)
                .collect();
            let mnemonic = sub.get_one::<String>("mnemonic").unwrap();
            let letters = sub.get_one::<String>("options").unwrap();

            let spec = FileSpecification::parse(fspec_image)
                .map_err(|code| format!("bad file specification: {:?}", code))?;
            let options = fspec::compose_options(letters)
                .map_err(|ch| format!("bad option letter: {}", ch))?;

            let channel = Arc::new(DiskChannel::new());
            for file in &files {
                channel.attach(FileSystemDiskDevice::open(file)?);
            }
            let default_qualifier = config.system_qualifier.clone();
            let manager = MfdManager::new(
                config,
                Arc::new(AutoConsole::quiet("Y")),
                channel,
            );
            if let Err(e) = manager.recover_mass_storage() {
                return Err(format!("recovery failed: {}", e).into());
            }

            let mut request = CatalogFileRequest::new(
                &spec.effective_qualifier(&default_qualifier, &default_qualifier),
                &spec.filename,
            );
            request.file_cycle = spec.file_cycle;
            request.read_key = spec.read_key.clone();
            request.write_key = spec.write_key.clone();
            request.mnemonic = mnemonic.clone();
            request.options = options;

            let mut fr = FacResult::new();
            let result = manager.catalog_file(&request, &mut fr);
            for message in fr.messages() {
                println!("{}", message);
            }
            if let Err(e) = result {
                return Err(format!("catalog failed: {}", e).into());
            }
        }
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}
