//! PicoSCSI image tooling
//!
//! Works directly on a LUN directory tree on the host, without a companion.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::*;

use picoscsi_core::config::EmulatorConfig;
use picoscsi_core::fcode::{CR, FCode};
use picoscsi_core::filesystem::Filesystem;
use picoscsi_core::filesystem::descriptor::LunDescriptor;
use picoscsi_core::filesystem::store::{DirStore, ImageStore};
use picoscsi_core::types::{LUN_COUNT, SECTOR_SIZE};

#[derive(Parser)]
#[command(name = "picoscsi")]
#[command(about = "PicoSCSI drive image tooling", long_about = None)]
#[command(after_help = r#"EXAMPLES:
    picoscsi dsc-create 0 1                  Descriptor for BeebSCSI0/scsi1.dat
    picoscsi dsc-show 0 1                    Show BeebSCSI0/scsi1.dsc
    picoscsi format 2 0 -c 306 -H 4          Create a 10 MB LUN 0 in BeebSCSI2
    picoscsi check 0                         Validate all LUNs of BeebSCSI0
    picoscsi dump 0 0 0 --count 2            Hex dump sectors 0-1 of LUN 0
    picoscsi fcode "?U"                      Decode an F-code
"#)]
struct Cli {
    /// Directory holding the LUN directories
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a descriptor whose geometry covers an existing image
    DscCreate { directory: u8, lun: u8 },

    /// Show a LUN descriptor
    DscShow { directory: u8, lun: u8 },

    /// Allocate an image to the size its descriptor describes
    Format {
        directory: u8,
        lun: u8,

        /// Write a new descriptor with this many cylinders first
        #[arg(short, long, requires = "heads")]
        cylinders: Option<u16>,

        /// Head count for the new descriptor
        #[arg(short = 'H', long, requires = "cylinders")]
        heads: Option<u8>,
    },

    /// Validate the images of a LUN directory
    Check {
        directory: u8,

        /// Only check this LUN
        #[arg(short, long)]
        lun: Option<u8>,
    },

    /// Hex dump sectors of a LUN image
    Dump {
        directory: u8,
        lun: u8,
        sector: u32,

        #[arg(short, long, default_value_t = 1)]
        count: u32,
    },

    /// Decode an F-code command
    Fcode {
        command: String,

        /// Command is given as hex bytes
        #[arg(long)]
        hex: bool,
    },
}

fn open(cli: &Cli, directory: u8) -> Result<Filesystem<DirStore>> {
    let config = match &cli.config {
        Some(path) => EmulatorConfig::load(path)?,
        None => EmulatorConfig::default(),
    };
    let mut fs = Filesystem::new(DirStore::new(&cli.root), &config);
    fs.set_lun_directory(directory);
    Ok(fs)
}

fn dsc_create(fs: &mut Filesystem<DirStore>, directory: u8, lun: u8) -> Result<()> {
    let image = fs.image_path(directory, lun);
    let size = fs
        .store()
        .file_size(&image)
        .with_context(|| format!("Cannot size {}", image.display()))?;
    let d = fs.create_dsc_from_image_size(directory, lun, size)?;
    println!("{}", d);
    Ok(())
}

fn dsc_show(fs: &mut Filesystem<DirStore>, lun: u8) -> Result<()> {
    let raw = fs.read_lun_descriptor(lun)?;
    let d = LunDescriptor::from_bytes(&raw)?;
    println!("Raw:                     {}", hex::encode(raw));
    println!("{}", d);
    Ok(())
}

fn format(
    fs: &mut Filesystem<DirStore>,
    lun: u8,
    geometry: Option<(u16, u8)>,
) -> Result<()> {
    if let Some((cylinders, heads)) = geometry {
        if heads == 0 || cylinders == 0 {
            bail!("Geometry {} cylinders, {} heads is empty", cylinders, heads);
        }
        fs.create_lun_image(lun)?;
        fs.create_lun_descriptor(lun)?;
        let d = LunDescriptor::from_geometry(cylinders, heads);
        fs.write_lun_descriptor(lun, &d.to_bytes()?)?;
    }
    fs.format_lun(lun, 0xE5)?;
    println!(
        "Formatted {} ({} bytes)",
        fs.image_path(fs.lun_directory(), lun).display(),
        fs.lun_size_from_dsc(fs.lun_directory(), lun)?
    );
    Ok(())
}

fn check(fs: &mut Filesystem<DirStore>, directory: u8, only: Option<u8>) -> Result<()> {
    let luns: Vec<u8> = match only {
        Some(lun) => vec![lun],
        None => (0..LUN_COUNT as u8).collect(),
    };
    let mut failed = 0;
    for lun in luns {
        let image = fs.image_path(directory, lun);
        if only.is_none() && !fs.store().exists(&image) {
            continue;
        }
        match fs.check_lun_image(lun) {
            Ok(()) => {
                let unit = fs.lun(lun).context("LUN out of range")?;
                let capacity = unit.geometry.as_ref().map_or(0, |g| g.capacity_bytes());
                println!(
                    "LUN {}: ok, {} bytes described, user code {}",
                    lun,
                    capacity,
                    hex::encode(unit.user_code)
                );
            }
            Err(e) => {
                println!("LUN {}: {}", lun, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} LUN(s) failed validation", failed);
    }
    Ok(())
}

fn dump(fs: &mut Filesystem<DirStore>, lun: u8, start: u32, count: u32) -> Result<()> {
    let mut sector = [0; SECTOR_SIZE];
    fs.open_for_read(lun, start, count)?;
    for n in 0..count {
        fs.read_next_sector(&mut sector)?;
        let base = (u64::from(start) + u64::from(n)) * SECTOR_SIZE as u64;
        for (i, row) in sector.chunks(16).enumerate() {
            let text: String = row
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            println!("{:08X}  {:<32}  {}", base + i as u64 * 16, hex::encode(row), text);
        }
    }
    fs.close_for_read();
    debug!("Dumped {} sectors", count);
    Ok(())
}

fn fcode(command: &str, is_hex: bool) -> Result<()> {
    let mut bytes = if is_hex {
        hex::decode(command.replace(' ', "")).context("Invalid hex")?
    } else {
        command.as_bytes().to_vec()
    };
    if !bytes.contains(&CR) {
        bytes.push(CR);
    }
    let decoded = FCode::decode(&bytes);
    println!("{}: {}", hex::encode(&bytes), decoded);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::DscCreate { directory, lun } => {
            dsc_create(&mut open(&cli, *directory)?, *directory, *lun)
        }
        Commands::DscShow { directory, lun } => dsc_show(&mut open(&cli, *directory)?, *lun),
        Commands::Format {
            directory,
            lun,
            cylinders,
            heads,
        } => {
            let geometry = cylinders.zip(*heads);
            format(&mut open(&cli, *directory)?, *lun, geometry)
        }
        Commands::Check { directory, lun } => {
            check(&mut open(&cli, *directory)?, *directory, *lun)
        }
        Commands::Dump {
            directory,
            lun,
            sector,
            count,
        } => dump(&mut open(&cli, *directory)?, *lun, *sector, *count),
        Commands::Fcode { command, hex } => fcode(command, *hex),
    }
}
