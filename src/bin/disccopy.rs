//! Copy a `.d64` disc image onto a real drive over the IEC bridge.

use clap::Parser;
use iechost::{
    log_to_facade, BlockDrive, BusConfig, BusConnection, Cbm1541Drive, ImageDrive,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn, LevelFilter};
use std::path::PathBuf;
use std::process::exit;

#[derive(Parser, Debug)]
#[command(name = "disccopy")]
#[command(about = "IEC bus disc copy utility", long_about = None)]
struct Args {
    /// Serial interface the bridge is connected to
    #[arg(long, default_value = "/dev/ttyUSB0")]
    serial: String,

    /// Baud rate of the bridge serial link
    #[arg(long, default_value_t = iechost::DEFAULT_BAUD_RATE)]
    speed: u32,

    /// Disk image to copy from
    #[arg(long)]
    source: PathBuf,

    /// Device number to copy to (8-15)
    #[arg(long, default_value_t = 9)]
    target: u8,

    /// Low-level format the disc prior to copying
    #[arg(long)]
    format: bool,

    /// Read back each written sector and compare
    #[arg(long)]
    verify: bool,

    /// Verbosity (-v for Info, -vv for Debug, -vvv for Trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .init();

    if let Err(e) = run(&args) {
        eprintln!("{e}");
        exit(1);
    }
}

fn run(args: &Args) -> Result<(), iechost::Error> {
    println!("IEC bus disc copy utility.");
    println!();

    let connection = BusConnection::open(
        &args.serial,
        args.speed,
        BusConfig::default(),
        log_to_facade(),
    )?;

    connection.reset()?;

    // The command channel needs no open call; an initial status read
    // doubles as a liveness check and clears the power-on banner.
    let initial = connection.read_from_channel(args.target, 15)?;
    println!(
        "Initial drive status: {}",
        String::from_utf8_lossy(&initial).trim_end()
    );

    let mut drive = Cbm1541Drive::new(&connection, args.target)?;

    if args.format {
        println!("Formatting disc...");
        drive.format_low_level(40)?;
        println!("Formatting complete.");
    }

    println!("Opening source '{}'.", args.source.display());
    let mut reader = ImageDrive::new(&args.source, true)?;

    let num_sectors = reader.num_sectors().min(drive.num_sectors());
    for sector in 0..num_sectors {
        let data = reader.read_sector(sector)?;
        drive.write_sector(sector, &data)?;

        if args.verify {
            let readback = drive.read_sector(sector)?;
            if readback != data {
                println!("Verification failed (sector {sector}):");
                println!("Original sector ({} bytes):", data.len());
                println!("{}", to_hex(&data));
                println!("Read sector ({} bytes):", readback.len());
                println!("{}", to_hex(&readback));
            }
        }

        if (sector + 1) % 100 == 0 {
            info!("Copied {} of {num_sectors} sectors", sector + 1);
        }
    }

    let status = drive.drive_status()?;
    println!("Copying status: {status}");
    Ok(())
}
