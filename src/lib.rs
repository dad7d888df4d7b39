//! # iechost
//!
//! Host-side library for operating Commodore IEC-bus peripherals
//! (notably the CBM 1541 floppy drive) through a microcontroller acting
//! as a serial-to-IEC bridge.
//!
//! ## Overview
//! The crate has two layers. [`BusConnection`] speaks the bridge's
//! framed serial dialect: it performs the `connect_arduino` handshake,
//! runs a background thread that demultiplexes data, status and debug
//! frames, and exposes synchronous channel operations. On top of that,
//! [`Cbm1541Drive`] orchestrates command-channel dialogs that upload
//! machine-code routines into drive RAM and drive raw sector I/O and
//! low-level formatting through them. [`ImageDrive`] implements the
//! same [`BlockDrive`] contract against a `.d64` image file, so discs
//! can be copied between the two.
//!
//! ## Quick Start
//! ```ignore
//! use iechost::{BlockDrive, BusConfig, BusConnection, Cbm1541Drive, log_to_facade};
//!
//! fn main() -> Result<(), iechost::Error> {
//!     let bus = BusConnection::open(
//!         "/dev/ttyUSB0",
//!         57600,
//!         BusConfig::default(),
//!         log_to_facade(),
//!     )?;
//!     bus.reset()?;
//!
//!     let mut drive = Cbm1541Drive::new(&bus, 9)?;
//!     let sector = drive.read_sector(357)?;
//!     println!("track 18 sector 0: {:02x?}", &sector[..16]);
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//! A [`BusConnection`] may be shared between threads; requests are
//! serialized internally and exactly one is in flight at a time. The
//! background reader is the only thread that reads the serial device
//! after the handshake, and it is joined before the device is closed.
//!
//! ## Error Handling
//! Every fallible operation returns [`Result`] with [`Error`]. Status
//! text from the bridge and the drive is passed through unchanged.

pub mod bus;
pub mod cbm1541;
mod demux;
pub mod drive;
pub mod error;
pub mod escape;
pub mod framing;
pub mod image;
pub mod serial;
pub mod status;

pub use bus::{log_to_facade, BusConfig, BusConnection, LogCallback};
pub use cbm1541::{sector_location, Cbm1541Drive, FirmwareMode, TOTAL_SECTORS};
pub use drive::{BlockDrive, SECTOR_SIZE};
pub use error::Error;
pub use image::ImageDrive;
pub use serial::{open_serial, SerialLink, DEFAULT_BAUD_RATE};
pub use status::DriveStatus;

/// Lowest IEC device number a disk drive can use.
pub const MIN_DEVICE_NUM: u8 = 8;

/// Highest IEC device number a disk drive can use.
pub const MAX_DEVICE_NUM: u8 = 15;

/// Conventional device number of the first disk drive.
pub const DEFAULT_DEVICE_NUM: u8 = 8;
