//! Capability contract for sector-addressed drives.

use crate::error::Error;

/// Bytes in one sector.
pub const SECTOR_SIZE: usize = 256;

/// A drive that exposes its disc as a linear array of 256-byte
/// sectors.
///
/// Two implementations exist: [`Cbm1541Drive`](crate::Cbm1541Drive)
/// talks to real hardware over the bridge, and
/// [`ImageDrive`](crate::ImageDrive) is backed by a `.d64` image file.
/// Callers that copy between media only see this trait.
pub trait BlockDrive {
    /// Low-level format covering `num_tracks` tracks. On hardware this
    /// rewrites the disc surface and can take on the order of a
    /// minute.
    fn format_low_level(&mut self, num_tracks: usize) -> Result<(), Error>;

    /// Number of addressable sectors.
    fn num_sectors(&self) -> usize;

    /// Read the sector at linear index `sector`. Exactly
    /// [`SECTOR_SIZE`] bytes on success.
    fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>, Error>;

    /// Write [`SECTOR_SIZE`] bytes to the sector at linear index
    /// `sector`.
    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), Error>;
}
