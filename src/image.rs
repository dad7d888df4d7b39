//! [`BlockDrive`] implementation backed by a `.d64` image file.
//!
//! A `.d64` is the sectors of a 35-track disc concatenated in layout
//! order, so linear sector addressing maps straight onto file offsets.

use crate::cbm1541::TOTAL_SECTORS;
use crate::drive::{BlockDrive, SECTOR_SIZE};
use crate::error::Error;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct ImageDrive {
    file: File,
    path: PathBuf,
    read_only: bool,
    num_sectors: usize,
}

impl ImageDrive {
    /// Open an existing image. The file length must be a whole number
    /// of sectors.
    pub fn new(path: impl AsRef<Path>, read_only: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| Error::from_io(&format!("open(\"{}\")", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::from_io("stat image", e))?
            .len() as usize;
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument(format!(
                "image \"{}\" is {len} bytes, not a whole number of sectors",
                path.display()
            )));
        }
        let num_sectors = len / SECTOR_SIZE;
        if num_sectors != TOTAL_SECTORS {
            warn!(
                "Image \"{}\" has {num_sectors} sectors, a standard disc has {TOTAL_SECTORS}",
                path.display()
            );
        }
        Ok(ImageDrive {
            file,
            path,
            read_only,
            num_sectors,
        })
    }

    /// Create a blank standard-size image, overwriting any existing
    /// file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)
            .map_err(|e| Error::from_io(&format!("create(\"{}\")", path.display()), e))?;
        let zeros = vec![0u8; SECTOR_SIZE];
        for _ in 0..TOTAL_SECTORS {
            file.write_all(&zeros)
                .map_err(|e| Error::from_io("write image", e))?;
        }
        drop(file);
        Self::new(path, false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_sector(&self, sector: usize) -> Result<u64, Error> {
        if sector >= self.num_sectors {
            return Err(Error::invalid_argument(format!(
                "sector {sector} out of range (image has {} sectors)",
                self.num_sectors
            )));
        }
        Ok((sector * SECTOR_SIZE) as u64)
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::invalid_argument(format!(
                "image \"{}\" is read-only",
                self.path.display()
            )))
        } else {
            Ok(())
        }
    }
}

impl BlockDrive for ImageDrive {
    fn format_low_level(&mut self, _num_tracks: usize) -> Result<(), Error> {
        self.check_writable()?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::from_io("seek image", e))?;
        let zeros = vec![0u8; SECTOR_SIZE];
        for _ in 0..self.num_sectors {
            self.file
                .write_all(&zeros)
                .map_err(|e| Error::from_io("write image", e))?;
        }
        self.file
            .flush()
            .map_err(|e| Error::from_io("flush image", e))
    }

    fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>, Error> {
        let offset = self.check_sector(sector)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::from_io("seek image", e))?;
        let mut data = vec![0u8; SECTOR_SIZE];
        self.file
            .read_exact(&mut data)
            .map_err(|e| Error::from_io("read image", e))?;
        Ok(data)
    }

    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), Error> {
        self.check_writable()?;
        if data.len() != SECTOR_SIZE {
            return Err(Error::invalid_argument(format!(
                "sector payload must be {SECTOR_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let offset = self.check_sector(sector)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::from_io("seek image", e))?;
        self.file
            .write_all(data)
            .map_err(|e| Error::from_io("write image", e))?;
        self.file
            .flush()
            .map_err(|e| Error::from_io("flush image", e))
    }
}
