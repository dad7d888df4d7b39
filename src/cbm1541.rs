//! [`BlockDrive`] implementation on top of a physical CBM 1541.
//!
//! The stock 1541 ROM has no raw sector interface, so the drive layer
//! uploads small machine-code routines into drive RAM over the command
//! channel (`M-W`), jumps into them (`M-E`) and moves sector payloads
//! through a direct-access data channel. Which routine set is resident
//! is tracked as an explicit firmware mode; every operation transitions
//! to the mode it needs before touching the disc.

use crate::bus::BusConnection;
use crate::drive::{BlockDrive, SECTOR_SIZE};
use crate::error::Error;
use crate::status::DriveStatus;
use crate::{MAX_DEVICE_NUM, MIN_DEVICE_NUM};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Data channel used for sector payloads.
pub const DATA_CHANNEL: u8 = 2;

/// Command/status channel. Always open on a CBM drive, no `open_channel`
/// needed.
pub const COMMAND_CHANNEL: u8 = 15;

/// Sectors on a standard 35-track disc.
pub const TOTAL_SECTORS: usize = 683;

// The 1541 command buffer limits one M-W to 35 bytes of payload; stay
// a little under.
const MW_CHUNK_SIZE: usize = 32;

// Track zones of the 1541 layout: (first track, last track, sectors
// per track), in .d64 order.
const TRACK_ZONES: [(u8, u8, u8); 4] = [(1, 17, 21), (18, 24, 19), (25, 30, 18), (31, 35, 17)];

// Highest track count the format routine will accept.
const MAX_FORMAT_TRACKS: usize = 41;

/// What custom code, if any, is resident in drive RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareMode {
    NoCustomCode,
    FormattingCodeLoaded,
    ReadWriteCodeLoaded,
}

/// An uploadable routine: raw 6502 code plus its load address. The
/// entry points and parameter conventions below are fixed by these
/// binaries; the host never interprets the bytes.
struct FirmwareFragment {
    binary: &'static [u8],
    load_address: u16,
}

// Sector read/write routines. Parameters (track, sector) are poked to
// PARAM_BLOCK beforehand; data moves through drive buffer 1 ($0400),
// which the host reaches via a "#1" direct-access channel.
const READ_WRITE_CODE: [u8; 46] = [
    0xad, 0x80, 0x05, 0x8d, 0x08, 0x00, 0xad, 0x81, 0x05, 0x8d, 0x09, 0x00, 0xa9, 0x80, 0x8d,
    0x01, 0x00, 0xad, 0x01, 0x00, 0x30, 0xfb, 0x60, 0xad, 0x80, 0x05, 0x8d, 0x08, 0x00, 0xad,
    0x81, 0x05, 0x8d, 0x09, 0x00, 0xa9, 0x90, 0x8d, 0x01, 0x00, 0xad, 0x01, 0x00, 0x30, 0xfb,
    0x60,
];

// Low-level format routine. Parameter (track count) is poked to
// PARAM_BLOCK beforehand.
const FORMAT_CODE: [u8; 22] = [
    0xad, 0x80, 0x05, 0x8d, 0x20, 0x06, 0xa9, 0x01, 0x8d, 0x06, 0x00, 0xa9, 0xf0, 0x8d, 0x00,
    0x00, 0xad, 0x00, 0x00, 0x30, 0xfb, 0x60,
];

static READ_WRITE_FRAGMENT: FirmwareFragment = FirmwareFragment {
    binary: &READ_WRITE_CODE,
    load_address: 0x0500,
};

static FORMAT_FRAGMENT: FirmwareFragment = FirmwareFragment {
    binary: &FORMAT_CODE,
    load_address: 0x0500,
};

const READ_ENTRY: u16 = 0x0500;
const WRITE_ENTRY: u16 = 0x0517;
const FORMAT_ENTRY: u16 = 0x0500;
const PARAM_BLOCK: u16 = 0x0580;

/// Map a linear sector index to the 1541's (track, sector) address.
pub fn sector_location(sector: usize) -> Result<(u8, u8), Error> {
    let mut remaining = sector;
    for &(first, last, per_track) in &TRACK_ZONES {
        let zone_len = (last - first + 1) as usize * per_track as usize;
        if remaining < zone_len {
            let track = first + (remaining / per_track as usize) as u8;
            let sec = (remaining % per_track as usize) as u8;
            return Ok((track, sec));
        }
        remaining -= zone_len;
    }
    Err(Error::invalid_argument(format!(
        "sector {sector} out of range (disc has {TOTAL_SECTORS} sectors)"
    )))
}

/// A physical 1541 behind the bridge connection.
///
/// The connection is borrowed; it is the caller's responsibility that
/// the device number is operated exclusively through this instance,
/// since the firmware mode tracked here must mirror the drive's RAM.
pub struct Cbm1541Drive<'a> {
    bus: &'a BusConnection,
    device: u8,
    mode: FirmwareMode,
}

impl<'a> Cbm1541Drive<'a> {
    /// Create a drive instance for `device` (8-15) on an established
    /// bus connection. No hardware communication happens until the
    /// first operation.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut drive = Cbm1541Drive::new(&bus, 9)?;
    /// let status = drive.drive_status()?;
    /// println!("Drive status: {status}");
    /// ```
    pub fn new(bus: &'a BusConnection, device: u8) -> Result<Self, Error> {
        if !(MIN_DEVICE_NUM..=MAX_DEVICE_NUM).contains(&device) {
            return Err(Error::invalid_argument(format!(
                "device number {device} outside {MIN_DEVICE_NUM}..={MAX_DEVICE_NUM}"
            )));
        }
        Ok(Cbm1541Drive {
            bus,
            device,
            mode: FirmwareMode::NoCustomCode,
        })
    }

    pub fn device_number(&self) -> u8 {
        self.device
    }

    pub fn firmware_mode(&self) -> FirmwareMode {
        self.mode
    }

    /// Poll the command channel for the drive's current status line.
    pub fn drive_status(&self) -> Result<DriveStatus, Error> {
        let raw = self.bus.read_from_channel(self.device, COMMAND_CHANNEL)?;
        DriveStatus::parse(&raw)
    }

    /// Full DOS format (`N:<name>,<id>`): writes directory and BAM.
    /// `name` is at most 16 characters, `id` exactly two.
    pub fn format_disk(&mut self, name: &str, id: &str) -> Result<(), Error> {
        if name.is_empty() || name.len() > 16 {
            return Err(Error::invalid_argument(format!(
                "disk name {name:?} must be 1-16 characters"
            )));
        }
        if id.len() != 2 {
            return Err(Error::invalid_argument(format!(
                "disk id {id:?} must be exactly 2 characters"
            )));
        }
        // The ROM formatter runs through drive RAM and clobbers any
        // uploaded routines.
        self.mode = FirmwareMode::NoCustomCode;
        let cmd = format!("N:{name},{id}");
        self.bus
            .write_to_channel(self.device, COMMAND_CHANNEL, cmd.as_bytes())?;
        self.check_status().map(|_| ())
    }

    /// Reset the drive (`UJ`). The 1541 answers with its power-on
    /// banner, which is accepted as success.
    pub fn reset_drive(&mut self) -> Result<DriveStatus, Error> {
        self.mode = FirmwareMode::NoCustomCode;
        self.bus
            .write_to_channel(self.device, COMMAND_CHANNEL, b"UJ")?;
        let raw = self.bus.read_from_channel(self.device, COMMAND_CHANNEL)?;
        let status = DriveStatus::parse(&raw)?;
        if status.is_ok() || status.is_power_on() {
            Ok(status)
        } else {
            Err(Error::iec(status_line(&raw)))
        }
    }

    /// Upload the fragment for `target` unless it is already resident.
    fn ensure_mode(&mut self, target: FirmwareMode) -> Result<(), Error> {
        if self.mode == target {
            return Ok(());
        }
        let fragment = match target {
            FirmwareMode::FormattingCodeLoaded => &FORMAT_FRAGMENT,
            FirmwareMode::ReadWriteCodeLoaded => &READ_WRITE_FRAGMENT,
            FirmwareMode::NoCustomCode => {
                self.mode = FirmwareMode::NoCustomCode;
                return Ok(());
            }
        };
        debug!(
            "Uploading {} byte fragment to ${:04x} on device {}",
            fragment.binary.len(),
            fragment.load_address,
            self.device
        );
        // A partial upload leaves unknown code in drive RAM; record
        // that before the first chunk goes out.
        self.mode = FirmwareMode::NoCustomCode;
        for (index, chunk) in fragment.binary.chunks(MW_CHUNK_SIZE).enumerate() {
            let address = fragment.load_address + (index * MW_CHUNK_SIZE) as u16;
            self.memory_write(address, chunk)?;
        }
        self.mode = target;
        Ok(())
    }

    /// `M-W`: write up to one chunk of bytes into drive RAM.
    fn memory_write(&self, address: u16, data: &[u8]) -> Result<(), Error> {
        let mut cmd = Vec::with_capacity(6 + data.len());
        cmd.extend_from_slice(b"M-W");
        cmd.push((address & 0xff) as u8);
        cmd.push((address >> 8) as u8);
        cmd.push(data.len() as u8);
        cmd.extend_from_slice(data);
        self.bus
            .write_to_channel(self.device, COMMAND_CHANNEL, &cmd)?;
        self.check_status().map(|_| ())
    }

    /// `M-E`: jump into drive RAM. Returns once the routine has run to
    /// completion, since the following status read blocks until the
    /// drive is listening again.
    fn memory_execute(&self, address: u16) -> Result<(), Error> {
        let cmd = [
            b'M',
            b'-',
            b'E',
            (address & 0xff) as u8,
            (address >> 8) as u8,
        ];
        self.bus
            .write_to_channel(self.device, COMMAND_CHANNEL, &cmd)?;
        self.check_status().map(|_| ())
    }

    fn check_status(&self) -> Result<DriveStatus, Error> {
        let raw = self.bus.read_from_channel(self.device, COMMAND_CHANNEL)?;
        let status = DriveStatus::parse(&raw)?;
        if status.is_ok() {
            Ok(status)
        } else {
            Err(Error::iec(status_line(&raw)))
        }
    }
}

fn status_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

impl BlockDrive for Cbm1541Drive<'_> {
    fn format_low_level(&mut self, num_tracks: usize) -> Result<(), Error> {
        if !(1..=MAX_FORMAT_TRACKS).contains(&num_tracks) {
            return Err(Error::invalid_argument(format!(
                "cannot format {num_tracks} tracks (1..={MAX_FORMAT_TRACKS})"
            )));
        }
        self.ensure_mode(FirmwareMode::FormattingCodeLoaded)?;
        self.memory_write(PARAM_BLOCK, &[num_tracks as u8])?;
        info!(
            "Formatting {num_tracks} tracks on device {}, this can take a minute",
            self.device
        );
        self.memory_execute(FORMAT_ENTRY)?;
        // Leave the drive ready for sector I/O.
        self.ensure_mode(FirmwareMode::ReadWriteCodeLoaded)
    }

    fn num_sectors(&self) -> usize {
        TOTAL_SECTORS
    }

    fn read_sector(&mut self, sector: usize) -> Result<Vec<u8>, Error> {
        let (track, sec) = sector_location(sector)?;
        self.ensure_mode(FirmwareMode::ReadWriteCodeLoaded)?;
        trace!("Reading track {track} sector {sec} from device {}", self.device);

        self.memory_write(PARAM_BLOCK, &[track, sec])?;
        self.memory_execute(READ_ENTRY)?;

        self.bus.open_channel(self.device, DATA_CHANNEL, b"#1")?;
        let data = self.bus.read_from_channel(self.device, DATA_CHANNEL);
        self.bus.close_channel(self.device, DATA_CHANNEL)?;

        let data = data?;
        if data.is_empty() {
            return Err(Error::EndOfFile);
        }
        if data.len() != SECTOR_SIZE {
            return Err(Error::iec(format!(
                "short sector read: got {} of {SECTOR_SIZE} bytes",
                data.len()
            )));
        }
        Ok(data)
    }

    fn write_sector(&mut self, sector: usize, data: &[u8]) -> Result<(), Error> {
        if data.len() != SECTOR_SIZE {
            return Err(Error::invalid_argument(format!(
                "sector payload must be {SECTOR_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let (track, sec) = sector_location(sector)?;
        self.ensure_mode(FirmwareMode::ReadWriteCodeLoaded)?;
        trace!("Writing track {track} sector {sec} on device {}", self.device);

        self.bus.open_channel(self.device, DATA_CHANNEL, b"#1")?;
        let result = self
            .bus
            .write_to_channel(self.device, DATA_CHANNEL, data)
            .and_then(|()| self.memory_write(PARAM_BLOCK, &[track, sec]))
            .and_then(|()| self.memory_execute(WRITE_ENTRY));
        self.bus.close_channel(self.device, DATA_CHANNEL)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{log_to_facade, BusConfig};
    use crate::escape;
    use crate::serial::scripted::{Exchange, ScriptedLink};

    const DEVICE: u8 = 9;

    fn put_request(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut request = vec![b'p', DEVICE, channel, payload.len() as u8];
        request.extend_from_slice(payload);
        request
    }

    fn mw_command(address: u16, data: &[u8]) -> Vec<u8> {
        let mut cmd = b"M-W".to_vec();
        cmd.push((address & 0xff) as u8);
        cmd.push((address >> 8) as u8);
        cmd.push(data.len() as u8);
        cmd.extend_from_slice(data);
        cmd
    }

    fn me_command(address: u16) -> Vec<u8> {
        vec![b'M', b'-', b'E', (address & 0xff) as u8, (address >> 8) as u8]
    }

    fn get_status_request() -> Vec<u8> {
        vec![b'g', DEVICE, COMMAND_CHANNEL]
    }

    const STATUS_OK: &[u8] = b"r00, OK,00,00\\r\rs\r";

    /// One memory-write with its status check.
    fn mw_exchanges(address: u16, data: &[u8]) -> Vec<Exchange> {
        vec![
            Exchange::exact(put_request(COMMAND_CHANNEL, &mw_command(address, data)), b"s\r"),
            Exchange::exact(get_status_request(), STATUS_OK),
        ]
    }

    fn me_exchanges(address: u16) -> Vec<Exchange> {
        vec![
            Exchange::exact(put_request(COMMAND_CHANNEL, &me_command(address)), b"s\r"),
            Exchange::exact(get_status_request(), STATUS_OK),
        ]
    }

    fn upload_exchanges(code: &[u8], load_address: u16) -> Vec<Exchange> {
        let mut script = Vec::new();
        for (index, chunk) in code.chunks(MW_CHUNK_SIZE).enumerate() {
            let address = load_address + (index * MW_CHUNK_SIZE) as u16;
            script.extend(mw_exchanges(address, chunk));
        }
        script
    }

    fn write_sector_exchanges(track: u8, sec: u8, data: &[u8]) -> Vec<Exchange> {
        let mut script = vec![
            Exchange::exact(vec![b'o', DEVICE, DATA_CHANNEL, 2, b'#', b'1'], b"s\r"),
            Exchange::exact(put_request(DATA_CHANNEL, data), b"s\r"),
        ];
        script.extend(mw_exchanges(PARAM_BLOCK, &[track, sec]));
        script.extend(me_exchanges(WRITE_ENTRY));
        script.push(Exchange::exact(vec![b'c', DEVICE, DATA_CHANNEL], b"s\r"));
        script
    }

    fn connect(extra: Vec<Exchange>) -> (crate::bus::BusConnection, ScriptedLink) {
        let mut script = vec![
            Exchange::unprompted(b"connect_arduino:3\r"),
            Exchange::prefix(b"OK>0|5|4|3|7|6|", b""),
        ];
        script.extend(extra);
        let link = ScriptedLink::new(script);
        let conn = crate::bus::BusConnection::from_link(
            Box::new(link.clone()),
            BusConfig::default(),
            log_to_facade(),
        )
        .expect("handshake failed");
        (conn, link)
    }

    #[test]
    fn test_sector_location_boundaries() {
        assert_eq!(sector_location(0).unwrap(), (1, 0));
        assert_eq!(sector_location(20).unwrap(), (1, 20));
        assert_eq!(sector_location(21).unwrap(), (2, 0));
        assert_eq!(sector_location(356).unwrap(), (17, 20));
        assert_eq!(sector_location(357).unwrap(), (18, 0));
        assert_eq!(sector_location(682).unwrap(), (35, 16));
        assert!(matches!(
            sector_location(683),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_device_number() {
        let (conn, _link) = connect(vec![]);
        assert!(Cbm1541Drive::new(&conn, 7).is_err());
        assert!(Cbm1541Drive::new(&conn, 16).is_err());
        assert!(Cbm1541Drive::new(&conn, 9).is_ok());
    }

    #[test]
    fn test_write_sector_uploads_firmware_once() {
        let payload = vec![0xaa; SECTOR_SIZE];
        let mut script = upload_exchanges(&READ_WRITE_CODE, 0x0500);
        script.extend(write_sector_exchanges(1, 0, &payload));
        // Second write: no upload.
        script.extend(write_sector_exchanges(1, 1, &payload));

        let (conn, link) = connect(script);
        let mut drive = Cbm1541Drive::new(&conn, DEVICE).unwrap();
        assert_eq!(drive.firmware_mode(), FirmwareMode::NoCustomCode);

        drive.write_sector(0, &payload).unwrap();
        assert_eq!(drive.firmware_mode(), FirmwareMode::ReadWriteCodeLoaded);
        drive.write_sector(1, &payload).unwrap();

        drop(drive);
        drop(conn);
        link.assert_script_consumed();
    }

    #[test]
    fn test_read_sector_round_trip() {
        let payload: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 256) as u8).collect();
        let mut data_reply = vec![b'r'];
        data_reply.extend(escape::escape(&payload));
        data_reply.extend_from_slice(b"\rs\r");

        let mut script = upload_exchanges(&READ_WRITE_CODE, 0x0500);
        script.extend(mw_exchanges(PARAM_BLOCK, &[18, 0]));
        script.extend(me_exchanges(READ_ENTRY));
        script.push(Exchange::exact(
            vec![b'o', DEVICE, DATA_CHANNEL, 2, b'#', b'1'],
            b"s\r",
        ));
        script.push(Exchange::exact(
            vec![b'g', DEVICE, DATA_CHANNEL],
            &data_reply,
        ));
        script.push(Exchange::exact(vec![b'c', DEVICE, DATA_CHANNEL], b"s\r"));

        let (conn, link) = connect(script);
        let mut drive = Cbm1541Drive::new(&conn, DEVICE).unwrap();
        // Sector 357 is track 18 sector 0.
        let data = drive.read_sector(357).unwrap();
        assert_eq!(data, payload);

        drop(drive);
        drop(conn);
        link.assert_script_consumed();
    }

    #[test]
    fn test_format_transitions_back_to_read_write() {
        let mut script = upload_exchanges(&FORMAT_CODE, 0x0500);
        script.extend(mw_exchanges(PARAM_BLOCK, &[40]));
        script.extend(me_exchanges(FORMAT_ENTRY));
        script.extend(upload_exchanges(&READ_WRITE_CODE, 0x0500));

        let (conn, link) = connect(script);
        let mut drive = Cbm1541Drive::new(&conn, DEVICE).unwrap();
        drive.format_low_level(40).unwrap();
        assert_eq!(drive.firmware_mode(), FirmwareMode::ReadWriteCodeLoaded);

        drop(drive);
        drop(conn);
        link.assert_script_consumed();
    }

    #[test]
    fn test_format_track_count_bounds() {
        let (conn, _link) = connect(vec![]);
        let mut drive = Cbm1541Drive::new(&conn, DEVICE).unwrap();
        assert!(matches!(
            drive.format_low_level(0),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            drive.format_low_level(42),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_error_status_aborts_operation() {
        let payload = vec![0xaa; SECTOR_SIZE];
        // First M-W chunk is answered with a write-protect error.
        let script = vec![
            Exchange::exact(
                put_request(
                    COMMAND_CHANNEL,
                    &mw_command(0x0500, &READ_WRITE_CODE[..MW_CHUNK_SIZE]),
                ),
                b"s\r",
            ),
            Exchange::exact(get_status_request(), b"r26,WRITE PROTECT ON,18,00\\r\rs\r"),
        ];
        let (conn, link) = connect(script);
        let mut drive = Cbm1541Drive::new(&conn, DEVICE).unwrap();
        let result = drive.write_sector(0, &payload);
        assert_eq!(
            result,
            Err(Error::Iec {
                message: "26,WRITE PROTECT ON,18,00".to_string()
            })
        );
        // The aborted upload must not count as loaded code.
        assert_eq!(drive.firmware_mode(), FirmwareMode::NoCustomCode);

        drop(drive);
        drop(conn);
        link.assert_script_consumed();
    }

    #[test]
    fn test_write_sector_validates_payload_and_range() {
        let (conn, _link) = connect(vec![]);
        let mut drive = Cbm1541Drive::new(&conn, DEVICE).unwrap();
        assert!(matches!(
            drive.write_sector(0, &[0u8; 255]),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            drive.write_sector(TOTAL_SECTORS, &[0u8; SECTOR_SIZE]),
            Err(Error::InvalidArgument { .. })
        ));
        assert_eq!(drive.num_sectors(), TOTAL_SECTORS);
    }
}
