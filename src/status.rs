//! Drive status lines read from the command channel.

use crate::error::Error;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error number a 1541 reports after power-on or drive reset.
pub const STATUS_POWER_ON: u8 = 73;

/// One `NN, MESSAGE,TRK,SEC` line from channel 15.
///
/// `number` 0 is success; everything else is an error condition whose
/// text is passed through from the drive unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveStatus {
    pub number: u8,
    pub message: String,
    pub track: u8,
    pub sector: u8,
}

impl DriveStatus {
    /// Parse a raw status payload. A trailing `\r` (the drive
    /// terminates its status line) is tolerated.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let text = String::from_utf8_lossy(raw);
        trace!("Parsing drive status: {:?}", text);

        let clean = match text.find('\r') {
            Some(pos) => &text[..pos],
            None => &text[..],
        };

        if clean.is_empty() {
            return Err(Error::Parse {
                message: "zero length status line".to_string(),
            });
        }

        let parts: Vec<&str> = clean.split(',').collect();
        if parts.len() != 4 {
            return Err(Error::Parse {
                message: format!("unexpected status format: {clean}"),
            });
        }

        let number = parts[0].trim().parse::<u8>().map_err(|_| Error::Parse {
            message: format!("invalid error number {:?} in status: {clean}", parts[0]),
        })?;
        let message = parts[1].trim().to_string();
        let track = parts[2].trim().parse::<u8>().map_err(|_| Error::Parse {
            message: format!("invalid track {:?} in status: {clean}", parts[2]),
        })?;
        let sector = parts[3].trim().parse::<u8>().map_err(|_| Error::Parse {
            message: format!("invalid sector {:?} in status: {clean}", parts[3]),
        })?;

        Ok(DriveStatus {
            number,
            message,
            track,
            sector,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.number == 0
    }

    /// True after a drive reset, when the 1541 reports its power-on
    /// banner (73,CBM DOS V2.6 1541,00,00).
    pub fn is_power_on(&self) -> bool {
        self.number == STATUS_POWER_ON
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02},{},{:02},{:02}",
            self.number, self.message, self.track, self.sector
        )
    }
}
