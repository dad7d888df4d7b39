//! Escape codec for data-response frames.
//!
//! Data-response (`r`) frames carry arbitrary 8-bit payloads inside a
//! `\r`-terminated line, so the terminator and the escape byte itself
//! travel as two-byte sequences. Debug and status frames are plain text
//! and are never escaped.

use crate::error::Error;

/// Frame terminator on the bridge serial link.
pub const TERMINATOR: u8 = b'\r';

/// Escape introducer inside `r`-frame payloads.
pub const ESCAPE: u8 = b'\\';

/// Escape code standing in for a payload carriage return.
const ESCAPED_CR: u8 = b'r';

/// Encode a payload so that it contains no raw terminator byte.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            TERMINATOR => {
                out.push(ESCAPE);
                out.push(ESCAPED_CR);
            }
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPE);
            }
            _ => out.push(byte),
        }
    }
    out
}

/// Exact inverse of [`escape`]. A dangling escape or an unknown escape
/// code means the frame stream is corrupt and is surfaced as a
/// connection failure.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(&ESCAPED_CR) => out.push(TERMINATOR),
            Some(&ESCAPE) => out.push(ESCAPE),
            Some(&other) => {
                return Err(Error::connection(format!(
                    "unknown escape code {other:#04x} in data response"
                )))
            }
            None => {
                return Err(Error::connection(
                    "dangling escape at end of data response",
                ))
            }
        }
    }
    Ok(out)
}
