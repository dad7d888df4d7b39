//! Buffered, frame-oriented reading on top of a [`SerialLink`].
//!
//! Bridge-to-host traffic is a stream of `\r`-terminated frames. The
//! reader keeps a small internal buffer so the response demultiplexer
//! can ask "is another frame already here?" without touching the
//! device.

use crate::error::Error;
use crate::serial::SerialLink;
use std::time::{Duration, Instant};

/// Maximum frame length: one 256-byte sector with every byte escaped,
/// plus the terminator.
pub const MAX_FRAME_LEN: usize = 513;

/// Per-read timeout while assembling a frame.
const FILL_TIMEOUT: Duration = Duration::from_millis(100);

/// Overall deadline for one frame or exact-read to make progress. A
/// frame that stalls longer than this means the link is desynchronized.
const FRAME_DEADLINE: Duration = Duration::from_secs(10);

pub struct FrameReader {
    link: Box<dyn SerialLink>,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        FrameReader {
            link,
            buffer: Vec::new(),
        }
    }

    /// True if at least one byte is buffered, i.e. parsing can proceed
    /// without reading from the underlying device.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Pull whatever the device has into the internal buffer, waiting
    /// at most `timeout`. Returns the number of bytes added (0 on
    /// timeout).
    pub fn fill(&mut self, timeout: Duration) -> Result<usize, Error> {
        let mut chunk = [0u8; 256];
        let n = self
            .link
            .read_timeout(&mut chunk, timeout)
            .map_err(|e| Error::from_io("serial read", e))?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read one frame up to and including `term`; the returned bytes
    /// exclude the terminator. Fails if `max_len` bytes accumulate
    /// without a terminator, or the stream stalls mid-frame.
    pub fn read_until(&mut self, term: u8, max_len: usize) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + FRAME_DEADLINE;
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == term) {
                let mut frame: Vec<u8> = self.buffer.drain(..=pos).collect();
                frame.pop();
                return Ok(frame);
            }
            if self.buffer.len() >= max_len {
                return Err(Error::connection(format!(
                    "no terminator within {max_len} bytes"
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::connection("timed out waiting for frame"));
            }
            self.fill(FILL_TIMEOUT)?;
        }
    }

    /// Read exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + FRAME_DEADLINE;
        while self.buffer.len() < n {
            if Instant::now() >= deadline {
                return Err(Error::connection("timed out waiting for data"));
            }
            self.fill(FILL_TIMEOUT)?;
        }
        Ok(self.buffer.drain(..n).collect())
    }
}
