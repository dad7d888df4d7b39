//! Background reader that demultiplexes bridge responses.
//!
//! The bridge interleaves four frame classes on the serial line:
//! debug-channel configuration (`!`), debug log messages (`D`), data
//! responses (`r`) and status responses (`s`). Only a status frame
//! completes the pending request; anything malformed is a fatal
//! desynchronization and terminates the reader, failing the request in
//! flight.

use crate::bus::{printable, LogCallback, SharedState, CLIENT_CHANNEL};
use crate::error::Error;
use crate::escape;
use crate::framing::{FrameReader, MAX_FRAME_LEN};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::mem;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

// How often the idle wait checks the shutdown channel.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Wait {
    Readable,
    Shutdown,
}

pub(crate) struct ResponseReader {
    framer: FrameReader,
    shared: Arc<SharedState>,
    shutdown: Receiver<u8>,
    log: LogCallback,
    channels: HashMap<u8, String>,
    last_response: Vec<u8>,
}

impl ResponseReader {
    pub(crate) fn new(
        framer: FrameReader,
        shared: Arc<SharedState>,
        shutdown: Receiver<u8>,
        log: LogCallback,
    ) -> Self {
        ResponseReader {
            framer,
            shared,
            shutdown,
            log,
            channels: HashMap::new(),
            last_response: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        match self.process() {
            Ok(()) => debug!("Bridge reader shutting down"),
            Err(e) => (self.log)('E', CLIENT_CHANNEL, &e.to_string()),
        }
        self.shared
            .mark_dead(Error::connection("bridge reader terminated"));
    }

    fn process(&mut self) -> Result<(), Error> {
        loop {
            if !self.framer.has_buffered_data() {
                match self.wait_for_input()? {
                    Wait::Shutdown => return Ok(()),
                    Wait::Readable => {}
                }
            }
            let tag = self.framer.read_exact(1)?[0];
            match tag {
                b'!' => self.handle_channel_config()?,
                b'D' => self.handle_debug_message()?,
                b'r' => self.handle_data_response()?,
                b's' => self.handle_status_response()?,
                other => {
                    return Err(Error::connection(format!(
                        "unknown response msg type {other:#04x}"
                    )))
                }
            }
        }
    }

    /// Block until the serial line has data or the shutdown channel
    /// fires.
    fn wait_for_input(&mut self) -> Result<Wait, Error> {
        loop {
            match self.shutdown.try_recv() {
                Ok(_) | Err(TryRecvError::Disconnected) => return Ok(Wait::Shutdown),
                Err(TryRecvError::Empty) => {}
            }
            if self.framer.fill(POLL_INTERVAL)? > 0 {
                return Ok(Wait::Readable);
            }
        }
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        self.framer.read_until(escape::TERMINATOR, MAX_FRAME_LEN)
    }

    fn handle_channel_config(&mut self) -> Result<(), Error> {
        let frame = self.read_frame()?;
        if frame.len() < 2 {
            return Err(Error::connection(format!(
                "malformed channel configuration string '{}'",
                printable(&frame)
            )));
        }
        let name = String::from_utf8_lossy(&frame[1..]).to_string();
        trace!("Debug channel {:#04x} is {name}", frame[0]);
        self.channels.insert(frame[0], name);
        Ok(())
    }

    fn handle_debug_message(&mut self) -> Result<(), Error> {
        let frame = self.read_frame()?;
        if frame.len() < 3 {
            return Err(Error::connection(format!(
                "malformed debug message '{}'",
                printable(&frame)
            )));
        }
        let channel = match self.channels.get(&frame[1]) {
            Some(name) => name.clone(),
            None => {
                return Err(Error::connection(format!(
                    "malformed debug message '{}'",
                    printable(&frame)
                )))
            }
        };
        let message = String::from_utf8_lossy(&frame[2..]).to_string();
        (self.log)(frame[0] as char, &channel, &message);
        Ok(())
    }

    fn handle_data_response(&mut self) -> Result<(), Error> {
        let frame = self.read_frame()?;
        self.last_response = escape::unescape(&frame)?;
        Ok(())
    }

    /// An empty status frame completes the pending request with the
    /// last data response; a non-empty one carries the device's error
    /// text. Either way the stored response is consumed.
    fn handle_status_response(&mut self) -> Result<(), Error> {
        let frame = self.read_frame()?;
        let result = if frame.is_empty() {
            Ok(mem::take(&mut self.last_response))
        } else {
            self.last_response.clear();
            Err(Error::iec(String::from_utf8_lossy(&frame).to_string()))
        };
        if !self.shared.complete(result) {
            (self.log)('W', CLIENT_CHANNEL, "status frame with no pending request");
        }
        Ok(())
    }
}
