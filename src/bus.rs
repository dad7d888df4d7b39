//! Connection to the serial-to-IEC bridge.
//!
//! A [`BusConnection`] owns the serial channel, performs the
//! `connect_arduino` handshake and runs a background reader that
//! demultiplexes bridge responses. The request operations (`reset`,
//! `open_channel`, `read_from_channel`, `write_to_channel`,
//! `close_channel`) are synchronous: each installs a fresh completion
//! rendezvous, writes its request bytes and blocks until the reader
//! delivers the matching status frame. An internal mutex serializes the
//! install+write+await sequence, so the connection is safe to share
//! between threads.

use crate::demux::ResponseReader;
use crate::error::Error;
use crate::escape::TERMINATOR;
use crate::framing::{FrameReader, MAX_FRAME_LEN};
use crate::serial::{open_serial, SerialLink};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback receiving the bridge's asynchronous debug stream:
/// `(level_char, channel_name, message)`. Levels in use are `'I'`,
/// `'W'`, `'E'` and `'D'`. Invoked from the background reader thread.
pub type LogCallback = Box<dyn Fn(char, &str, &str) + Send + 'static>;

/// A [`LogCallback`] that routes bridge messages into the `log` facade.
pub fn log_to_facade() -> LogCallback {
    Box::new(|level, channel, message| match level {
        'E' => error!("{channel}: {message}"),
        'W' => warn!("{channel}: {message}"),
        'D' => debug!("{channel}: {message}"),
        _ => info!("{channel}: {message}"),
    })
}

/// Channel name used for messages originating on the host side rather
/// than on the bridge.
pub(crate) const CLIENT_CHANNEL: &str = "CLIENT";

/// Bridge pin assignment sent during the handshake. The defaults match
/// the stock bridge firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub atn: u8,
    pub clock: u8,
    pub data: u8,
    pub reset: u8,
    pub srq: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            atn: 5,
            clock: 4,
            data: 3,
            reset: 7,
            srq: 6,
        }
    }
}

// The host registers as device 0 on the bus, which the bridge special
// cases as "host mode".
const HOST_DEVICE_NUMBER: u8 = 0;

const CONNECT_PREFIX: &str = "connect_arduino:";
const MIN_PROTOCOL_VERSION: u32 = 3;

// Number of frames inspected while looking for the connection string.
const HANDSHAKE_ATTEMPTS: usize = 5;

// Single-byte request headers understood by the bridge.
const CMD_RESET: u8 = b'r';
const CMD_OPEN: u8 = b'o';
const CMD_CLOSE: u8 = b'c';
const CMD_GET_DATA: u8 = b'g';
const CMD_PUT_DATA: u8 = b'p';

/// Longest command string accepted by `open_channel`.
pub const MAX_OPEN_COMMAND_LEN: usize = 255;

/// Largest data slice carried by a single `p` request.
pub const MAX_PACKET_SIZE: usize = 256;

// Time the drive needs to come back after a bus reset.
const RESET_SETTLE: Duration = Duration::from_secs(2);

const SHUTDOWN_BYTE: u8 = b't';

pub(crate) type Completion = Result<Vec<u8>, Error>;

/// Rendezvous between the request initiator and the background reader.
///
/// The caller installs a fresh sender strictly before writing its
/// request; the reader resolves it exactly once when the status frame
/// arrives, or with a failure when it exits. `alive` and the slot are
/// updated under the same lock so a request can never be installed
/// after the reader's final drain.
pub(crate) struct SharedState {
    slot: Mutex<Option<SyncSender<Completion>>>,
    alive: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            slot: Mutex::new(None),
            alive: AtomicBool::new(true),
        }
    }

    fn install(&self, tx: SyncSender<Completion>) -> Result<(), Error> {
        let mut slot = self.slot.lock();
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::connection("bridge reader has shut down"));
        }
        *slot = Some(tx);
        Ok(())
    }

    fn clear(&self) {
        self.slot.lock().take();
    }

    /// Resolve the pending request, if any. Returns false when no
    /// request was outstanding.
    pub(crate) fn complete(&self, result: Completion) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Final drain on reader exit: fail whatever is in flight and
    /// refuse all future installs.
    pub(crate) fn mark_dead(&self, error: Error) {
        let mut slot = self.slot.lock();
        self.alive.store(false, Ordering::Release);
        if let Some(tx) = slot.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// Render arbitrary bytes for log messages, escaping control
/// characters.
pub(crate) fn printable(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &byte in bytes {
        match byte {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b if b < 32 => out.push_str(&format!("#{b}")),
            b => out.push(b as char),
        }
    }
    out
}

pub struct BusConnection {
    writer: Mutex<Box<dyn SerialLink>>,
    shared: Arc<SharedState>,
    request_lock: Mutex<()>,
    shutdown_tx: mpsc::Sender<u8>,
    reader_thread: Option<JoinHandle<()>>,
}

impl BusConnection {
    /// Open the serial device at `path` (see
    /// [`open_serial`](crate::serial::open_serial) for the bridge reset
    /// behavior on open) and establish the connection.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let bus = BusConnection::open(
    ///     "/dev/ttyUSB0",
    ///     57600,
    ///     BusConfig::default(),
    ///     log_to_facade(),
    /// )?;
    /// bus.reset()?;
    /// ```
    pub fn open(
        path: &str,
        baud: u32,
        config: BusConfig,
        log_callback: LogCallback,
    ) -> Result<Self, Error> {
        let link = open_serial(path, baud)?;
        Self::from_link(link, config, log_callback)
    }

    /// Establish the connection over an already-configured link:
    /// perform the handshake, send the host configuration line and
    /// spawn the background reader.
    ///
    /// Side effect: `SIGPIPE` is ignored process-wide, since a bridge
    /// unplugged mid-write must surface as an error, not kill the
    /// process.
    pub fn from_link(
        link: Box<dyn SerialLink>,
        config: BusConfig,
        log_callback: LogCallback,
    ) -> Result<Self, Error> {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let reader = link
            .try_clone()
            .map_err(|e| Error::from_io("clone serial handle", e))?;
        let mut framer = FrameReader::new(reader);
        let mut writer = link;

        let version = Self::handshake(&mut framer, &log_callback)?;
        debug!("Bridge reports protocol version {version}");

        let reply = format!(
            "OK>{}|{}|{}|{}|{}|{}|{}\r",
            HOST_DEVICE_NUMBER,
            config.atn,
            config.clock,
            config.data,
            config.reset,
            config.srq,
            handshake_timestamp()
        );
        writer
            .write_all(reply.as_bytes())
            .map_err(|e| Error::from_io("handshake reply", e))?;

        let shared = Arc::new(SharedState::new());
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let agent = ResponseReader::new(framer, shared.clone(), shutdown_rx, log_callback);
        let reader_thread = thread::Builder::new()
            .name("iec-bridge-reader".to_string())
            .spawn(move || agent.run())
            .map_err(|e| Error::from_io("spawn bridge reader", e))?;

        Ok(BusConnection {
            writer: Mutex::new(writer),
            shared,
            request_lock: Mutex::new(()),
            shutdown_tx,
            reader_thread: Some(reader_thread),
        })
    }

    /// Read frames until the bridge identifies itself, tolerating a
    /// few lines of boot noise, and check the protocol version.
    fn handshake(framer: &mut FrameReader, log: &LogCallback) -> Result<u32, Error> {
        let mut connection_string = String::new();
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            let frame = framer.read_until(TERMINATOR, MAX_FRAME_LEN)?;
            let text = String::from_utf8_lossy(&frame).to_string();
            if text.starts_with(CONNECT_PREFIX) {
                connection_string = text;
                break;
            }
            if attempt + 1 >= HANDSHAKE_ATTEMPTS {
                return Err(Error::connection(format!(
                    "unknown protocol response: '{}'",
                    printable(&frame)
                )));
            }
            log('W', CLIENT_CHANNEL, &format!("Malformed connection string '{text}'"));
        }

        let rest = connection_string[CONNECT_PREFIX.len()..].trim();
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let version = digits.parse::<u32>().map_err(|_| {
            Error::connection(format!("unsupported protocol: '{connection_string}'"))
        })?;
        if version < MIN_PROTOCOL_VERSION {
            return Err(Error::connection(format!(
                "unsupported protocol: '{connection_string}'"
            )));
        }
        Ok(version)
    }

    /// Reset the IEC bus by pulling the reset line low. Waits two
    /// seconds of wall time after the request so the drives can come
    /// back up.
    pub fn reset(&self) -> Result<(), Error> {
        self.transact(&[CMD_RESET], Some(RESET_SETTLE)).map(|_| ())
    }

    /// Open `channel` on `device`. `cmd` is sent to the channel on
    /// open (a filename, or a DOS command for channel 15) and is
    /// limited to 255 bytes.
    pub fn open_channel(&self, device: u8, channel: u8, cmd: &[u8]) -> Result<(), Error> {
        if cmd.len() > MAX_OPEN_COMMAND_LEN {
            return Err(Error::invalid_argument(format!(
                "open command of {} bytes exceeds {MAX_OPEN_COMMAND_LEN}",
                cmd.len()
            )));
        }
        let mut request = Vec::with_capacity(4 + cmd.len());
        request.push(CMD_OPEN);
        request.push(device);
        request.push(channel);
        request.push(cmd.len() as u8);
        request.extend_from_slice(cmd);
        self.transact(&request, None).map(|_| ())
    }

    /// Read from `device`/`channel` until the device signals EOI.
    /// Returns the decoded payload of the data-response frame.
    pub fn read_from_channel(&self, device: u8, channel: u8) -> Result<Vec<u8>, Error> {
        self.transact(&[CMD_GET_DATA, device, channel], None)
    }

    /// Write `data` to `device`/`channel`. Slices larger than one
    /// packet are split into multiple requests, each completing on its
    /// own status frame.
    pub fn write_to_channel(&self, device: u8, channel: u8, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(MAX_PACKET_SIZE) {
            let mut request = Vec::with_capacity(4 + chunk.len());
            request.push(CMD_PUT_DATA);
            request.push(device);
            request.push(channel);
            // A full packet wraps the length byte to zero; the bridge
            // reads that as 256.
            request.push(chunk.len() as u8);
            request.extend_from_slice(chunk);
            self.transact(&request, None)?;
        }
        Ok(())
    }

    /// Close `channel` on `device`.
    pub fn close_channel(&self, device: u8, channel: u8) -> Result<(), Error> {
        self.transact(&[CMD_CLOSE, device, channel], None)
            .map(|_| ())
    }

    /// Install a completion rendezvous, write the request bytes and
    /// block until the background reader resolves it. The rendezvous
    /// is installed strictly before the write so a fast status frame
    /// cannot be lost.
    fn transact(&self, request: &[u8], settle: Option<Duration>) -> Result<Vec<u8>, Error> {
        let _guard = self.request_lock.lock();

        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.install(tx)?;

        trace!("Bridge request: {}", printable(request));
        if let Err(e) = self.writer.lock().write_all(request) {
            self.shared.clear();
            return Err(Error::from_io("serial write", e));
        }

        if let Some(delay) = settle {
            thread::sleep(delay);
        }

        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::connection(
                "bridge reader exited before completing request",
            )),
        }
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        // Wake the reader and join it before the struct fields (and
        // with them the serial handles) are dropped. Closing the
        // serial device under a live reader could strand it.
        let _ = self.shutdown_tx.send(SHUTDOWN_BYTE);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

fn handshake_timestamp() -> String {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::localtime_r(&now, &mut tm);
    }
    format!(
        "{}-{}-{}.{}:{}:{}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}
