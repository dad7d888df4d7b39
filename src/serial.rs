//! Serial channel to the bridge microcontroller.
//!
//! The bridge speaks 8N1 with no flow control. The [`SerialLink`] trait
//! is the seam between the protocol layers and the actual device; the
//! real implementation wraps the `serialport` crate, and tests
//! substitute a scripted link.

use crate::error::Error;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use std::io;
#[allow(unused_imports)]
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

/// Baud rates the bridge channel accepts, matching the classic termios
/// `B*` constants. Anything else is rejected before the device is
/// touched.
pub const BAUD_RATES: [u32; 18] = [
    0, 50, 75, 110, 134, 150, 200, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
    230400,
];

/// Default speed of the bridge serial link.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Rate used briefly on open to make the bridge reset itself.
const RESET_BAUD_RATE: u32 = 1200;

/// How long the channel holds the reset rate before switching over.
const RESET_HOLD: Duration = Duration::from_secs(1);

/// Byte-level access to the bridge serial device.
///
/// `read_timeout` returns `Ok(0)` when the timeout elapses without
/// data. `try_clone` hands out a second handle onto the same device so
/// the background reader and the request writer can operate
/// independently.
pub trait SerialLink: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>>;
}

pub fn validate_baud(baud: u32) -> Result<(), Error> {
    if BAUD_RATES.contains(&baud) {
        Ok(())
    } else {
        Err(Error::connection(format!(
            "unknown speed setting: #{baud} baud"
        )))
    }
}

/// Open and configure the bridge serial device.
///
/// The port first comes up at 1200 baud and holds for a second, which
/// makes the bridge microcontroller reset. It is then reconfigured to
/// the requested rate and the input buffer is flushed so the handshake
/// starts from a clean line.
pub fn open_serial(path: &str, baud: u32) -> Result<Box<dyn SerialLink>, Error> {
    validate_baud(baud)?;

    debug!("Opening serial device {path} at {baud} baud");
    let mut port = serialport::new(path, RESET_BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| Error::connection(format!("open(\"{path}\"): {e}")))?;

    thread::sleep(RESET_HOLD);

    port.set_baud_rate(baud)
        .map_err(|e| Error::connection(format!("set_baud_rate({baud}): {e}")))?;
    port.clear(ClearBuffer::Input)
        .map_err(|e| Error::connection(format!("flush input: {e}")))?;

    Ok(Box::new(RealSerialPort { port }))
}

/// Real serial device behind the [`SerialLink`] seam.
pub struct RealSerialPort {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(RealSerialPort { port }))
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! Scripted serial link for protocol tests.
    //!
    //! A script is an ordered list of exchanges. Each exchange either
    //! releases bytes unprompted (the bridge greeting) or waits for one
    //! `write_all` call matching its expectation before releasing its
    //! reply into the read buffer. Cloned handles share the script, so
    //! the caller thread and the background reader see one device.

    use super::SerialLink;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    pub(crate) enum Expect {
        /// Release the reply immediately.
        Unprompted,
        /// Release after a write_all call with exactly these bytes.
        Exact(Vec<u8>),
        /// Release after a write_all call starting with these bytes.
        Prefix(Vec<u8>),
    }

    pub(crate) struct Exchange {
        pub expect: Expect,
        pub reply: Vec<u8>,
    }

    impl Exchange {
        pub fn unprompted(reply: &[u8]) -> Self {
            Exchange {
                expect: Expect::Unprompted,
                reply: reply.to_vec(),
            }
        }

        pub fn exact(expect: Vec<u8>, reply: &[u8]) -> Self {
            Exchange {
                expect: Expect::Exact(expect),
                reply: reply.to_vec(),
            }
        }

        pub fn prefix(expect: &[u8], reply: &[u8]) -> Self {
            Exchange {
                expect: Expect::Prefix(expect.to_vec()),
                reply: reply.to_vec(),
            }
        }
    }

    #[derive(Default)]
    struct ScriptState {
        exchanges: VecDeque<Exchange>,
        rx: VecDeque<u8>,
        written: Vec<u8>,
        unexpected: Vec<String>,
    }

    impl ScriptState {
        fn release_unprompted(&mut self) {
            while matches!(
                self.exchanges.front(),
                Some(Exchange {
                    expect: Expect::Unprompted,
                    ..
                })
            ) {
                let exchange = self.exchanges.pop_front().unwrap();
                self.rx.extend(exchange.reply);
            }
        }
    }

    #[derive(Clone)]
    pub(crate) struct ScriptedLink {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedLink {
        pub fn new(exchanges: Vec<Exchange>) -> Self {
            let mut state = ScriptState {
                exchanges: exchanges.into(),
                ..Default::default()
            };
            state.release_unprompted();
            ScriptedLink {
                state: Arc::new(Mutex::new(state)),
            }
        }

        /// Panics if any write did not match its expected exchange or
        /// the script was not fully consumed.
        pub fn assert_script_consumed(&self) {
            let state = self.state.lock().unwrap();
            assert!(
                state.unexpected.is_empty(),
                "unexpected writes: {:?}",
                state.unexpected
            );
            assert_eq!(
                state.exchanges.len(),
                0,
                "script not fully consumed ({} exchanges left)",
                state.exchanges.len()
            );
        }
    }

    impl SerialLink for ScriptedLink {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.written.extend_from_slice(buf);
            let matched = match state.exchanges.front() {
                Some(Exchange {
                    expect: Expect::Exact(expected),
                    ..
                }) => buf == expected.as_slice(),
                Some(Exchange {
                    expect: Expect::Prefix(expected),
                    ..
                }) => buf.starts_with(expected),
                _ => false,
            };
            if matched {
                let exchange = state.exchanges.pop_front().unwrap();
                state.rx.extend(exchange.reply);
                state.release_unprompted();
            } else {
                state.unexpected.push(format!("{buf:02x?}"));
            }
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            {
                let mut state = self.state.lock().unwrap();
                if !state.rx.is_empty() {
                    let mut n = 0;
                    while n < buf.len() {
                        match state.rx.pop_front() {
                            Some(byte) => {
                                buf[n] = byte;
                                n += 1;
                            }
                            None => break,
                        }
                    }
                    return Ok(n);
                }
            }
            thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(0)
        }

        fn try_clone(&self) -> io::Result<Box<dyn SerialLink>> {
            Ok(Box::new(self.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_menu() {
        assert!(validate_baud(57600).is_ok());
        assert!(validate_baud(1200).is_ok());
        assert!(validate_baud(0).is_ok());
        assert!(matches!(
            validate_baud(12345),
            Err(Error::Connection { .. })
        ));
        assert!(matches!(
            validate_baud(460800),
            Err(Error::Connection { .. })
        ));
    }

    #[test]
    fn test_scripted_link_round_trip() {
        use super::scripted::{Exchange, ScriptedLink};

        let mut link = ScriptedLink::new(vec![
            Exchange::unprompted(b"hi\r"),
            Exchange::exact(b"ping".to_vec(), b"pong"),
        ]);

        let mut buf = [0u8; 8];
        let n = link
            .read_timeout(&mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(&buf[..n], b"hi\r");

        link.write_all(b"ping").unwrap();
        let n = link
            .read_timeout(&mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        link.assert_script_consumed();
    }
}
