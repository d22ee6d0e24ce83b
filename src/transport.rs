use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::SERIAL_TIMEOUT_MS;

/// Byte-oriented duplex channel with line framing.
///
/// The command engine only depends on this capability, so tests can drive it
/// with a scripted double instead of a serial port.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read one raw line, terminator included. Returns `None` when no complete
    /// line arrived within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    fn bytes_available(&mut self) -> io::Result<bool>;
}

/// RN2483 attached over a serial port (8N1, no flow control).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    buffer: Vec<u8>,
    serial_buf: Vec<u8>,
}

impl SerialTransport {
    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;

        info!(port = port_path, baud_rate, "serial port opened");

        Ok(Self {
            port,
            buffer: Vec::new(),
            serial_buf: vec![0u8; 256],
        })
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        Some(self.buffer.drain(..=pos).collect())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                if !self.buffer.is_empty() {
                    debug!(pending = self.buffer.len(), "partial line kept for next read");
                }
                return Ok(None);
            }

            match self.port.read(&mut self.serial_buf) {
                Ok(n) if n > 0 => self.buffer.extend_from_slice(&self.serial_buf[..n]),
                Ok(_) => thread::sleep(Duration::from_millis(10)),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn bytes_available(&mut self) -> io::Result<bool> {
        if self.buffer.contains(&b'\n') {
            return Ok(true);
        }
        Ok(self.port.bytes_to_read()? > 0)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

    /// Test double that answers each written command with the lines produced
    /// by a responder closure.
    pub struct ScriptedTransport {
        responder: Responder,
        pending: VecDeque<Vec<u8>>,
        written: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        pub fn new<F>(responder: F) -> Self
        where
            F: FnMut(&str) -> Vec<String> + Send + 'static,
        {
            Self {
                responder: Box::new(responder),
                pending: VecDeque::new(),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Replies with the given scripts in order, one per written command,
        /// then stays silent.
        pub fn sequence(scripts: Vec<Vec<&str>>) -> Self {
            let mut scripts: VecDeque<Vec<String>> = scripts
                .into_iter()
                .map(|lines| lines.into_iter().map(str::to_string).collect())
                .collect();
            Self::new(move |_| scripts.pop_front().unwrap_or_default())
        }

        /// A silent module.
        pub fn silent() -> Self {
            Self::new(|_| Vec::new())
        }

        /// Handle on the commands written so far, usable after the transport
        /// has been moved into an engine.
        pub fn written(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.written)
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            let command = String::from_utf8_lossy(bytes).trim_end().to_string();
            for line in (self.responder)(&command) {
                self.pending.push_back(format!("{line}\r\n").into_bytes());
            }
            self.written.lock().unwrap().push(command);
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> io::Result<Option<Vec<u8>>> {
            Ok(self.pending.pop_front())
        }

        fn bytes_available(&mut self) -> io::Result<bool> {
            Ok(!self.pending.is_empty())
        }
    }
}
