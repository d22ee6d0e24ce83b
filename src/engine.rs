//! Command/response engine for the RN2483 line protocol.
//!
//! Every command is written once, then the transport is polled until a line
//! carrying a terminal keyword arrives or the deadline passes. Join and
//! transmit answer twice: an immediate `ok` that the request was accepted,
//! then a second line with the outcome over the air.

use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{POLL_INTERVAL_MS, POST_WRITE_SETTLE_MS, SERIAL_TIMEOUT_MS};
use crate::error::EngineError;
use crate::parser::parse_downlink;
use crate::protocol::{self, CommandResult, DOWNLINK_MARKER, PhaseTwo, Status};
use crate::telemetry::Downlink;
use crate::transport::Transport;

/// Pacing of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTiming {
    /// Pause after writing a command, before the first poll.
    pub settle: Duration,
    /// Pause between polls that found nothing to read.
    pub poll_interval: Duration,
    /// Upper bound on a single line read once data is available.
    pub read_timeout: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(POST_WRITE_SETTLE_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            read_timeout: Duration::from_millis(SERIAL_TIMEOUT_MS),
        }
    }
}

/// Result of a join or transmit command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualPhaseResult {
    pub status: Status,
    /// Lines of both phases, in arrival order.
    pub lines: Vec<String>,
    pub downlink: Option<Downlink>,
}

impl DualPhaseResult {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

pub struct CommandEngine<T: Transport> {
    transport: T,
    timing: EngineTiming,
}

impl<T: Transport> CommandEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timing(transport, EngineTiming::default())
    }

    pub fn with_timing(transport: T, timing: EngineTiming) -> Self {
        Self { transport, timing }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send `command` and collect lines until a terminal keyword or `timeout`.
    ///
    /// A deadline that passes after at least one line was captured yields
    /// `Ok`, not `Timeout`: replies such as the `sys reset` banner or a
    /// `mac get` value carry no keyword and only complete this way.
    pub fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandResult, EngineError> {
        self.send_line(command)?;

        let started = Instant::now();
        let mut lines = Vec::new();

        loop {
            let (read_any, line) = self.poll_line()?;
            if let Some(line) = line {
                let status = protocol::classify(&line);
                lines.push(line);
                if let Some(status) = status {
                    debug!(command, ?status, lines = ?lines, "command complete");
                    return Ok(CommandResult::new(status, lines));
                }
            }

            if started.elapsed() >= timeout {
                break;
            }
            if !read_any {
                thread::sleep(self.timing.poll_interval);
            }
        }

        let status = if lines.is_empty() {
            warn!(command, ?timeout, "no response from module");
            Status::Timeout
        } else {
            debug!(command, lines = ?lines, "deadline reached with unterminated reply, treated as ok");
            Status::Ok
        };
        Ok(CommandResult::new(status, lines))
    }

    /// Run a two-reply command. Phase two only starts when phase one is `Ok`,
    /// and waits for exactly one more line within `phase_two_timeout`.
    pub fn execute_dual(
        &mut self,
        command: &str,
        phase_one_timeout: Duration,
        phase_two_timeout: Duration,
        phase_two: &PhaseTwo,
    ) -> Result<DualPhaseResult, EngineError> {
        let first = self.execute(command, phase_one_timeout)?;
        if !first.is_ok() {
            warn!(command, status = ?first.status, lines = ?first.lines, "command refused by module");
            return Ok(DualPhaseResult {
                status: first.status,
                lines: first.lines,
                downlink: None,
            });
        }

        let mut lines = first.lines;
        let Some(line) = self.wait_line(phase_two_timeout)? else {
            warn!(command, timeout = ?phase_two_timeout, "no second reply from module");
            return Ok(DualPhaseResult {
                status: Status::Timeout,
                lines,
                downlink: None,
            });
        };

        let status = phase_two.classify(&line);
        let downlink = if line.starts_with(DOWNLINK_MARKER) {
            let parsed = parse_downlink(&line);
            if parsed.is_none() {
                warn!(%line, "downlink payload could not be decoded");
            }
            parsed
        } else {
            None
        };

        debug!(command, ?status, %line, "second reply");
        lines.push(line);
        Ok(DualPhaseResult {
            status,
            lines,
            downlink,
        })
    }

    fn send_line(&mut self, command: &str) -> Result<(), EngineError> {
        debug!(command, "sending");
        let framed = format!("{}\r\n", command.trim_end());
        self.transport.write(framed.as_bytes())?;
        if !self.timing.settle.is_zero() {
            thread::sleep(self.timing.settle);
        }
        Ok(())
    }

    /// One poll of the transport. Returns whether anything was read and the
    /// decoded line if it was not blank.
    fn poll_line(&mut self) -> Result<(bool, Option<String>), EngineError> {
        if !self.transport.bytes_available()? {
            return Ok((false, None));
        }
        let Some(raw) = self.transport.read_line(self.timing.read_timeout)? else {
            return Ok((false, None));
        };

        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            return Ok((true, None));
        }
        debug!(%line, "received");
        Ok((true, Some(line)))
    }

    fn wait_line(&mut self, timeout: Duration) -> Result<Option<String>, EngineError> {
        let started = Instant::now();
        loop {
            let (read_any, line) = self.poll_line()?;
            if line.is_some() {
                return Ok(line);
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            if !read_any {
                thread::sleep(self.timing.poll_interval);
            }
        }
    }
}
