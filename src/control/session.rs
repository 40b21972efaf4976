//! One controller connection: read a line, apply it, write a status line.
//!
//! ```text
//! Idle ──▶ Reading ──▶ Dispatching ──▶ Replying ──┐
//!  ▲                                              │
//!  └──────────────────────────────────────────────┘
//! Reading ──(EOF)──▶ Closed
//! ```
//!
//! The only blocking point is the read of the next line. A malformed line gets
//! a `-1` reply and leaves the registry untouched.

use std::io::{self, BufRead, Read, Write};

use tracing::{debug, trace, warn};

use crate::protocol::{Command, ParseError, Reply, MAX_LINE_LEN};
use crate::registry::Registry;

/// Where a session is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Reading,
    Dispatching,
    Replying,
    Closed,
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
}

/// Command loop bound to a registry.
pub struct Session {
    registry: Registry,
    state: SessionState,
    handled: u64,
}

impl Session {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            state: SessionState::Idle,
            handled: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Commands handled so far, successful or not.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    fn transition(&mut self, next: SessionState) {
        trace!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    /// Parse and apply one raw line.
    pub fn dispatch(&mut self, line: &[u8]) -> Reply {
        self.transition(SessionState::Dispatching);
        self.handled += 1;

        let parsed = std::str::from_utf8(line)
            .map_err(|_| ParseError::InvalidUtf8)
            .and_then(Command::parse);

        match parsed {
            Ok(command) => {
                debug!(command = %command, "Applying control command");
                command.apply(&self.registry);
                Reply::ok()
            }
            Err(e) => {
                warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(line).trim_end(),
                    "Rejected control command"
                );
                Reply::Error
            }
        }
    }

    /// Serve requests from `reader` until it reaches end of input.
    ///
    /// Returns the number of commands handled on this connection. The session
    /// ends in [`SessionState::Closed`] on EOF or on an I/O error.
    pub fn serve<R: BufRead, W: Write>(&mut self, mut reader: R, mut writer: W) -> io::Result<u64> {
        let mut served = 0;
        self.transition(SessionState::Idle);

        loop {
            self.transition(SessionState::Reading);
            let line = match read_line(&mut reader) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    self.transition(SessionState::Closed);
                    return Err(e);
                }
            };

            let reply = match line {
                Line::Complete(bytes) => self.dispatch(&bytes),
                Line::TooLong => {
                    self.transition(SessionState::Dispatching);
                    self.handled += 1;
                    warn!(max = MAX_LINE_LEN, "Rejected oversize control command");
                    Reply::Error
                }
            };
            served += 1;

            self.transition(SessionState::Replying);
            if let Err(e) = writeln!(writer, "{}", reply).and_then(|_| writer.flush()) {
                self.transition(SessionState::Closed);
                return Err(e);
            }
            self.transition(SessionState::Idle);
        }

        self.transition(SessionState::Closed);
        Ok(served)
    }
}

/// Read one line, without its terminator.
///
/// Returns `None` at end of input. A final line without a newline still
/// counts as a line.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Line>> {
    let mut buf = Vec::new();
    // One extra byte distinguishes "exactly the limit" from "over the limit"
    let limit = (MAX_LINE_LEN + 2) as u64;
    let n = Read::take(&mut *reader, limit).read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if buf.len() > MAX_LINE_LEN {
            return Ok(Some(Line::TooLong));
        }
        return Ok(Some(Line::Complete(buf)));
    }

    if buf.len() as u64 >= limit {
        discard_line(reader)?;
        return Ok(Some(Line::TooLong));
    }
    Ok(Some(Line::Complete(buf)))
}

fn discard_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let (found, used) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}
