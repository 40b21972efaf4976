//! Reply lines written back to the controller.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Status token for a command that was applied.
pub const REPLY_OK: &str = "0";
/// Status token for a command that was rejected.
pub const REPLY_ERROR: &str = "-1";

/// Outcome of one command, as sent on the wire.
///
/// Only `-1` is an error. Any other line means the command was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Applied, with a numeric status (`0` from this crate's targets).
    Ok(u32),
    /// Applied, with a status line that is not a non-negative integer.
    Accepted(String),
    Error,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Ok(0)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error)
    }

    /// Interpret one reply line. A trailing newline is ignored.
    pub fn from_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        if line == REPLY_ERROR {
            return Reply::Error;
        }
        match line.parse::<u32>() {
            Ok(status) => Reply::Ok(status),
            Err(_) => Reply::Accepted(line.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(status) => write!(f, "{}", status),
            Reply::Accepted(status) => f.write_str(status),
            Reply::Error => f.write_str(REPLY_ERROR),
        }
    }
}

impl FromStr for Reply {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Reply::from_line(s))
    }
}
