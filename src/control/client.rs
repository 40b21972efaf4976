//! Controller side of the pipe protocol.
//!
//! Uses tokio's FIFO support so a reply wait can be bounded by a timeout
//! instead of blocking forever on a target that never answers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use nix::libc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tracing::{debug, warn};

use super::{process_alive, ControlError, ControlPipes, ControlTarget, Result};
use crate::protocol::{Command, Reply};

/// Backoff while the target has no reader on its command pipe.
///
/// A target briefly has none between two controllers, while it reopens both
/// pipes.
pub fn connect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(20)
}

fn no_reader(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENXIO)
}

/// Open the command pipe for writing, retrying while nobody reads it.
async fn open_sender(in_path: &Path) -> Result<pipe::Sender> {
    (|| async move { pipe::OpenOptions::new().open_sender(in_path) })
        .retry(connect_backoff())
        .when(no_reader)
        .notify(|_: &std::io::Error, delay: Duration| {
            debug!(pipe = %in_path.display(), delay = ?delay, "No reader on control pipe yet, retrying");
        })
        .await
        .map_err(|e| {
            if no_reader(&e) {
                ControlError::NotListening(in_path.to_path_buf())
            } else {
                ControlError::io(in_path, e)
            }
        })
}

/// Resolved handle on one target's pipe pair.
#[derive(Debug, Clone)]
pub struct ControlClient {
    target: ControlTarget,
    timeout: Option<Duration>,
}

impl ControlClient {
    /// Client without validation. Use [`ControlClient::resolve`] to check the
    /// target first.
    pub fn new(target: ControlTarget) -> Self {
        Self {
            target,
            timeout: None,
        }
    }

    /// Check that `target` exists: a live process with a pipe pair, or an
    /// explicit prefix with a pipe pair.
    pub fn resolve(target: ControlTarget) -> Result<Self> {
        if let ControlTarget::Pid { pid, .. } = &target {
            if !process_alive(*pid) {
                return Err(ControlError::ProcessNotRunning(*pid));
            }
        }
        if !ControlPipes::exist(&target) {
            return Err(ControlError::PipesNotFound(target.prefix()));
        }
        Ok(Self::new(target))
    }

    /// Bound each reply wait. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &ControlTarget {
        &self.target
    }

    /// Open both pipes.
    ///
    /// The reply pipe is opened first so the target never waits on it.
    pub async fn connect(&self) -> Result<ControlConnection> {
        let out_path = self.target.out_path();
        let in_path = self.target.in_path();

        let mut options = pipe::OpenOptions::new();
        // Holding a write end of our own keeps the reply pipe from reporting
        // EOF before the target has opened it.
        #[cfg(target_os = "linux")]
        options.read_write(true);
        let receiver = options
            .open_receiver(&out_path)
            .map_err(|e| ControlError::io(&out_path, e))?;

        let sender = open_sender(&in_path).await?;

        debug!(target = %self.target, "Connected to control pipes");

        Ok(ControlConnection {
            sender,
            receiver: BufReader::new(receiver),
            timeout: self.timeout,
            in_path,
            used: false,
        })
    }

    /// Connect, send one command and return its reply.
    pub async fn send(&self, command: &Command) -> Result<Reply> {
        self.connect().await?.send(command).await
    }

    /// Connect, send every command in order and collect the replies.
    ///
    /// Stops at the first channel error; replies received so far are lost.
    pub async fn send_all(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        let mut connection = self.connect().await?;
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            replies.push(connection.send(command).await?);
        }
        Ok(replies)
    }
}

/// An open pipe pair. Dropping it closes the connection, after which the
/// target waits for the next controller.
pub struct ControlConnection {
    sender: pipe::Sender,
    receiver: BufReader<pipe::Receiver>,
    timeout: Option<Duration>,
    in_path: PathBuf,
    /// Whether a command has gone through on this connection.
    used: bool,
}

impl ControlConnection {
    /// Send a command and wait for its reply.
    pub async fn send(&mut self, command: &Command) -> Result<Reply> {
        self.send_line(&command.to_string()).await
    }

    /// Send a raw line (without newline) and wait for its reply.
    pub async fn send_line(&mut self, line: &str) -> Result<Reply> {
        let mut request = String::with_capacity(line.len() + 1);
        request.push_str(line);
        request.push('\n');

        if let Err(e) = self.sender.write_all(request.as_bytes()).await {
            // The target may have dropped the previous controller's reader
            // right after we opened; the short line was not delivered.
            if e.kind() != ErrorKind::BrokenPipe || self.used {
                return Err(self.write_error(e));
            }
            debug!(pipe = %self.in_path.display(), "Control pipe reopened by target, reconnecting");
            self.sender = open_sender(&self.in_path).await?;
            self.sender
                .write_all(request.as_bytes())
                .await
                .map_err(|e| self.write_error(e))?;
        }
        self.used = true;

        let mut reply = String::new();
        let read = self.receiver.read_line(&mut reply);
        let n = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?limit, "No reply from control target");
                    return Err(ControlError::Timeout(limit));
                }
            },
            None => read.await,
        }
        .map_err(|e| ControlError::io(&self.in_path, e))?;

        if n == 0 {
            return Err(ControlError::Closed);
        }

        let reply = Reply::from_line(&reply);
        debug!(line = %line, reply = %reply, "Control command answered");
        Ok(reply)
    }

    fn write_error(&self, e: std::io::Error) -> ControlError {
        match e.kind() {
            ErrorKind::BrokenPipe => ControlError::Closed,
            _ => ControlError::io(&self.in_path, e),
        }
    }
}
