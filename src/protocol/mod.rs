//! Remote control wire protocol.
//!
//! One command per line in, one status line out. See [`command`] for the
//! grammar; replies are `0` on success and `-1` on any malformed command.

mod command;
mod reply;

pub use command::{tokenize, Command, Param, ParseError, Verb, MAX_LINE_LEN};
pub use reply::{Reply, REPLY_ERROR, REPLY_OK};
