//! Name matching between registered patterns and candidate point names.
//!
//! Patterns are compared byte-for-byte. A pattern ending in `*` matches every
//! candidate that starts with the text before the `*`, without regard to `/`
//! segment boundaries, so `posix/io/*` matches `posix/io/read` and
//! `posix/io/rw/pread`, and `posix/io*` also matches `posix/iox`.
//!
//! When several rules match, [`Specificity`] orders them: an exact match beats
//! any wildcard, a longer wildcard prefix beats a shorter one, and among equals
//! the most recently registered rule wins.

use std::cmp::Ordering;

use crate::point::WILDCARD_SUFFIX;

/// Whether `pattern` matches `candidate`.
pub fn matches(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_suffix(WILDCARD_SUFFIX) {
        Some(prefix) => candidate.starts_with(prefix),
        None => candidate == pattern,
    }
}

/// Rank of a successful match, used to pick one rule among several.
///
/// Greater is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Specificity {
    exact: bool,
    prefix_len: usize,
    seq: u64,
}

impl Specificity {
    /// Rank for an exact-name match.
    pub fn exact(seq: u64) -> Self {
        Self {
            exact: true,
            prefix_len: usize::MAX,
            seq,
        }
    }

    /// Rank for a wildcard match whose prefix is `prefix_len` bytes long.
    pub fn wildcard(prefix_len: usize, seq: u64) -> Self {
        Self {
            exact: false,
            prefix_len,
            seq,
        }
    }
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.exact
            .cmp(&other.exact)
            .then(self.prefix_len.cmp(&other.prefix_len))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
