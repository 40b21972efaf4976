//! Failure point rules.
//!
//! A [`FailurePoint`] is the unit stored in the [`Registry`](crate::Registry):
//! a name pattern plus everything needed to decide whether a matching call
//! site fails and with what payload.

use std::fmt;
use std::sync::Arc;

/// Suffix that turns a name into a prefix pattern.
pub const WILDCARD_SUFFIX: char = '*';

/// Fail code used when none is given.
pub const DEFAULT_FAIL_CODE: i64 = 1;

/// Whether a pattern names one point or a whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Exact,
    Wildcard,
}

impl PatternKind {
    /// Classify a pattern by its trailing `*`.
    pub fn of(pattern: &str) -> Self {
        if pattern.ends_with(WILDCARD_SUFFIX) {
            PatternKind::Wildcard
        } else {
            PatternKind::Exact
        }
    }
}

/// Opaque value handed to the call site alongside a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FailInfo(Option<u64>);

impl FailInfo {
    /// No associated value.
    pub const NONE: FailInfo = FailInfo(None);

    pub fn new(value: u64) -> Self {
        Self(Some(value))
    }

    pub fn value(&self) -> Option<u64> {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for FailInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => f.write_str("none"),
        }
    }
}

/// Decision callback for [`Mode::External`].
///
/// Receives the candidate name and may rewrite the fail code and info.
/// Returns `true` to fail.
pub type ExternalCallback = Arc<dyn Fn(&str, &mut i64, &mut FailInfo) -> bool + Send + Sync>;

/// How a matching rule decides to fail.
#[derive(Clone)]
pub enum Mode {
    /// Fail on every check.
    Always,
    /// Fail when a uniform draw in `[0, 1)` is below `probability`.
    Random { probability: f64 },
    /// Delegate the decision to a callback.
    External(ExternalCallback),
}

impl Mode {
    /// Random mode with the probability clamped to `[0, 1]`.
    ///
    /// NaN is treated as `0.0`.
    pub fn random(probability: f64) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        Mode::Random { probability }
    }

    /// Probability of failing, if this mode has one.
    pub fn probability(&self) -> Option<f64> {
        match self {
            Mode::Random { probability } => Some(*probability),
            _ => None,
        }
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Always => f.write_str("Always"),
            Mode::Random { probability } => f
                .debug_struct("Random")
                .field("probability", probability)
                .finish(),
            Mode::External(_) => f.write_str("External(..)"),
        }
    }
}

impl PartialEq for Mode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Mode::Always, Mode::Always) => true,
            (Mode::Random { probability: a }, Mode::Random { probability: b }) => a == b,
            (Mode::External(a), Mode::External(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A registered failure rule.
///
/// Only enabled rules exist: disabling a point removes its rule from the
/// registry.
#[derive(Debug, Clone, PartialEq)]
pub struct FailurePoint {
    name: String,
    kind: PatternKind,
    mode: Mode,
    fail_code: i64,
    fail_info: FailInfo,
    onetime: bool,
}

impl FailurePoint {
    /// Rule that always fails with the default code and no info.
    ///
    /// Returns `None` for an empty name.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            kind: PatternKind::of(&name),
            name,
            mode: Mode::Always,
            fail_code: DEFAULT_FAIL_CODE,
            fail_info: FailInfo::NONE,
            onetime: false,
        })
    }

    /// Rule that fails with the given probability.
    pub fn random(name: impl Into<String>, probability: f64) -> Option<Self> {
        Self::new(name).map(|p| p.with_mode(Mode::random(probability)))
    }

    /// Rule whose decision is made by `callback`.
    pub fn external<F>(name: impl Into<String>, callback: F) -> Option<Self>
    where
        F: Fn(&str, &mut i64, &mut FailInfo) -> bool + Send + Sync + 'static,
    {
        Self::new(name).map(|p| p.with_mode(Mode::External(Arc::new(callback))))
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = match mode {
            Mode::Random { probability } => Mode::random(probability),
            other => other,
        };
        self
    }

    pub fn with_fail_code(mut self, code: i64) -> Self {
        self.fail_code = code;
        self
    }

    pub fn with_fail_info(mut self, info: FailInfo) -> Self {
        self.fail_info = info;
        self
    }

    /// Fail at most once, then stop matching.
    pub fn with_onetime(mut self, onetime: bool) -> Self {
        self.onetime = onetime;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn fail_code(&self) -> i64 {
        self.fail_code
    }

    pub fn fail_info(&self) -> FailInfo {
        self.fail_info
    }

    pub fn is_onetime(&self) -> bool {
        self.onetime
    }

    /// Prefix matched by a wildcard rule (name without the trailing `*`).
    pub fn prefix(&self) -> Option<&str> {
        match self.kind {
            PatternKind::Wildcard => self.name.strip_suffix(WILDCARD_SUFFIX),
            PatternKind::Exact => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_rejected() {
        assert!(FailurePoint::new("").is_none());
        assert!(FailurePoint::random("", 0.5).is_none());
    }

    #[test]
    fn test_defaults() {
        let point = FailurePoint::new("posix/io/read").unwrap();
        assert_eq!(point.kind(), PatternKind::Exact);
        assert_eq!(point.mode(), &Mode::Always);
        assert_eq!(point.fail_code(), DEFAULT_FAIL_CODE);
        assert!(point.fail_info().is_none());
        assert!(!point.is_onetime());
        assert_eq!(point.prefix(), None);
    }

    #[test]
    fn test_wildcard_prefix() {
        let point = FailurePoint::new("posix/io/*").unwrap();
        assert_eq!(point.kind(), PatternKind::Wildcard);
        assert_eq!(point.prefix(), Some("posix/io/"));

        let all = FailurePoint::new("*").unwrap();
        assert_eq!(all.prefix(), Some(""));
    }

    #[test]
    fn test_probability_clamped() {
        let low = FailurePoint::random("a", -0.5).unwrap();
        assert_eq!(low.mode().probability(), Some(0.0));

        let high = FailurePoint::random("a", 1.5).unwrap();
        assert_eq!(high.mode().probability(), Some(1.0));

        let nan = FailurePoint::random("a", f64::NAN).unwrap();
        assert_eq!(nan.mode().probability(), Some(0.0));

        let direct = FailurePoint::new("a")
            .unwrap()
            .with_mode(Mode::Random { probability: 7.0 });
        assert_eq!(direct.mode().probability(), Some(1.0));
    }

    #[test]
    fn test_fail_info_display() {
        assert_eq!(FailInfo::NONE.to_string(), "none");
        assert_eq!(FailInfo::new(42).to_string(), "42");
    }
}
