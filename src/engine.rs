//! Injection engine - the check every instrumented call site makes.
//!
//! [`Registry::check`] never allocates on the hot path, never panics and never
//! blocks on anything but the registry read lock. Random draws come from the
//! calling thread's own generator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use crate::point::{ExternalCallback, FailInfo, Mode};
use crate::registry::{Registry, Rule};

/// Outcome of checking a failure point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoFailure,
    Fail { code: i64, info: FailInfo },
}

impl Decision {
    pub fn is_fail(&self) -> bool {
        matches!(self, Decision::Fail { .. })
    }

    /// Fail code, or `0` when not failing.
    pub fn code(&self) -> i64 {
        match self {
            Decision::Fail { code, .. } => *code,
            Decision::NoFailure => 0,
        }
    }

    pub fn info(&self) -> FailInfo {
        match self {
            Decision::Fail { info, .. } => *info,
            Decision::NoFailure => FailInfo::NONE,
        }
    }
}

/// What was decided under the lock.
enum Verdict {
    Pass,
    Fail {
        code: i64,
        info: FailInfo,
        onetime: Option<Arc<AtomicBool>>,
    },
    /// External rules are evaluated after the lock is released.
    Ask {
        callback: ExternalCallback,
        code: i64,
        info: FailInfo,
        onetime: Option<Arc<AtomicBool>>,
    },
}

fn draw_below(probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rand::rng().random::<f64>() < probability
}

/// Claim a onetime rule. Only the first caller succeeds.
fn claim(onetime: Option<Arc<AtomicBool>>) -> bool {
    match onetime {
        Some(spent) => spent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok(),
        None => true,
    }
}

fn evaluate(rule: &Rule) -> Verdict {
    let point = &rule.point;
    let onetime = point.is_onetime().then(|| Arc::clone(&rule.spent));
    match point.mode() {
        Mode::Always => Verdict::Fail {
            code: point.fail_code(),
            info: point.fail_info(),
            onetime,
        },
        Mode::Random { probability } => {
            if draw_below(*probability) {
                Verdict::Fail {
                    code: point.fail_code(),
                    info: point.fail_info(),
                    onetime,
                }
            } else {
                Verdict::Pass
            }
        }
        Mode::External(callback) => Verdict::Ask {
            callback: Arc::clone(callback),
            code: point.fail_code(),
            info: point.fail_info(),
            onetime,
        },
    }
}

impl Registry {
    /// Decide whether the point `name` fails right now.
    pub fn check(&self, name: &str) -> Decision {
        let verdict = self.with_best_match(name, evaluate).unwrap_or(Verdict::Pass);

        let decision = match verdict {
            Verdict::Pass => Decision::NoFailure,
            Verdict::Fail {
                code,
                info,
                onetime,
            } => {
                if claim(onetime) {
                    Decision::Fail { code, info }
                } else {
                    Decision::NoFailure
                }
            }
            Verdict::Ask {
                callback,
                mut code,
                mut info,
                onetime,
            } => {
                if callback(name, &mut code, &mut info) && claim(onetime) {
                    Decision::Fail { code, info }
                } else {
                    Decision::NoFailure
                }
            }
        };

        if decision.is_fail() {
            trace!(name = %name, code = decision.code(), "Failure point triggered");
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::FailurePoint;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unregistered_point_passes() {
        let registry = Registry::new();
        assert_eq!(registry.check("posix/io/read"), Decision::NoFailure);
    }

    #[test]
    fn test_always_fails_with_payload() {
        let registry = Registry::new();
        registry.register(
            FailurePoint::new("posix/io/read")
                .unwrap()
                .with_fail_code(-5)
                .with_fail_info(FailInfo::new(11)),
        );

        assert_eq!(
            registry.check("posix/io/read"),
            Decision::Fail {
                code: -5,
                info: FailInfo::new(11)
            }
        );
    }

    #[test]
    fn test_probability_bounds() {
        let registry = Registry::new();
        registry.register(FailurePoint::random("never", 0.0).unwrap());
        registry.register(FailurePoint::random("always", 1.0).unwrap());

        for _ in 0..1000 {
            assert!(!registry.check("never").is_fail());
            assert!(registry.check("always").is_fail());
        }
    }

    #[test]
    fn test_disable_stops_failures() {
        let registry = Registry::new();
        registry.register(FailurePoint::new("x").unwrap());
        assert!(registry.check("x").is_fail());

        registry.unregister("x");
        assert!(!registry.check("x").is_fail());
    }

    #[test]
    fn test_onetime_fails_once() {
        let registry = Registry::new();
        registry.register(FailurePoint::new("x").unwrap().with_onetime(true));

        assert!(registry.check("x").is_fail());
        assert!(!registry.check("x").is_fail());
        assert!(!registry.is_enabled("x"));
    }

    #[test]
    fn test_spent_onetime_uncovers_wildcard() {
        let registry = Registry::new();
        registry.register(FailurePoint::new("io/*").unwrap().with_fail_code(2));
        registry.register(
            FailurePoint::new("io/read")
                .unwrap()
                .with_fail_code(1)
                .with_onetime(true),
        );

        assert_eq!(registry.check("io/read").code(), 1);
        assert_eq!(registry.check("io/read").code(), 2);
    }

    #[test]
    fn test_external_callback_decides_and_rewrites() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        registry.register(
            FailurePoint::external("ext/*", move |name, code, info| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                *code = 40 + n as i64;
                *info = FailInfo::new(name.len() as u64);
                n % 2 == 0
            })
            .unwrap(),
        );

        assert_eq!(
            registry.check("ext/abc"),
            Decision::Fail {
                code: 40,
                info: FailInfo::new(7)
            }
        );
        assert_eq!(registry.check("ext/abc"), Decision::NoFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_external_callback_may_touch_registry() {
        let registry = Registry::new();
        let inner = registry.clone();
        registry.register(
            FailurePoint::external("reentrant", move |_, _, _| {
                inner.unregister("reentrant");
                true
            })
            .unwrap(),
        );

        assert!(registry.check("reentrant").is_fail());
        assert!(!registry.check("reentrant").is_fail());
    }

    #[test]
    fn test_decision_accessors() {
        assert_eq!(Decision::NoFailure.code(), 0);
        assert!(Decision::NoFailure.info().is_none());
        let fail = Decision::Fail {
            code: 3,
            info: FailInfo::new(1),
        };
        assert_eq!(fail.code(), 3);
        assert_eq!(fail.info(), FailInfo::new(1));
    }
}
