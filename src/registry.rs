//! Failure point registry - thread-safe table of enabled rules.
//!
//! One `RwLock` guards the whole table. Lookups from instrumented call sites
//! take the read side; control calls take the write side. No I/O happens while
//! the lock is held, including log events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::matcher::{matches, Specificity};
use crate::point::{FailurePoint, PatternKind};

/// A rule as stored in the table.
pub(crate) struct Rule {
    pub(crate) point: FailurePoint,
    /// Registration order; later registrations win ties.
    pub(crate) seq: u64,
    /// Set once a onetime rule has fired. Spent rules never match.
    pub(crate) spent: Arc<AtomicBool>,
}

impl Rule {
    fn is_live(&self) -> bool {
        !self.spent.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Table {
    exact: HashMap<String, Rule>,
    wildcards: Vec<Rule>,
    next_seq: u64,
}

impl Table {
    fn best_match(&self, candidate: &str) -> Option<&Rule> {
        let exact = self
            .exact
            .get(candidate)
            .filter(|r| r.is_live())
            .map(|r| (Specificity::exact(r.seq), r));

        let wildcards = self
            .wildcards
            .iter()
            .filter(|r| r.is_live() && matches(r.point.name(), candidate))
            .map(|r| {
                let prefix_len = r.point.prefix().map(str::len).unwrap_or(0);
                (Specificity::wildcard(prefix_len, r.seq), r)
            });

        exact
            .into_iter()
            .chain(wildcards)
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, rule)| rule)
    }

    fn prune_spent(&mut self) {
        self.exact.retain(|_, r| r.is_live());
        self.wildcards.retain(Rule::is_live);
    }

    fn len(&self) -> usize {
        self.exact.values().filter(|r| r.is_live()).count()
            + self.wildcards.iter().filter(|r| r.is_live()).count()
    }
}

/// Process-wide table of failure rules.
///
/// Cloning is cheap and every clone refers to the same table, so one handle can
/// be given to the injection path and another to the control channel.
#[derive(Clone, Default)]
pub struct Registry {
    table: Arc<RwLock<Table>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a rule, replacing any rule with the same pattern.
    pub fn register(&self, point: FailurePoint) {
        let logged = point.clone();

        {
            let mut table = self.write();
            table.prune_spent();

            let seq = table.next_seq;
            table.next_seq += 1;

            let rule = Rule {
                point,
                seq,
                spent: Arc::new(AtomicBool::new(false)),
            };

            match rule.point.kind() {
                PatternKind::Exact => {
                    table.exact.insert(rule.point.name().to_string(), rule);
                }
                PatternKind::Wildcard => {
                    match table
                        .wildcards
                        .iter_mut()
                        .find(|r| r.point.name() == rule.point.name())
                    {
                        Some(existing) => *existing = rule,
                        None => table.wildcards.push(rule),
                    }
                }
            }
        }

        info!(
            name = %logged.name(),
            mode = ?logged.mode(),
            fail_code = logged.fail_code(),
            fail_info = %logged.fail_info(),
            onetime = logged.is_onetime(),
            "Enabled failure point"
        );
    }

    /// Remove the rule whose pattern equals `name`.
    ///
    /// Returns whether a rule was removed. Removing an absent rule is not an
    /// error.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut table = self.write();
            table.prune_spent();

            match PatternKind::of(name) {
                PatternKind::Exact => table.exact.remove(name).is_some(),
                PatternKind::Wildcard => {
                    let before = table.wildcards.len();
                    table.wildcards.retain(|r| r.point.name() != name);
                    table.wildcards.len() != before
                }
            }
        };

        if removed {
            info!(name = %name, "Disabled failure point");
        } else {
            debug!(name = %name, "Disable requested for unknown failure point");
        }
        removed
    }

    /// Highest-priority rule matching `candidate`.
    pub fn lookup(&self, candidate: &str) -> Option<FailurePoint> {
        self.read().best_match(candidate).map(|r| r.point.clone())
    }

    /// Run `f` on the best rule for `candidate` while holding the read lock.
    pub(crate) fn with_best_match<R>(
        &self,
        candidate: &str,
        f: impl FnOnce(&Rule) -> R,
    ) -> Option<R> {
        self.read().best_match(candidate).map(f)
    }

    /// Remove every rule.
    pub fn clear(&self) {
        let count = {
            let mut table = self.write();
            let count = table.len();
            table.exact.clear();
            table.wildcards.clear();
            count
        };
        info!(count, "Cleared failure points");
    }

    /// The rule registered under exactly this pattern, if any.
    pub fn get(&self, pattern: &str) -> Option<FailurePoint> {
        let table = self.read();
        let rule = match PatternKind::of(pattern) {
            PatternKind::Exact => table.exact.get(pattern),
            PatternKind::Wildcard => table.wildcards.iter().find(|r| r.point.name() == pattern),
        };
        rule.filter(|r| r.is_live()).map(|r| r.point.clone())
    }

    /// Whether a rule is registered under exactly this pattern.
    pub fn is_enabled(&self, pattern: &str) -> bool {
        self.get(pattern).is_some()
    }

    /// All live rules, oldest registration first.
    pub fn list(&self) -> Vec<FailurePoint> {
        let table = self.read();
        let mut rules: Vec<&Rule> = table
            .exact
            .values()
            .chain(table.wildcards.iter())
            .filter(|r| r.is_live())
            .collect();
        rules.sort_by_key(|r| r.seq);
        rules.into_iter().map(|r| r.point.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("rules", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Decision;
    use crate::point::{FailInfo, Mode};
    use std::io;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn point(name: &str) -> FailurePoint {
        FailurePoint::new(name).unwrap()
    }

    #[test]
    fn test_register_and_lookup_exact() {
        let registry = Registry::new();
        registry.register(point("posix/io/read"));

        assert_eq!(
            registry.lookup("posix/io/read").map(|p| p.name().to_string()),
            Some("posix/io/read".to_string())
        );
        assert!(registry.lookup("posix/io/write").is_none());
    }

    #[test]
    fn test_register_replaces_same_pattern() {
        let registry = Registry::new();
        registry.register(point("posix/io/read").with_fail_code(5));
        registry.register(point("posix/io/read").with_fail_code(7));
        registry.register(point("posix/io/*").with_fail_code(1));
        registry.register(FailurePoint::random("posix/io/*", 0.3).unwrap());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("posix/io/read").unwrap().fail_code(), 7);
        assert_eq!(
            registry.get("posix/io/*").unwrap().mode(),
            &Mode::Random { probability: 0.3 }
        );
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::new();
        registry.register(point("posix/io/read"));
        registry.register(point("posix/io/*"));

        assert!(registry.unregister("posix/io/*"));
        assert!(registry.is_enabled("posix/io/read"));
        assert!(!registry.is_enabled("posix/io/*"));

        assert!(registry.unregister("posix/io/read"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = Registry::new();
        registry.register(point("posix/io/read"));

        assert!(!registry.unregister("posix/io/write"));
        // Exact name does not remove a wildcard and vice versa
        assert!(!registry.unregister("posix/io/*"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let registry = Registry::new();
        registry.register(point("posix/io/read").with_fail_code(2));
        registry.register(point("posix/io/*").with_fail_code(3));

        assert_eq!(registry.lookup("posix/io/read").unwrap().fail_code(), 2);
        assert_eq!(registry.lookup("posix/io/write").unwrap().fail_code(), 3);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = Registry::new();
        registry.register(point("posix/io/rw/*").with_fail_code(3));
        registry.register(point("posix/*").with_fail_code(1));
        registry.register(point("posix/io/*").with_fail_code(2));

        assert_eq!(registry.lookup("posix/io/rw/pread").unwrap().fail_code(), 3);
        assert_eq!(registry.lookup("posix/io/close").unwrap().fail_code(), 2);
        assert_eq!(registry.lookup("posix/mm/mmap").unwrap().fail_code(), 1);
    }

    #[test]
    fn test_reregistration_refreshes_recency() {
        let registry = Registry::new();
        registry.register(point("posix/io/*").with_fail_code(1));
        registry.register(point("posix/io/*").with_fail_code(4));

        assert_eq!(registry.lookup("posix/io/read").unwrap().fail_code(), 4);
    }

    #[test]
    fn test_clear() {
        let registry = Registry::new();
        registry.register(point("a"));
        registry.register(point("b/*"));
        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.lookup("a").is_none());
        assert!(registry.lookup("b/c").is_none());
    }

    #[test]
    fn test_clones_share_table() {
        let registry = Registry::new();
        let control = registry.clone();
        control.register(point("shared").with_fail_info(FailInfo::new(9)));

        assert_eq!(
            registry.lookup("shared").unwrap().fail_info(),
            FailInfo::new(9)
        );
    }

    #[test]
    fn test_list_in_registration_order() {
        let registry = Registry::new();
        registry.register(point("b"));
        registry.register(point("a/*"));
        registry.register(point("c"));

        let names: Vec<String> = registry
            .list()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a/*", "c"]);
    }

    /// Log sink that stalls every write until the gate is released.
    struct GateWriter(Arc<Mutex<()>>);

    impl io::Write for GateWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _open = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `mutate` with a subscriber whose writes stall, and check that other
    /// threads can still look up rules meanwhile.
    fn assert_lookups_proceed_during_log_write(
        registry: &Registry,
        mutate: impl FnOnce(&Registry) + Send + 'static,
    ) {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let subscriber = {
            let gate = Arc::clone(&gate);
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::TRACE)
                .with_writer(move || GateWriter(Arc::clone(&gate)))
                .finish()
        };

        let (done_tx, done_rx) = mpsc::channel();
        let mutator = {
            let registry = registry.clone();
            thread::spawn(move || {
                tracing::subscriber::with_default(subscriber, || mutate(&registry));
                let _ = done_tx.send(());
            })
        };
        // Let the mutator reach its stalled log write
        thread::sleep(Duration::from_millis(100));

        let (checked_tx, checked_rx) = mpsc::channel();
        let checker = {
            let registry = registry.clone();
            thread::spawn(move || {
                let _ = checked_tx.send(registry.check("unrelated/point"));
            })
        };
        let decision = checked_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("lookup waited on a log write");
        assert_eq!(decision, Decision::NoFailure);
        assert!(done_rx.try_recv().is_err(), "log write did not stall");

        drop(held);
        checker.join().unwrap();
        mutator.join().unwrap();
        done_rx.recv().unwrap();
    }

    #[test]
    fn test_register_logs_outside_lock() {
        let registry = Registry::new();
        assert_lookups_proceed_during_log_write(&registry, |r| r.register(point("posix/io/*")));
        assert!(registry.is_enabled("posix/io/*"));
    }

    #[test]
    fn test_unregister_logs_outside_lock() {
        let registry = Registry::new();
        registry.register(point("posix/io/read"));
        assert_lookups_proceed_during_log_write(&registry, |r| {
            r.unregister("posix/io/read");
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_logs_outside_lock() {
        let registry = Registry::new();
        registry.register(point("posix/io/read"));
        registry.register(point("posix/mm/*"));
        assert_lookups_proceed_during_log_write(&registry, |r| r.clear());
        assert!(registry.is_empty());
    }
}
