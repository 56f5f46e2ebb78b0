//! Violation recording and deduplication.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

use crate::location::SourceLocation;

/// One deduplicated violation: a property match at a particular opener
/// site.
///
/// Violations are keyed by specification plus the *opener*: the file and
/// line of the creation event of the matching monitor instance. A
/// property violated in a loop therefore reports once and counts
/// repetitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub spec: String,
    pub event: String,
    pub message: String,
    /// Display form of the matching instance's parameter binding.
    pub binding: String,
    /// Where the violating event fired.
    pub file: String,
    pub line: u32,
    /// The dedup key: where the matching instance was created.
    pub opener_file: String,
    pub opener_line: u32,
    pub count: usize,
    /// Names of the tests that were current when occurrences were seen.
    pub tests: BTreeSet<String>,
}

impl ViolationRecord {
    /// The console line format.
    pub fn format_line(&self) -> String {
        format!(
            "Spec - {}: {}. file {}, line {}.",
            self.spec, self.message, self.file, self.line
        )
    }
}

impl fmt::Display for ViolationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_line())
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_spec: BTreeMap<String, Vec<ViolationRecord>>,
    current_test: Option<String>,
}

/// The shared multiset of violations.
///
/// `print_to_console` echoes each occurrence as it happens; `suppress`
/// (the `no-print` knob) wins over it.
#[derive(Debug)]
pub struct ViolationStore {
    inner: Mutex<Inner>,
    print_to_console: bool,
    suppress: bool,
}

impl ViolationStore {
    pub fn new(print_to_console: bool, suppress: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            print_to_console,
            suppress,
        }
    }

    /// Sets the test name attached to subsequent occurrences. The harness
    /// integration calls this; `None` clears it.
    pub fn set_current_test(&self, test: Option<String>) {
        self.inner.lock().unwrap().current_test = test;
    }

    /// Records one occurrence. Returns whether this was the first
    /// occurrence at its opener site.
    pub fn record(
        &self,
        spec: &str,
        event: &str,
        message: &str,
        binding: &str,
        location: &SourceLocation,
        opener: &SourceLocation,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let current_test = inner.current_test.clone();
        let records = inner.by_spec.entry(spec.to_string()).or_default();
        let existing = records
            .iter_mut()
            .find(|r| r.opener_file == opener.file() && r.opener_line == opener.line());
        let first = existing.is_none();
        match existing {
            Some(record) => {
                record.count += 1;
                if let Some(test) = current_test {
                    record.tests.insert(test);
                }
            }
            None => {
                let mut tests = BTreeSet::new();
                if let Some(test) = current_test {
                    tests.insert(test);
                }
                records.push(ViolationRecord {
                    spec: spec.to_string(),
                    event: event.to_string(),
                    message: message.to_string(),
                    binding: binding.to_string(),
                    file: location.file().to_string(),
                    line: location.line(),
                    opener_file: opener.file().to_string(),
                    opener_line: opener.line(),
                    count: 1,
                    tests,
                });
            }
        }
        if self.print_to_console && !self.suppress {
            let record = records
                .iter()
                .find(|r| r.opener_file == opener.file() && r.opener_line == opener.line())
                .expect("record was just inserted");
            println!("{}", record.format_line());
        }
        first
    }

    pub fn total(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .by_spec
            .values()
            .flat_map(|rs| rs.iter())
            .map(|r| r.count)
            .sum()
    }

    pub fn spec_total(&self, spec: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .by_spec
            .get(spec)
            .map(|rs| rs.iter().map(|r| r.count).sum())
            .unwrap_or(0)
    }

    /// A stable snapshot for reporting, ordered by spec name.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ViolationRecord>> {
        self.inner.lock().unwrap().by_spec.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(file: &str, line: u32) -> SourceLocation {
        SourceLocation::new(file, line, 0)
    }

    #[test]
    fn dedups_by_opener_site() {
        let store = ViolationStore::new(false, false);
        let opener = loc("a.vg", 3);
        assert!(store.record("Closed", "end", "file left open", "[]", &loc("a.vg", 9), &opener));
        assert!(!store.record("Closed", "end", "file left open", "[]", &loc("a.vg", 11), &opener));
        let snap = store.snapshot();
        let records = &snap["Closed"];
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        // The reported location stays at the first occurrence.
        assert_eq!(records[0].line, 9);
    }

    #[test]
    fn distinct_openers_are_distinct_records() {
        let store = ViolationStore::new(false, false);
        store.record("Closed", "end", "m", "[]", &loc("a.vg", 9), &loc("a.vg", 3));
        store.record("Closed", "end", "m", "[]", &loc("a.vg", 9), &loc("a.vg", 5));
        assert_eq!(store.snapshot()["Closed"].len(), 2);
        assert_eq!(store.total(), 2);
    }

    #[test]
    fn current_test_names_accumulate() {
        let store = ViolationStore::new(false, false);
        let opener = loc("a.vg", 3);
        store.set_current_test(Some("tests/one".into()));
        store.record("S", "e", "m", "[]", &loc("a.vg", 4), &opener);
        store.set_current_test(Some("tests/two".into()));
        store.record("S", "e", "m", "[]", &loc("a.vg", 4), &opener);
        let snap = store.snapshot();
        let tests: Vec<_> = snap["S"][0].tests.iter().cloned().collect();
        assert_eq!(tests, vec!["tests/one".to_string(), "tests/two".to_string()]);
    }

    #[test]
    fn line_format_is_stable() {
        let r = ViolationRecord {
            spec: "UnsafeListIterator".into(),
            event: "next".into(),
            message: "the list was mutated during iteration".into(),
            binding: "[]".into(),
            file: "prog.vg".into(),
            line: 12,
            opener_file: "prog.vg".into(),
            opener_line: 4,
            count: 1,
            tests: BTreeSet::new(),
        };
        assert_eq!(
            r.format_line(),
            "Spec - UnsafeListIterator: the list was mutated during iteration. \
             file prog.vg, line 12."
        );
    }
}
