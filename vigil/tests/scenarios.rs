//! End-to-end monitoring scenarios: spec files on disk, scripts executed
//! under the full lifecycle, violations checked against expectations.

use std::path::PathBuf;

use tempfile::TempDir;

use vigil::config::{Config, SpecSelection};
use vigil::lifecycle::Runtime;
use vigil_core::Algorithm;
use vigil_instrument::Strategy;

struct World {
    dir: TempDir,
    script: PathBuf,
}

fn setup(specs: &[(&str, &str)], script: &str) -> World {
    let dir = tempfile::tempdir().expect("create tempdir");
    let spec_dir = dir.path().join("specs");
    std::fs::create_dir(&spec_dir).expect("create spec folder");
    for (name, source) in specs {
        std::fs::write(spec_dir.join(format!("{}.vg", name)), source).expect("write spec");
    }
    let script_path = dir.path().join("main.vg");
    std::fs::write(&script_path, script).expect("write script");
    World {
        dir,
        script: script_path,
    }
}

fn config_for(world: &World, algorithm: Algorithm) -> Config {
    Config {
        spec_folder: Some(world.dir.path().join("specs")),
        algorithm,
        ..Config::default()
    }
}

fn line_of(script: &str, needle: &str) -> u32 {
    script
        .lines()
        .position(|l| l.contains(needle))
        .map(|i| i as u32 + 1)
        .unwrap_or_else(|| panic!("script does not contain `{}`", needle))
}

const FILE_CLOSED_SPEC: &str = r#"
class FileClosed(Spec) {
    "A file opened for writing must be closed before the program ends."

    def init(self) {
        self.params(["f"])
        self.event("open", "io.open", {"hook": "after", "binds": {"f": "result"}})
        self.event("close", "File.close", {"hook": "after", "binds": {"f": "receiver"}})
        self.end_events(["end"])
        self.fsm("""
s0 [
    open -> s1
]
s1 [
    close -> s0
    end -> s2
]
alias match = s2
""")
        self.creation_events(["open"])
    }

    def match(self, e) {
        self.violation(e, "file was never closed")
    }
}
"#;

#[test]
fn file_left_open_violates_at_open_line() {
    let script = "import io\n\nf = io.open(\"a.txt\", \"w\")\nf.write(\"hello\")\n";
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    assert_eq!(runtime.report().loaded.len(), 1);

    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let snap = runtime.dispatcher().violations().snapshot();
    let records = &snap["FileClosed"];
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].count, 1);
    assert_eq!(records[0].line, line_of(script, "io.open"));
    assert_eq!(records[0].message, "file was never closed");
}

#[test]
fn closed_file_does_not_violate() {
    let script = "import io\n\nf = io.open(\"a.txt\", \"w\")\nf.write(\"hello\")\nf.close()\n";
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    assert_eq!(runtime.dispatcher().violations().total(), 0);
}

const NON_COMPARABLE_SPEC: &str = r#"
class NonComparablePut(Spec) {
    "Items placed into a priority structure must order against themselves."

    def init(self) {
        self.params(["q"])
        self.event("pq_put", "PriorityQueue.put", {
            "hook": "before",
            "binds": {"q": "receiver"},
            "pred": self.rejects_ordering
        })
        self.event("heap_push", "heapq.heappush", {
            "hook": "before",
            "binds": {"q": "arg0"},
            "pred": self.rejects_ordering
        })
        self.ere("pq_put | heap_push")
        self.creation_events(["pq_put", "heap_push"])
    }

    def rejects_ordering(self, e) {
        args = e["args"]
        if len(args) == 0 {
            return false
        }
        x = args[len(args) - 1]
        ok = true
        try {
            ignored = x < x
        } except {
            ok = false
        }
        return not ok
    }

    def match(self, e) {
        self.violation(e, "operand cannot be ordered")
    }
}
"#;

#[test]
fn non_comparable_priority_queue_put_violates_at_call_site() {
    let script = "\
import queue

class Opaque {
    def init(self) {
        self.tag = 1
    }
}

q = queue.PriorityQueue()
q.put(5)
try {
    q.put(Opaque())
} except {
    pass
}
";
    let world = setup(&[("NonComparablePut", NON_COMPARABLE_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let snap = runtime.dispatcher().violations().snapshot();
    let records = &snap["NonComparablePut"];
    assert_eq!(records.len(), 1, "only the opaque put violates");
    assert_eq!(records[0].line, line_of(script, "q.put(Opaque())"));
    assert_eq!(records[0].message, "operand cannot be ordered");
}

#[test]
fn non_comparable_heap_push_violates_too() {
    let script = "\
import heapq

class Opaque {
    def init(self) {
        self.tag = 1
    }
}

heap = []
heapq.heappush(heap, Opaque())
";
    let world = setup(&[("NonComparablePut", NON_COMPARABLE_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    assert_eq!(
        runtime.dispatcher().violations().spec_total("NonComparablePut"),
        1
    );
}

const SOCKET_TIMEOUT_SPEC: &str = r#"
class NegativeSocketTimeout(Spec) {
    "settimeout must not receive a negative timeout."

    def init(self) {
        self.params(["s"])
        self.event("bad_timeout", "Socket.settimeout", {
            "hook": "before",
            "binds": {"s": "receiver"},
            "pred": self.is_negative
        })
        self.ere("bad_timeout")
        self.creation_events(["bad_timeout"])
    }

    def is_negative(self, e) {
        args = e["args"]
        if len(args) == 0 {
            return false
        }
        return args[0] < 0
    }

    def match(self, e) {
        self.violation(e, "socket timeout must not be negative")
    }
}
"#;

#[test]
fn negative_settimeout_violates() {
    let script = "\
import socket

s = socket.socket()
s.settimeout(5)
try {
    s.settimeout(-1)
} except {
    pass
}
";
    let world = setup(&[("NegativeSocketTimeout", SOCKET_TIMEOUT_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let snap = runtime.dispatcher().violations().snapshot();
    let records = &snap["NegativeSocketTimeout"];
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].line, line_of(script, "settimeout(-1)"));
}

const MAP_ITERATOR_SPEC: &str = r#"
class UnsafeMapIterator(Spec) {
    "A dict iterator must not be advanced after its dict is mutated."

    def init(self) {
        self.params(["d", "i"])
        self.event("createIter", "builtins.iter", {"binds": {"d": "arg0", "i": "result"}})
        self.event("updateMap", "dict.__setitem__|update|pop|clear|setdefault", {"binds": {"d": "receiver"}})
        self.event("next", "builtins.next", {"binds": {"i": "arg0"}})
        self.ere("createIter next* updateMap+ next")
        self.creation_events(["createIter"])
    }

    def match(self, e) {
        self.violation(e, "dict was mutated during iteration")
    }
}
"#;

const MAP_ITERATOR_SCRIPT: &str = "\
d1 = {\"a\": 1}
d2 = {\"b\": 2}
i1 = iter(d1)
i2 = iter(d2)
d1[\"c\"] = 3
x = next(i2)
y = next(i1)
";

/// Algorithm B slices per (dict, iterator) pair: only the mutated dict's
/// iterator violates.
#[test]
fn parametric_slicing_separates_iterator_instances() {
    let world = setup(&[("UnsafeMapIterator", MAP_ITERATOR_SPEC)], MAP_ITERATOR_SCRIPT);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let snap = runtime.dispatcher().violations().snapshot();
    let records = &snap["UnsafeMapIterator"];
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].line, line_of(MAP_ITERATOR_SCRIPT, "next(i1)"));
    // The matching instance binds both the dict and its iterator.
    assert!(records[0].binding.contains("dict"));
    assert!(records[0].binding.contains("iterator"));
}

/// The same events yield the same trajectory and violations every run.
#[test]
fn violation_output_is_deterministic() {
    let run = || {
        let world = setup(&[("UnsafeMapIterator", MAP_ITERATOR_SPEC)], MAP_ITERATOR_SCRIPT);
        let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
        runtime.run_script(&world.script, &[]).expect("script runs");
        runtime.shutdown();
        let snapshot = runtime.dispatcher().violations().snapshot();
        snapshot
            .into_iter()
            .map(|(spec, records)| {
                let lines: Vec<(String, u32, usize)> = records
                    .into_iter()
                    .map(|r| (r.message, r.line, r.count))
                    .collect();
                (spec, lines)
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn shutdown_is_idempotent() {
    let world = setup(
        &[("FileClosed", FILE_CLOSED_SPEC)],
        "import io\n\nf = io.open(\"a.txt\", \"w\")\n",
    );
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    let first = runtime.dispatcher().violations().snapshot();
    runtime.shutdown();
    runtime.shutdown();
    assert_eq!(first, runtime.dispatcher().violations().snapshot());
}

/// No monitor instance may exist without a creation event having fired.
#[test]
fn creation_discipline_holds() {
    let script = "d = {\"a\": 1}\nd[\"b\"] = 2\nd.update({\"c\": 3})\n";
    let world = setup(&[("UnsafeMapIterator", MAP_ITERATOR_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let mut monitors = 0;
    runtime.dispatcher().for_each_spec(|spec| {
        monitors += spec.monitors_created();
    });
    assert_eq!(monitors, 0, "updates without createIter must not create monitors");
    assert_eq!(runtime.dispatcher().violations().total(), 0);
}

#[test]
fn garbage_collection_reclaims_dead_monitors() {
    let script = "\
import io

def leak() {
    f = io.open(\"a.txt\", \"w\")
}
leak()
";
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);

    // With gc on, the monitor for the collected file is reclaimed before
    // the end sweep can match it.
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    assert_eq!(runtime.dispatcher().violations().total(), 0);

    // With gc off, the instance survives to the end sweep.
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);
    let config = Config {
        garbage_collection: false,
        ..config_for(&world, Algorithm::B)
    };
    let mut runtime = Runtime::init(config).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    assert_eq!(runtime.dispatcher().violations().total(), 1);
}

#[test]
fn statistics_artifacts_are_written() {
    let script = "import io\n\nf = io.open(\"a.txt\", \"w\")\n";
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);
    let stats_base = world.dir.path().join("stats.json");
    let config = Config {
        statistics: true,
        statistics_file: Some(stats_base.clone()),
        ..config_for(&world, Algorithm::B)
    };
    let mut runtime = Runtime::init(config).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let time_file = world.dir.path().join("stats-time.json");
    let violations_file = world.dir.path().join("stats-violations.json");
    let full_file = world.dir.path().join("stats-full.json");
    assert!(time_file.is_file());
    assert!(violations_file.is_file());
    assert!(full_file.is_file());

    let time: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&time_file).unwrap()).unwrap();
    assert!(time["start_time"].as_f64().unwrap() > 0.0);

    let violations: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&violations_file).unwrap()).unwrap();
    assert_eq!(violations["FileClosed"][0]["count"], 1);

    let full: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&full_file).unwrap()).unwrap();
    assert!(full["FileClosed"]["monitors"].as_u64().unwrap() >= 1);
}

#[test]
fn active_spec_selection_filters_loading() {
    let world = setup(
        &[
            ("FileClosed", FILE_CLOSED_SPEC),
            ("NegativeSocketTimeout", SOCKET_TIMEOUT_SPEC),
        ],
        "x = 1\n",
    );
    let config = Config {
        active_specs: SpecSelection::Named(vec!["FileClosed".to_string()]),
        ..config_for(&world, Algorithm::B)
    };
    let runtime = Runtime::init(config).expect("init");
    assert_eq!(runtime.report().loaded.len(), 1);
    assert_eq!(runtime.report().loaded[0].name, "FileClosed");
}

#[test]
fn missing_dependency_skips_spec_and_continues() {
    let broken = "import no_such_package\n\nclass Broken(Spec) {\n    def init(self) {\n        pass\n    }\n}\n";
    let world = setup(
        &[("Broken", broken), ("FileClosed", FILE_CLOSED_SPEC)],
        "x = 1\n",
    );
    let runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    assert_eq!(runtime.report().skipped, vec!["Broken".to_string()]);
    assert_eq!(runtime.report().loaded.len(), 1);
}

#[test]
fn missing_class_is_an_error_not_an_abort() {
    let world = setup(
        &[
            ("Nameless", "x = 1\n"),
            ("FileClosed", FILE_CLOSED_SPEC),
        ],
        "x = 1\n",
    );
    let runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    assert_eq!(runtime.report().failed.len(), 1);
    assert_eq!(runtime.report().loaded.len(), 1);
}

#[test]
fn spec_descriptions_surface_docstrings() {
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], "x = 1\n");
    let runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    let descriptions = runtime.spec_descriptions();
    assert_eq!(descriptions.len(), 1);
    assert!(descriptions[0]
        .1
        .as_deref()
        .unwrap()
        .contains("must be closed"));
}

#[test]
fn surface_spec_is_converted_and_loaded() {
    let surface = "\
spec FileClosedAnalysis
description A file opened must be closed before the program ends.
params f
event open after(io.open) binds f=result
event close after(File.close) binds f=receiver
creation open
end end
message file was never closed
fsm:
s0 [
    open -> s1
]
s1 [
    close -> s0
    end -> s2
]
alias match = s2
";
    let world = setup(&[], "import io\n\nf = io.open(\"a.txt\", \"w\")\n");
    std::fs::write(
        world.dir.path().join("specs").join("FileClosedAnalysis.mop"),
        surface,
    )
    .unwrap();

    let config = Config {
        convert_specs: true,
        ..config_for(&world, Algorithm::B)
    };
    let mut runtime = Runtime::init(config).expect("init");
    assert_eq!(runtime.report().loaded.len(), 1);
    assert_eq!(runtime.report().loaded[0].name, "FileClosedAnalysis");

    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    assert_eq!(
        runtime.dispatcher().violations().spec_total("FileClosedAnalysis"),
        1
    );
    let snap = runtime.dispatcher().violations().snapshot();
    assert_eq!(snap["FileClosedAnalysis"][0].message, "file was never closed");
}

#[test]
fn builtin_strategy_tracks_native_calls() {
    let script = "import io\n\nf = io.open(\"a.txt\", \"w\")\n";
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);
    let config = Config {
        strategy: Strategy::Builtin,
        ..config_for(&world, Algorithm::B)
    };
    let mut runtime = Runtime::init(config).expect("init");
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();
    assert_eq!(runtime.dispatcher().violations().spec_total("FileClosed"), 1);
}

const LIST_CREATED_SPEC: &str = r#"
class ListCreated(Spec) {
    "Tracks instrumented list construction."

    def init(self) {
        self.params(["l"])
        self.event("createList", "list.__init__", {"binds": {"l": "result"}})
        self.ere("createList createList")
        self.creation_events(["createList"])
    }
}
"#;

#[test]
fn vendor_modules_are_excluded_unless_enabled() {
    let run = |instrument_vendor: bool| {
        let world = setup(
            &[("ListCreated", LIST_CREATED_SPEC)],
            "import helper\nhelper.make()\n",
        );
        let vendor = world.dir.path().join("vendor");
        std::fs::create_dir(&vendor).unwrap();
        std::fs::write(
            vendor.join("helper.vg"),
            "def make() {\n    return [1, 2, 3]\n}\n",
        )
        .unwrap();
        let config = Config {
            instrument_vendor,
            ..config_for(&world, Algorithm::B)
        };
        let mut runtime = Runtime::init(config).expect("init");
        runtime.run_script(&world.script, &[]).expect("script runs");
        runtime.shutdown();
        let mut monitors = 0;
        runtime.dispatcher().for_each_spec(|spec| {
            monitors += spec.monitors_created();
        });
        monitors
    };
    assert_eq!(run(false), 0);
    assert!(run(true) >= 1);
}

#[test]
fn current_test_names_attach_to_violations() {
    let script = "import io\n\nf = io.open(\"a.txt\", \"w\")\n";
    let world = setup(&[("FileClosed", FILE_CLOSED_SPEC)], script);
    let mut runtime = Runtime::init(config_for(&world, Algorithm::B)).expect("init");
    runtime.set_current_test(Some("tests/files::open_leak".to_string()));
    runtime.run_script(&world.script, &[]).expect("script runs");
    runtime.shutdown();

    let snap = runtime.dispatcher().violations().snapshot();
    let tests: Vec<String> = snap["FileClosed"][0].tests.iter().cloned().collect();
    assert_eq!(tests, vec!["tests/files::open_leak".to_string()]);
}
