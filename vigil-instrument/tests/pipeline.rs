//! End-to-end tests for the instrumentation pipeline: scripts on disk,
//! loaded through the hook, executing against a live dispatcher.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use regex::Regex;
use tempfile::TempDir;

use vigil_core::{
    Algorithm, Dispatcher, EventDescriptor, Hook, ParamSource, Specification, TargetSelector,
    ViolationStore,
};
use vigil_instrument::interp::Interp;
use vigil_instrument::loader::{Loader, LoaderConfig};
use vigil_instrument::shim::Strategy;
use vigil_instrument::value::{eq_values, Payload, Value};

struct Run {
    _dir: TempDir,
    _interp: Interp,
    module: Value,
}

fn run_script(src: &str, instrument: bool, dispatcher: Option<Arc<Dispatcher>>) -> Run {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path: PathBuf = dir.path().join("main.vg");
    std::fs::write(&path, src).expect("write script");

    let interp = Interp::new(Loader::new(LoaderConfig::default()));
    if let Some(dispatcher) = dispatcher {
        interp.shim.install(dispatcher, Strategy::Ast);
    }
    if instrument {
        interp.loader.install_hook(&interp, true);
    }
    let module = interp
        .loader
        .load_entry(&interp, &path)
        .expect("script runs");
    Run {
        _dir: dir,
        _interp: interp,
        module,
    }
}

fn global(run: &Run, name: &str) -> Value {
    let obj = run.module.obj().expect("module is a heap value");
    let payload = obj.payload.borrow();
    let Payload::Module(m) = &*payload else {
        panic!("expected module payload");
    };
    m.globals
        .lookup(name)
        .unwrap_or_else(|| panic!("global `{}` missing", name))
}

const EXERCISE: &str = r#"
xs = [3, 1, 2]
xs.append(4)
xs[0] = xs[0] * 10
total = 0
for x in xs {
    if x >= 30 {
        continue
    }
    total += x
}
doubled = [x * 2 for x in xs if x > 1]
d = {"a": 1}
d["b"] = 2
keys = d.keys()
s = "  pad  ".strip()
ys = sorted(xs)
chained = 1 < 2 < 3

def fact(n) {
    if n <= 1 {
        return 1
    }
    return n * fact(n - 1)
}
f6 = fact(3)

class Counter {
    def init(self) {
        self.n = 0
    }
    def bump(self, by=1) {
        self.n += by
        return self.n
    }
}
c = Counter()
c.bump()
c.bump(4)
count = c.n

caught = "no"
try {
    raise "boom"
} except err {
    caught = err
}
"#;

/// Rewriting-trigger-free observations must be identical between a plain
/// run and an instrumented run with an active (but unsubscribed)
/// dispatcher.
#[test]
fn instrumented_run_preserves_behavior() {
    let plain = run_script(EXERCISE, false, None);
    let store = Arc::new(ViolationStore::new(false, false));
    let dispatcher = Arc::new(Dispatcher::new(false, store.clone()));
    let traced = run_script(EXERCISE, true, Some(dispatcher));

    for name in [
        "xs", "total", "doubled", "d", "keys", "s", "ys", "chained", "f6", "count", "caught",
    ] {
        let a = global(&plain, name);
        let b = global(&traced, name);
        assert!(
            eq_values(&a, &b),
            "global `{}` diverged: {} vs {}",
            name,
            a.repr(),
            b.repr()
        );
    }
    assert_eq!(store.total(), 0);
}

#[test]
fn expected_plain_results() {
    let run = run_script(EXERCISE, false, None);
    assert!(eq_values(&global(&run, "total"), &Value::Int(7)));
    assert!(eq_values(&global(&run, "f6"), &Value::Int(6)));
    assert!(eq_values(&global(&run, "count"), &Value::Int(5)));
    assert!(eq_values(&global(&run, "s"), &Value::str("pad")));
    assert!(eq_values(&global(&run, "caught"), &Value::str("boom")));
    let ys = global(&run, "ys");
    assert!(eq_values(
        &ys,
        &Value::list(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(4),
            Value::Int(30),
        ])
    ));
}

fn unsafe_list_iterator_spec() -> Specification {
    let create_list = EventDescriptor {
        name: "createList".into(),
        hook: Hook::AfterCall,
        target: TargetSelector {
            type_name: "list".into(),
            method: Regex::new("^__init__$").unwrap(),
        },
        binds: vec![(0, ParamSource::Result)],
        predicate: None,
        filter: None,
    };
    let update_list = EventDescriptor {
        name: "updateList".into(),
        hook: Hook::AfterCall,
        target: TargetSelector {
            type_name: "list".into(),
            method: Regex::new("^(append|extend|insert|pop|remove|clear|sort|reverse)$").unwrap(),
        },
        binds: vec![(0, ParamSource::Receiver)],
        predicate: None,
        filter: None,
    };
    let create_iter = EventDescriptor {
        name: "createIter".into(),
        hook: Hook::AfterCall,
        target: TargetSelector {
            type_name: "builtins".into(),
            method: Regex::new("^iter$").unwrap(),
        },
        binds: vec![(0, ParamSource::Arg(0)), (1, ParamSource::Result)],
        predicate: None,
        filter: None,
    };
    let next = EventDescriptor {
        name: "next".into(),
        hook: Hook::AfterCall,
        target: TargetSelector {
            type_name: "builtins".into(),
            method: Regex::new("^next$").unwrap(),
        },
        binds: vec![(1, ParamSource::Arg(0))],
        predicate: None,
        filter: None,
    };
    Specification::builder("UnsafeListIterator")
        .event(create_list)
        .event(update_list)
        .event(create_iter)
        .event(next)
        .ere("createList updateList* createIter next* updateList+ next")
        .creation_events(["createList".to_string()])
        .message("the list was mutated while an iterator is active")
        .build()
        .unwrap()
}

#[test]
fn unsafe_list_iterator_violation_fires_at_final_next() {
    let store = Arc::new(ViolationStore::new(false, false));
    let dispatcher = Arc::new(Dispatcher::new(false, store.clone()));
    dispatcher.register(unsafe_list_iterator_spec(), Algorithm::C);

    let src = "xs = [1, 2]\nit = iter(xs)\nnext(it)\nxs.append(3)\nnext(it)\n";
    let _run = run_script(src, true, Some(dispatcher));

    let snap = store.snapshot();
    let records = &snap["UnsafeListIterator"];
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].count, 1);
    // The violating event is the final `next` on line 5; the opener is
    // the list construction on line 1.
    assert_eq!(records[0].line, 5);
    assert_eq!(records[0].opener_line, 1);
    assert!(records[0].file.ends_with("main.vg"));
}

#[test]
fn mutation_before_iterator_does_not_violate() {
    let store = Arc::new(ViolationStore::new(false, false));
    let dispatcher = Arc::new(Dispatcher::new(false, store.clone()));
    dispatcher.register(unsafe_list_iterator_spec(), Algorithm::C);

    let src = "xs = [1, 2]\nxs.append(3)\nit = iter(xs)\nnext(it)\nnext(it)\n";
    let _run = run_script(src, true, Some(dispatcher));
    assert_eq!(store.total(), 0);
}

/// Instrumented containers must be indistinguishable from plain ones
/// under `type` and `==`.
#[test]
fn container_identity_is_preserved() {
    let src = "xs = [1, 2]\nsame_type = type(xs) == list\nys = [1, 2]\nequal = xs == ys\n";
    let store = Arc::new(ViolationStore::new(false, false));
    let dispatcher = Arc::new(Dispatcher::new(false, store));
    let run = run_script(src, true, Some(dispatcher));
    assert!(eq_values(&global(&run, "same_type"), &Value::Bool(true)));
    assert!(eq_values(&global(&run, "equal"), &Value::Bool(true)));
}

#[test]
fn modules_load_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("helper.vg"), "value = 41\n").unwrap();
    std::fs::write(
        dir.path().join("main.vg"),
        "import helper\nimport helper\nx = helper.value + 1\n",
    )
    .unwrap();

    let interp = Interp::new(Loader::new(LoaderConfig::default()));
    interp.loader.install_hook(&interp, true);
    let module = interp
        .loader
        .load_entry(&interp, &dir.path().join("main.vg"))
        .unwrap();
    let run = Run {
        _dir: dir,
        _interp: interp,
        module,
    };
    assert!(eq_values(&global(&run, "x"), &Value::Int(42)));
}

#[test]
fn hook_installs_exactly_once() {
    let interp = Interp::new(Loader::new(LoaderConfig::default()));
    interp.loader.install_hook(&interp, true);
    assert!(interp.loader.hook_installed());
    // A second install is a no-op, not a double wrap.
    interp.loader.install_hook(&interp, true);
    assert!(interp.loader.hook_installed());
}

#[test]
fn failed_module_is_removed_from_registry() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.vg"), "raise \"nope\"\n").unwrap();
    std::fs::write(dir.path().join("main.vg"), "x = 1\n").unwrap();

    let interp = Interp::new(Loader::new(LoaderConfig::default()));
    interp.loader.install_hook(&interp, true);
    interp
        .loader
        .load_entry(&interp, &dir.path().join("main.vg"))
        .unwrap();

    let loc = vigil_core::SourceLocation::new("main.vg", 1, 0);
    assert!(interp.loader.import(&interp, "broken", &loc).is_err());
    assert!(!interp
        .loader
        .loaded_module_names()
        .contains(&"broken".to_string()));
}

#[test]
fn shadowed_list_name_is_respected() {
    // When user code rebinds `list`, the shadow-safe constructor must
    // call the user's binding, not the instrumented one.
    let src = "def list(x) {\n  return \"shadowed\"\n}\nout = list([1])\n";
    let store = Arc::new(ViolationStore::new(false, false));
    let dispatcher = Arc::new(Dispatcher::new(false, store));
    let run = run_script(src, true, Some(dispatcher));
    assert!(eq_values(&global(&run, "out"), &Value::str("shadowed")));
}

#[test]
fn rc_identity_of_reloaded_values() {
    // Two imports of the same module share one module object.
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("m.vg"), "v = 1\n").unwrap();
    let interp = Interp::new(Loader::new(LoaderConfig::default()));
    interp.loader.add_search_root(dir.path());
    let loc = vigil_core::SourceLocation::new("<test>", 0, 0);
    let a = interp.loader.import(&interp, "m", &loc).unwrap();
    let b = interp.loader.import(&interp, "m", &loc).unwrap();
    let (Some(a), Some(b)) = (a.obj(), b.obj()) else {
        panic!("modules are heap values");
    };
    assert!(Rc::ptr_eq(a, b));
}
