//! Routes hook firings to subscribed specifications.
//!
//! The dispatcher is the join point between the instrumentation and the
//! monitor engine. Trackers call [`Dispatcher::dispatch`] with an
//! [`EventPayload`]; the dispatcher finds the subscriptions registered for
//! the callable's type, filters by method pattern and callsite
//! constraints, evaluates predicates in subscription order, and hands true
//! events to each specification's slicer.
//!
//! Dispatch is guarded by a thread-local re-entry flag: while a predicate
//! or match action is running host code, any hooks that code fires are
//! short-circuited instead of recursing into the engine.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;

use crate::binding::Binding;
use crate::event::{EventDescriptor, EventPayload};
use crate::location::SourceLocation;
use crate::slice::{self, Algorithm, EventStep, MatchHit, Slicer};
use crate::spec::{MatchInfo, Specification};
use crate::violation::ViolationStore;

thread_local! {
    /// Whether this thread may currently begin dispatching an event. Set
    /// to `false` for the duration of a dispatch so that events triggered
    /// inside predicates or match actions cannot recurse.
    static CAN_ENTER: Cell<bool> = Cell::new(true);
}

struct Entered;

impl Entered {
    fn try_enter() -> Option<Entered> {
        CAN_ENTER.with(|flag| {
            if flag.get() {
                flag.set(false);
                Some(Entered)
            } else {
                None
            }
        })
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        CAN_ENTER.with(|flag| flag.set(true));
    }
}

/// Runs `f` with event dispatch suppressed on the current thread.
///
/// Specification files execute through the same instrumented runtime as
/// user code; their own loading must not feed the monitors.
pub fn suppressed<R>(f: impl FnOnce() -> R) -> R {
    let _entered = Entered::try_enter();
    f()
}

#[derive(Debug, Clone, Copy)]
struct Route {
    spec: usize,
    event: usize,
}

/// A registered specification together with its mutable monitoring state.
///
/// Slicer mutations are serialized by the per-spec mutex; the match action
/// runs outside it.
pub struct MonitoredSpec {
    pub spec: Specification,
    slicer: Mutex<Box<dyn Slicer>>,
    monitors_created: AtomicUsize,
    events_seen: Mutex<BTreeMap<String, usize>>,
}

impl MonitoredSpec {
    fn deliver(&self, event: &EventDescriptor, payload: &EventPayload<'_>, store: &ViolationStore) {
        {
            let mut seen = self.events_seen.lock().unwrap();
            *seen.entry(event.name.clone()).or_insert(0) += 1;
        }

        let mut binding = Binding::new();
        for (pos, source) in &event.binds {
            if let Some(operand) = payload.operand(source) {
                binding.bind(*pos, operand);
            }
        }

        let step = EventStep {
            event: &event.name,
            is_creation: self.spec.is_creation_event(&event.name),
            binding,
            location: Some(&payload.location),
        };
        let outcome = {
            let mut slicer = self.slicer.lock().unwrap();
            slicer.handle(&self.spec.automaton, &step)
        };
        self.monitors_created
            .fetch_add(outcome.created, Ordering::Relaxed);
        for hit in outcome.hits {
            self.report(&event.name, &hit, Some(&payload.location), store);
        }
    }

    fn report(
        &self,
        event: &str,
        hit: &MatchHit,
        event_location: Option<&SourceLocation>,
        store: &ViolationStore,
    ) {
        static UNKNOWN: Lazy<SourceLocation> = Lazy::new(|| SourceLocation::new("<unknown>", 0, 0));
        let location = event_location
            .cloned()
            .or_else(|| hit.opener.clone())
            .unwrap_or_else(|| UNKNOWN.clone());
        let opener = hit
            .opener
            .clone()
            .or_else(|| event_location.cloned())
            .unwrap_or_else(|| UNKNOWN.clone());

        let custom = self.spec.on_match.as_ref().and_then(|action| {
            action(&MatchInfo {
                spec: &self.spec.name,
                event,
                binding: &hit.binding,
                location: &location,
            })
        });
        let message = custom.unwrap_or_else(|| self.spec.default_message().to_string());
        store.record(
            &self.spec.name,
            event,
            &message,
            &hit.binding.to_string(),
            &location,
            &opener,
        );
    }

    pub fn monitors_created(&self) -> usize {
        self.monitors_created.load(Ordering::Relaxed)
    }

    pub fn live_instances(&self) -> usize {
        self.slicer.lock().unwrap().live_instances()
    }

    pub fn event_counts(&self) -> BTreeMap<String, usize> {
        self.events_seen.lock().unwrap().clone()
    }
}

/// The event dispatcher and specification registry.
pub struct Dispatcher {
    specs: RwLock<Vec<Arc<MonitoredSpec>>>,
    /// `type name -> routes`; hook and method pattern are checked per
    /// descriptor.
    routes: RwLock<HashMap<String, Vec<Route>>>,
    violations: Arc<ViolationStore>,
    gc_enabled: bool,
    swept: AtomicBool,
}

impl Dispatcher {
    pub fn new(gc_enabled: bool, violations: Arc<ViolationStore>) -> Self {
        Self {
            specs: RwLock::new(Vec::new()),
            routes: RwLock::new(HashMap::new()),
            violations,
            gc_enabled,
            swept: AtomicBool::new(false),
        }
    }

    pub fn violations(&self) -> &Arc<ViolationStore> {
        &self.violations
    }

    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    /// Registers a specification under `algorithm` and subscribes its
    /// events. Returns the spec's registry index.
    pub fn register(&self, spec: Specification, algorithm: Algorithm) -> usize {
        let slicer = slice::new_slicer(algorithm, self.gc_enabled);
        // Algorithm A's single instance exists from registration time.
        let seeded = if algorithm == Algorithm::A { 1 } else { 0 };

        let monitored = Arc::new(MonitoredSpec {
            spec,
            slicer: Mutex::new(slicer),
            monitors_created: AtomicUsize::new(seeded),
            events_seen: Mutex::new(BTreeMap::new()),
        });

        let mut specs = self.specs.write().unwrap();
        let index = specs.len();
        let mut routes = self.routes.write().unwrap();
        for (event_index, event) in monitored.spec.events.iter().enumerate() {
            routes
                .entry(event.target.type_name.clone())
                .or_default()
                .push(Route {
                    spec: index,
                    event: event_index,
                });
        }
        specs.push(monitored);
        index
    }

    /// Delivers one hook firing to every interested subscription.
    ///
    /// Re-entrant calls (from predicates or match actions) return
    /// immediately.
    pub fn dispatch(&self, payload: &EventPayload<'_>) {
        let Some(_entered) = Entered::try_enter() else {
            return;
        };
        let specs = self.specs.read().unwrap();
        let routes = self.routes.read().unwrap();
        let Some(entries) = routes.get(payload.callable.type_name) else {
            return;
        };
        for route in entries {
            let monitored = &specs[route.spec];
            let event = &monitored.spec.events[route.event];
            if !event.selects(payload) {
                continue;
            }
            if let Some(predicate) = &event.predicate {
                if !predicate(payload) {
                    continue;
                }
            }
            monitored.deliver(event, payload, &self.violations);
        }
    }

    /// End-of-execution sweep: fires each specification's end events once
    /// against every live monitor instance. Idempotent: repeated calls do
    /// nothing.
    pub fn end_sweep(&self) {
        if self.swept.swap(true, Ordering::SeqCst) {
            return;
        }
        let _entered = Entered::try_enter();
        let specs = self.specs.read().unwrap();
        for monitored in specs.iter() {
            if self.gc_enabled {
                monitored.slicer.lock().unwrap().sweep_dead_bindings();
            }
            for end_event in monitored.spec.end_events.clone() {
                let step = EventStep {
                    event: &end_event,
                    is_creation: monitored.spec.is_creation_event(&end_event),
                    binding: Binding::new(),
                    location: None,
                };
                let outcome = {
                    let mut slicer = monitored.slicer.lock().unwrap();
                    slicer.handle(&monitored.spec.automaton, &step)
                };
                monitored
                    .monitors_created
                    .fetch_add(outcome.created, Ordering::Relaxed);
                for hit in outcome.hits {
                    monitored.report(&end_event, &hit, None, &self.violations);
                }
            }
        }
    }

    /// Snapshot accessor over registered specs, for reporting.
    pub fn for_each_spec(&self, mut f: impl FnMut(&MonitoredSpec)) {
        let specs = self.specs.read().unwrap();
        for spec in specs.iter() {
            f(spec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CallableDesc, Hook, ParamSource, TargetSelector};
    use crate::operand::{ObjRef, Operand};
    use regex::Regex;
    use std::rc::Rc;

    fn open_close_spec() -> Specification {
        let open = EventDescriptor {
            name: "open".into(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "io".into(),
                method: Regex::new("^open$").unwrap(),
            },
            binds: vec![(0, ParamSource::Result)],
            predicate: None,
            filter: None,
        };
        let close = EventDescriptor {
            name: "close".into(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "File".into(),
                method: Regex::new("^close$").unwrap(),
            },
            binds: vec![(0, ParamSource::Receiver)],
            predicate: None,
            filter: None,
        };
        let end = EventDescriptor {
            name: "end".into(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "<end>".into(),
                method: Regex::new("^$").unwrap(),
            },
            binds: vec![],
            predicate: None,
            filter: None,
        };
        Specification::builder("FileClosed")
            .event(open)
            .event(close)
            .event(end)
            .fsm("s0 [\n  open -> s1\n]\ns1 [\n  close -> s0\n  end -> s2\n]\nalias match = s2\n")
            .creation_events(["open".to_string()])
            .end_events(["end".to_string()])
            .message("file was never closed")
            .build()
            .unwrap()
    }

    fn open_payload<'a>(
        file_ref: &'a [Operand],
        location: SourceLocation,
    ) -> EventPayload<'a> {
        EventPayload {
            hook: Hook::AfterCall,
            callable: CallableDesc::new("io", "open"),
            receiver: None,
            args: &[],
            kwargs: &[],
            result: file_ref.first(),
            location,
            host: None,
        }
    }

    #[test]
    fn open_without_close_violates_at_open_line() {
        let store = Arc::new(ViolationStore::new(false, false));
        let dispatcher = Dispatcher::new(false, store.clone());
        dispatcher.register(open_close_spec(), Algorithm::B);

        let file = Rc::new("file-object");
        let operands = [Operand::Ref(ObjRef::capture(&file, "File"))];
        dispatcher.dispatch(&open_payload(&operands, SourceLocation::new("main.vg", 7, 4)));
        dispatcher.end_sweep();

        let snap = store.snapshot();
        let records = &snap["FileClosed"];
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, 7);
        assert_eq!(records[0].message, "file was never closed");
    }

    #[test]
    fn close_prevents_violation() {
        let store = Arc::new(ViolationStore::new(false, false));
        let dispatcher = Dispatcher::new(false, store.clone());
        dispatcher.register(open_close_spec(), Algorithm::B);

        let file = Rc::new("file-object");
        let operand = Operand::Ref(ObjRef::capture(&file, "File"));
        let operands = [operand.clone()];
        dispatcher.dispatch(&open_payload(&operands, SourceLocation::new("main.vg", 7, 4)));
        let close = EventPayload {
            hook: Hook::AfterCall,
            callable: CallableDesc::new("File", "close"),
            receiver: Some(&operand),
            args: &[],
            kwargs: &[],
            result: None,
            location: SourceLocation::new("main.vg", 9, 4),
            host: None,
        };
        dispatcher.dispatch(&close);
        dispatcher.end_sweep();
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn end_sweep_is_idempotent() {
        let store = Arc::new(ViolationStore::new(false, false));
        let dispatcher = Dispatcher::new(false, store.clone());
        dispatcher.register(open_close_spec(), Algorithm::B);

        let file = Rc::new("file-object");
        let operands = [Operand::Ref(ObjRef::capture(&file, "File"))];
        dispatcher.dispatch(&open_payload(&operands, SourceLocation::new("main.vg", 3, 0)));
        dispatcher.end_sweep();
        dispatcher.end_sweep();
        assert_eq!(store.total(), 1);
    }

    #[test]
    fn predicate_filters_events() {
        let settimeout = EventDescriptor {
            name: "bad_timeout".into(),
            hook: Hook::BeforeCall,
            target: TargetSelector {
                type_name: "Socket".into(),
                method: Regex::new("^settimeout$").unwrap(),
            },
            binds: vec![(0, ParamSource::Receiver)],
            predicate: Some(Box::new(|payload: &EventPayload<'_>| {
                matches!(payload.args.first(), Some(Operand::Int(i)) if *i < 0)
                    || matches!(payload.args.first(), Some(Operand::Float(f)) if *f < 0.0)
            })),
            filter: None,
        };
        let spec = Specification::builder("NegativeTimeout")
            .event(settimeout)
            .ere("bad_timeout")
            .creation_events(["bad_timeout".to_string()])
            .build()
            .unwrap();

        let store = Arc::new(ViolationStore::new(false, false));
        let dispatcher = Dispatcher::new(false, store.clone());
        dispatcher.register(spec, Algorithm::B);

        let sock = Rc::new("socket");
        let recv = Operand::Ref(ObjRef::capture(&sock, "Socket"));
        for (value, line) in [(5i64, 2u32), (-1, 3)] {
            let args = [Operand::Int(value)];
            let payload = EventPayload {
                hook: Hook::BeforeCall,
                callable: CallableDesc::new("Socket", "settimeout"),
                receiver: Some(&recv),
                args: &args,
                kwargs: &[],
                result: None,
                location: SourceLocation::new("main.vg", line, 0),
                host: None,
            };
            dispatcher.dispatch(&payload);
        }
        let snap = store.snapshot();
        let records = &snap["NegativeTimeout"];
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, 3);
    }

    #[test]
    fn reentrant_dispatch_is_short_circuited() {
        let store = Arc::new(ViolationStore::new(false, false));
        let dispatcher = Arc::new(Dispatcher::new(false, store.clone()));

        let inner = dispatcher.clone();
        let reentrant = EventDescriptor {
            name: "open".into(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "io".into(),
                method: Regex::new("^open$").unwrap(),
            },
            binds: vec![],
            predicate: Some(Box::new(move |payload: &EventPayload<'_>| {
                // A predicate whose host code re-fires the same hook; the
                // nested dispatch must be dropped.
                inner.dispatch(payload);
                true
            })),
            filter: None,
        };
        let spec = Specification::builder("Reentrant")
            .event(reentrant)
            .ere("open open")
            .creation_events(["open".to_string()])
            .build()
            .unwrap();
        dispatcher.register(spec, Algorithm::A);

        let payload = EventPayload {
            hook: Hook::AfterCall,
            callable: CallableDesc::new("io", "open"),
            receiver: None,
            args: &[],
            kwargs: &[],
            result: None,
            location: SourceLocation::new("main.vg", 1, 0),
            host: None,
        };
        dispatcher.dispatch(&payload);
        // One real firing advanced the automaton one step; the nested one
        // was suppressed, so the two-step property has not matched.
        assert_eq!(store.total(), 0);
    }
}
