//! Specification discovery and loading.
//!
//! Specifications are `.vg` files in the configured spec folder. Each file
//! defines a class named after the file, subclassing the native `Spec`
//! base class; its `init` method declares parameters, events (with
//! optional predicates and callsite filters), exactly one property
//! (`ere` or `fsm`), and the creation/end event lists. The registry
//! executes each file with shim globals but no rewriting, instantiates
//! the class, and compiles the declarations onto the core engine.
//!
//! Failure policy: a missing host dependency skips the spec with a
//! `SKIPPED` line; a missing class or a malformed declaration logs an
//! error; neither prevents other specs from loading.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use vigil_core::{
    Algorithm, CallsiteFilter, Dispatcher, EventDescriptor, EventPayload, Hook, MatchInfo,
    ParamSource, SourceLocation, Specification, TargetSelector,
};
use vigil_instrument::interp::{Interp, VmError, VmErrorKind};
use vigil_instrument::shim::HostEvent;
use vigil_instrument::value::{NativeCall, NativeFn, Obj, OpaqueData, Payload, Value};

const STATE_ATTR: &str = "__spec_state__";

#[derive(Debug, Error)]
pub enum SpecLoadError {
    #[error("spec `{0}`: {1}")]
    Host(String, VmError),
    #[error("spec `{0}`: class `{0}` not found in file")]
    ClassMissing(String),
    #[error("spec `{0}` declares nothing (no events)")]
    EmptyDeclaration(String),
    #[error("spec `{name}`: unknown parameter `{param}` in binds")]
    UnknownParam { name: String, param: String },
    #[error("spec `{name}`: bad operand source `{source_str}`")]
    BadSource { name: String, source_str: String },
    #[error("spec `{name}`: unknown hook `{hook}`")]
    BadHook { name: String, hook: String },
    #[error("spec `{name}`: bad target `{target}` (expected `type.method-pattern`)")]
    BadTarget { name: String, target: String },
    #[error("spec `{name}`: bad method pattern: {error}")]
    BadPattern { name: String, error: regex::Error },
    #[error(transparent)]
    Spec(#[from] vigil_core::SpecError),
}

/// One event declaration accumulated by the host-side `Spec` methods.
#[derive(Default)]
pub struct PendingEvent {
    pub name: String,
    pub target: String,
    pub hook: String,
    pub pred: Option<Value>,
    /// `parameter name -> operand source` pairs.
    pub binds: Vec<(String, String)>,
    pub positions: Vec<usize>,
    pub callers: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Ere,
    Fsm,
}

/// Everything a spec class declared through the native base methods.
#[derive(Default)]
pub struct SpecState {
    pub params: Vec<String>,
    pub events: Vec<PendingEvent>,
    pub properties: Vec<(PropertyKind, String)>,
    pub creation: Vec<String>,
    pub end: Vec<String>,
    /// Set by `self.violation(...)` inside a running match action.
    pub pending_message: Option<String>,
}

pub struct SpecInfo {
    pub name: String,
    pub description: Option<String>,
}

/// The outcome of a registry load pass.
#[derive(Default)]
pub struct RegistryReport {
    pub loaded: Vec<SpecInfo>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Enumerates spec names (file stems) in the folder, sorted.
pub fn discover_specs(folder: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "vg").unwrap_or(false) {
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Loads every selected spec in the folder onto the dispatcher.
pub fn load_specs(
    interp: &Rc<Interp>,
    dispatcher: &Arc<Dispatcher>,
    folder: &Path,
    selection: &crate::config::SpecSelection,
    algorithm: Algorithm,
    detailed: bool,
) -> RegistryReport {
    let mut report = RegistryReport::default();
    let names = match discover_specs(folder) {
        Ok(names) => names,
        Err(err) => {
            warn!(folder = %folder.display(), error = %err, "cannot enumerate spec folder");
            return report;
        }
    };

    let base = spec_base_class();
    for name in names {
        if !selection.selects(&name) {
            continue;
        }
        let path = folder.join(format!("{}.vg", name));
        match load_one(interp, dispatcher, &base, &name, &path, algorithm) {
            Ok(info) => {
                if detailed {
                    println!(
                        "* Successfully imported spec class '{}' from '{}'",
                        name,
                        path.display()
                    );
                }
                report.loaded.push(info);
            }
            Err(SpecLoadError::Host(_, err)) if err.kind == VmErrorKind::Import => {
                println!(
                    "* SKIPPED: Missing dependency while importing '{}' from '{}'.",
                    name,
                    path.display()
                );
                report.skipped.push(name);
            }
            Err(SpecLoadError::ClassMissing(_)) => {
                println!(
                    "* ERROR: Cannot find spec class '{}' in '{}'",
                    name,
                    path.display()
                );
                report.failed.push((name, "class missing".to_string()));
            }
            Err(err) => {
                println!("Vigil: Error creating monitor for spec {}: {}", name, err);
                report.failed.push((name, err.to_string()));
            }
        }
    }
    report
}

fn load_one(
    interp: &Rc<Interp>,
    dispatcher: &Arc<Dispatcher>,
    base: &Value,
    name: &str,
    path: &Path,
    algorithm: Algorithm,
) -> Result<SpecInfo, SpecLoadError> {
    let base = base.clone();
    // Spec-file execution must not feed the monitors of specs loaded
    // earlier in the same pass.
    let module = vigil_core::dispatch::suppressed(|| {
        interp.loader.load_isolated(interp, path, move |env| {
            env.define("Spec", base);
        })
    })
    .map_err(|e| SpecLoadError::Host(name.to_string(), e))?;

    let class = module_global(&module, name).ok_or_else(|| {
        SpecLoadError::ClassMissing(name.to_string())
    })?;
    let description = class_doc(&class);

    let loc = SourceLocation::new(path.to_string_lossy().to_string(), 0, 0);
    let instance = vigil_core::dispatch::suppressed(|| {
        interp.invoke(&class, vec![], vec![], &loc)
    })
    .map_err(|e| SpecLoadError::Host(name.to_string(), e))?;

    let state = instance_state(&instance)
        .ok_or_else(|| SpecLoadError::EmptyDeclaration(name.to_string()))?;

    finalize_spec(
        interp, name, description.clone(), &instance, &state, dispatcher, algorithm,
    )?;
    debug!(spec = name, "registered specification");
    Ok(SpecInfo {
        name: name.to_string(),
        description,
    })
}

/// Compiles the accumulated declarations into a core specification and
/// registers it.
pub fn finalize_spec(
    interp: &Rc<Interp>,
    name: &str,
    description: Option<String>,
    instance: &Value,
    state: &Rc<RefCell<SpecState>>,
    dispatcher: &Arc<Dispatcher>,
    algorithm: Algorithm,
) -> Result<(), SpecLoadError> {
    let snapshot = state.borrow();
    if snapshot.events.is_empty() {
        return Err(SpecLoadError::EmptyDeclaration(name.to_string()));
    }

    let param_index = |param: &str| -> Result<usize, SpecLoadError> {
        snapshot
            .params
            .iter()
            .position(|p| p == param)
            .ok_or_else(|| SpecLoadError::UnknownParam {
                name: name.to_string(),
                param: param.to_string(),
            })
    };

    let mut builder = Specification::builder(name);
    if let Some(desc) = &description {
        builder = builder.description(desc.clone());
    }

    for pending in &snapshot.events {
        let (type_name, pattern) =
            pending
                .target
                .split_once('.')
                .ok_or_else(|| SpecLoadError::BadTarget {
                    name: name.to_string(),
                    target: pending.target.clone(),
                })?;
        let method = Regex::new(&format!("^(?:{})$", pattern)).map_err(|error| {
            SpecLoadError::BadPattern {
                name: name.to_string(),
                error,
            }
        })?;

        let hook = parse_hook(&pending.hook).ok_or_else(|| SpecLoadError::BadHook {
            name: name.to_string(),
            hook: pending.hook.clone(),
        })?;

        let mut binds = Vec::new();
        for (param, source) in &pending.binds {
            let position = param_index(param)?;
            let source = parse_source(source).ok_or_else(|| SpecLoadError::BadSource {
                name: name.to_string(),
                source_str: source.clone(),
            })?;
            binds.push((position, source));
        }

        let filter = if pending.positions.is_empty() {
            None
        } else {
            Some(CallsiteFilter {
                positions: pending.positions.iter().copied().collect(),
                names: pending
                    .callers
                    .iter()
                    .map(|caller| match caller.split_once('.') {
                        Some((class, method)) => (class.to_string(), method.to_string()),
                        None => (caller.clone(), String::new()),
                    })
                    .collect(),
            })
        };

        let predicate = pending.pred.as_ref().map(|pred| {
            predicate_adapter(interp, pred.clone(), pending.name.clone())
        });

        builder = builder.event(EventDescriptor {
            name: pending.name.clone(),
            hook,
            target: TargetSelector {
                type_name: type_name.to_string(),
                method,
            },
            binds,
            predicate,
            filter,
        });
    }

    // End events need no host-visible target; undeclared names get a
    // synthetic descriptor so the automaton check passes.
    for end_name in &snapshot.end {
        if snapshot.events.iter().any(|e| &e.name == end_name) {
            continue;
        }
        builder = builder.event(EventDescriptor {
            name: end_name.clone(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "<end>".to_string(),
                method: Regex::new("^$").expect("static pattern"),
            },
            binds: vec![],
            predicate: None,
            filter: None,
        });
    }

    for (kind, text) in &snapshot.properties {
        builder = match kind {
            PropertyKind::Ere => builder.ere(text.clone()),
            PropertyKind::Fsm => builder.fsm(text.clone()),
        };
    }
    builder = builder.creation_events(snapshot.creation.iter().cloned());
    builder = builder.end_events(snapshot.end.iter().cloned());

    let has_match_method = instance_class(instance)
        .map(|class| interp.find_class_attr(&class, "match").is_some())
        .unwrap_or(false);
    if has_match_method {
        builder = builder.on_match(match_adapter(
            interp,
            instance.clone(),
            state.clone(),
        ));
    }
    drop(snapshot);

    let spec = builder.build()?;
    dispatcher.register(spec, algorithm);
    Ok(())
}

fn parse_hook(hook: &str) -> Option<Hook> {
    Some(match hook {
        "" | "after" => Hook::AfterCall,
        "before" => Hook::BeforeCall,
        "compare" => Hook::Compare,
        "arith" => Hook::Arith,
        "str_op" => Hook::StrOp,
        "loop_start" => Hook::ForLoopStart,
        "loop_end" => Hook::ForLoopEnd,
        "iter_new" => Hook::IterNew,
        "iter_next" => Hook::IterNext,
        _ => return None,
    })
}

fn parse_source(source: &str) -> Option<ParamSource> {
    if source == "receiver" {
        return Some(ParamSource::Receiver);
    }
    if source == "result" {
        return Some(ParamSource::Result);
    }
    if let Some(n) = source.strip_prefix("arg") {
        return n.parse().ok().map(ParamSource::Arg);
    }
    if let Some(name) = source.strip_prefix("kwarg:") {
        return Some(ParamSource::Kwarg(name.to_string()));
    }
    None
}

/// Wraps a host predicate function into an engine predicate. Host errors
/// are swallowed, logged, and counted; the event then does not fire.
fn predicate_adapter(
    interp: &Rc<Interp>,
    pred: Value,
    event_name: String,
) -> Box<dyn Fn(&EventPayload<'_>) -> bool> {
    let interp: Weak<Interp> = Rc::downgrade(interp);
    Box::new(move |payload| {
        let Some(interp) = interp.upgrade() else {
            return false;
        };
        let Some(host) = payload.host.and_then(|h| h.downcast_ref::<HostEvent>()) else {
            return false;
        };
        let event = event_value(&event_name, host, &payload.location);
        match interp.invoke(&pred, vec![event], vec![], &payload.location) {
            Ok(v) => v.truthy(),
            Err(err) => {
                warn!(event = %event_name, error = %err, "event predicate raised");
                interp.shim.note_callback_error();
                false
            }
        }
    })
}

/// Wraps the spec instance's `match` method into the core match action.
/// The custom message comes from `self.violation(...)` or from a string
/// return value.
fn match_adapter(
    interp: &Rc<Interp>,
    instance: Value,
    state: Rc<RefCell<SpecState>>,
) -> Box<dyn Fn(&MatchInfo<'_>) -> Option<String>> {
    let interp: Weak<Interp> = Rc::downgrade(interp);
    Box::new(move |info| {
        let interp = interp.upgrade()?;
        let method = interp.get_attr(&instance, "match", info.location).ok()?;
        let event = Value::dict(vec![
            (Value::str("spec"), Value::str(info.spec)),
            (Value::str("event"), Value::str(info.event)),
            (Value::str("file"), Value::str(info.location.file())),
            (Value::str("line"), Value::Int(info.location.line() as i64)),
            (Value::str("binding"), Value::str(info.binding.to_string())),
        ]);
        match interp.invoke(&method, vec![event], vec![], info.location) {
            Ok(returned) => {
                let stashed = state.borrow_mut().pending_message.take();
                stashed.or(match returned {
                    Value::Str(s) => Some(s.to_string()),
                    _ => None,
                })
            }
            Err(err) => {
                warn!(spec = info.spec, error = %err, "match action raised");
                interp.shim.note_callback_error();
                state.borrow_mut().pending_message.take()
            }
        }
    })
}

/// The event dictionary handed to host predicates.
fn event_value(name: &str, host: &HostEvent, loc: &SourceLocation) -> Value {
    let kwargs = Value::dict(
        host.kwargs
            .iter()
            .map(|(k, v)| (Value::str(k.as_str()), v.clone()))
            .collect(),
    );
    Value::dict(vec![
        (Value::str("event"), Value::str(name)),
        (Value::str("args"), Value::list(host.args.clone())),
        (Value::str("kwargs"), kwargs),
        (
            Value::str("receiver"),
            host.receiver.clone().unwrap_or(Value::None),
        ),
        (
            Value::str("result"),
            host.result.clone().unwrap_or(Value::None),
        ),
        (Value::str("file"), Value::str(loc.file())),
        (Value::str("line"), Value::Int(loc.line() as i64)),
    ])
}

// === the native Spec base class ===

/// Builds the `Spec` base class spec files subclass. Its methods
/// accumulate declarations into the instance's [`SpecState`].
pub fn spec_base_class() -> Value {
    let attrs: RefCell<HashMap<String, Value>> = RefCell::new(HashMap::new());
    {
        let mut attrs = attrs.borrow_mut();
        attrs.insert(
            "params".to_string(),
            Value::native(NativeFn::new("Spec", "params", |interp, call| {
                let state = ensure_state(call)?;
                let names = string_list(interp, call, 0, "params")?;
                state.borrow_mut().params = names;
                Ok(Value::None)
            })),
        );
        attrs.insert(
            "event".to_string(),
            Value::native(NativeFn::new("Spec", "event", |interp, call| {
                let state = ensure_state(call)?;
                let name = string_arg(call, 0, "event name")?;
                let target = string_arg(call, 1, "event target")?;
                let mut pending = PendingEvent {
                    name,
                    target,
                    ..PendingEvent::default()
                };
                if let Some(opts) = call.args.get(2) {
                    read_event_opts(interp, call, opts, &mut pending)?;
                }
                state.borrow_mut().events.push(pending);
                Ok(Value::None)
            })),
        );
        attrs.insert(
            "ere".to_string(),
            Value::native(NativeFn::new("Spec", "ere", |_interp, call| {
                let state = ensure_state(call)?;
                let text = string_arg(call, 0, "ere")?;
                state
                    .borrow_mut()
                    .properties
                    .push((PropertyKind::Ere, text));
                Ok(Value::None)
            })),
        );
        attrs.insert(
            "fsm".to_string(),
            Value::native(NativeFn::new("Spec", "fsm", |_interp, call| {
                let state = ensure_state(call)?;
                let text = string_arg(call, 0, "fsm")?;
                state
                    .borrow_mut()
                    .properties
                    .push((PropertyKind::Fsm, text));
                Ok(Value::None)
            })),
        );
        attrs.insert(
            "creation_events".to_string(),
            Value::native(NativeFn::new("Spec", "creation_events", |interp, call| {
                let state = ensure_state(call)?;
                let names = string_list(interp, call, 0, "creation_events")?;
                state.borrow_mut().creation = names;
                Ok(Value::None)
            })),
        );
        attrs.insert(
            "end_events".to_string(),
            Value::native(NativeFn::new("Spec", "end_events", |interp, call| {
                let state = ensure_state(call)?;
                let names = string_list(interp, call, 0, "end_events")?;
                state.borrow_mut().end = names;
                Ok(Value::None)
            })),
        );
        attrs.insert(
            "violation".to_string(),
            Value::native(NativeFn::new("Spec", "violation", |_interp, call| {
                let state = ensure_state(call)?;
                // First argument is the event context; the message follows.
                let message = match call.args.get(1) {
                    Some(Value::Str(s)) => s.to_string(),
                    Some(other) => other.display(),
                    None => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "violation() takes the event and a message",
                        )
                        .at(call.loc.clone()));
                    }
                };
                state.borrow_mut().pending_message = Some(message);
                Ok(Value::None)
            })),
        );
    }
    Value::Obj(Obj::new(Payload::Class(
        vigil_instrument::value::ClassData {
            name: Rc::from("Spec"),
            base: None,
            attrs,
            doc: Some("Base class for Vigil specifications.".to_string()),
            native: None,
        },
    )))
}

fn read_event_opts(
    interp: &Interp,
    call: &NativeCall<'_>,
    opts: &Value,
    pending: &mut PendingEvent,
) -> Result<(), VmError> {
    let entries = dict_entries(opts).ok_or_else(|| {
        VmError::new(VmErrorKind::Type, "event options must be a dict").at(call.loc.clone())
    })?;
    for (key, value) in entries {
        let Value::Str(key) = key else {
            return Err(VmError::new(VmErrorKind::Type, "event option keys must be strings")
                .at(call.loc.clone()));
        };
        match &*key {
            "hook" => {
                pending.hook = match value {
                    Value::Str(s) => s.to_string(),
                    other => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            format!("hook must be a string, not {}", other.type_name()),
                        )
                        .at(call.loc.clone()));
                    }
                };
            }
            "pred" => pending.pred = Some(value),
            "binds" => {
                let binds = dict_entries(&value).ok_or_else(|| {
                    VmError::new(VmErrorKind::Type, "binds must be a dict").at(call.loc.clone())
                })?;
                for (param, source) in binds {
                    let (Value::Str(param), Value::Str(source)) = (param, source) else {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "binds entries must map parameter names to sources",
                        )
                        .at(call.loc.clone()));
                    };
                    pending.binds.push((param.to_string(), source.to_string()));
                }
            }
            "targets" => {
                let items = interp.collect_items(&value, call.loc)?;
                for item in items {
                    let Value::Int(pos) = item else {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "targets must be argument positions",
                        )
                        .at(call.loc.clone()));
                    };
                    pending.positions.push(pos.max(0) as usize);
                }
            }
            "names" => {
                let items = interp.collect_items(&value, call.loc)?;
                for item in items {
                    let Value::Str(caller) = item else {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "names must be `class.method` strings",
                        )
                        .at(call.loc.clone()));
                    };
                    pending.callers.push(caller.to_string());
                }
            }
            other => {
                return Err(VmError::new(
                    VmErrorKind::Value,
                    format!("unknown event option `{}`", other),
                )
                .at(call.loc.clone()));
            }
        }
    }
    Ok(())
}

// === host value helpers ===

fn ensure_state(call: &NativeCall<'_>) -> Result<Rc<RefCell<SpecState>>, VmError> {
    let Some(instance) = &call.recv else {
        return Err(VmError::new(VmErrorKind::Type, "spec method called without a receiver")
            .at(call.loc.clone()));
    };
    if let Some(existing) = instance_state(instance) {
        return Ok(existing);
    }
    let state: Rc<RefCell<SpecState>> = Rc::new(RefCell::new(SpecState::default()));
    let Some(obj) = instance.obj() else {
        return Err(VmError::new(VmErrorKind::Type, "spec receiver is not an instance")
            .at(call.loc.clone()));
    };
    let payload = obj.payload.borrow();
    let Payload::Instance(inst) = &*payload else {
        return Err(VmError::new(VmErrorKind::Type, "spec receiver is not an instance")
            .at(call.loc.clone()));
    };
    inst.attrs.borrow_mut().insert(
        STATE_ATTR.to_string(),
        Value::Obj(Obj::new(Payload::Opaque(OpaqueData {
            type_name: Rc::from("SpecState"),
            data: state.clone() as Rc<dyn Any>,
        }))),
    );
    Ok(state)
}

/// Reads the declaration state off a spec instance.
pub fn instance_state(instance: &Value) -> Option<Rc<RefCell<SpecState>>> {
    let obj = instance.obj()?;
    let payload = obj.payload.borrow();
    let Payload::Instance(inst) = &*payload else {
        return None;
    };
    let stored = inst.attrs.borrow().get(STATE_ATTR)?.clone();
    let stored_obj = stored.obj()?;
    let stored_payload = stored_obj.payload.borrow();
    let Payload::Opaque(opaque) = &*stored_payload else {
        return None;
    };
    opaque.data.clone().downcast::<RefCell<SpecState>>().ok()
}

fn instance_class(instance: &Value) -> Option<Value> {
    let obj = instance.obj()?;
    let payload = obj.payload.borrow();
    match &*payload {
        Payload::Instance(inst) => Some(inst.class.clone()),
        _ => None,
    }
}

fn class_doc(class: &Value) -> Option<String> {
    let obj = class.obj()?;
    let payload = obj.payload.borrow();
    match &*payload {
        Payload::Class(c) => c.doc.clone(),
        _ => None,
    }
}

fn module_global(module: &Value, name: &str) -> Option<Value> {
    let obj = module.obj()?;
    let payload = obj.payload.borrow();
    match &*payload {
        Payload::Module(m) => m.globals.lookup(name),
        _ => None,
    }
}

fn dict_entries(value: &Value) -> Option<Vec<(Value, Value)>> {
    let obj = value.obj()?;
    let payload = obj.payload.borrow();
    match &*payload {
        Payload::Dict(pairs) => Some(pairs.clone()),
        _ => None,
    }
}

fn string_arg(call: &NativeCall<'_>, index: usize, what: &str) -> Result<String, VmError> {
    match call.args.get(index) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        _ => Err(VmError::new(
            VmErrorKind::Type,
            format!("{} must be a string", what),
        )
        .at(call.loc.clone())),
    }
}

fn string_list(
    interp: &Interp,
    call: &NativeCall<'_>,
    index: usize,
    what: &str,
) -> Result<Vec<String>, VmError> {
    let Some(value) = call.args.get(index) else {
        return Err(VmError::new(
            VmErrorKind::Type,
            format!("{}() needs a list of names", what),
        )
        .at(call.loc.clone()));
    };
    let items = interp.collect_items(value, call.loc)?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Str(s) => out.push(s.to_string()),
            other => {
                return Err(VmError::new(
                    VmErrorKind::Type,
                    format!("{}() entries must be strings, not {}", what, other.type_name()),
                )
                .at(call.loc.clone()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parsing() {
        assert_eq!(parse_source("receiver"), Some(ParamSource::Receiver));
        assert_eq!(parse_source("result"), Some(ParamSource::Result));
        assert_eq!(parse_source("arg2"), Some(ParamSource::Arg(2)));
        assert_eq!(
            parse_source("kwarg:timeout"),
            Some(ParamSource::Kwarg("timeout".into()))
        );
        assert_eq!(parse_source("argx"), None);
        assert_eq!(parse_source("self"), None);
    }

    #[test]
    fn hook_parsing_defaults_to_after() {
        assert_eq!(parse_hook(""), Some(Hook::AfterCall));
        assert_eq!(parse_hook("before"), Some(Hook::BeforeCall));
        assert_eq!(parse_hook("loop_start"), Some(Hook::ForLoopStart));
        assert_eq!(parse_hook("sideways"), None);
    }
}
