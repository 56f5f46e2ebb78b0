//! The event model: hooks, payloads, and event descriptors.

use std::any::Any;
use std::fmt;

use regex::Regex;
use smallvec::SmallVec;

use crate::location::SourceLocation;
use crate::operand::Operand;

/// The instrumentation join points a specification can subscribe to.
///
/// Each variant corresponds to one tracker callback fired by rewritten code
/// (or, under the builtin strategy, by native dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// A call is about to happen; arguments are evaluated.
    BeforeCall,
    /// A call returned; the payload carries the result.
    AfterCall,
    /// A `for` loop is about to start iterating.
    ForLoopStart,
    /// A `for` loop finished (normally or not).
    ForLoopEnd,
    /// A single comparison operator was evaluated.
    Compare,
    /// An arithmetic or bitwise operator was evaluated.
    Arith,
    /// A tracked string operation was evaluated.
    StrOp,
    /// An instrumented iterator was constructed.
    IterNew,
    /// An instrumented iterator was advanced.
    IterNext,
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Hook::BeforeCall => "before_call",
            Hook::AfterCall => "after_call",
            Hook::ForLoopStart => "for_loop_start",
            Hook::ForLoopEnd => "for_loop_end",
            Hook::Compare => "compare",
            Hook::Arith => "arith",
            Hook::StrOp => "str_op",
            Hook::IterNew => "iter_new",
            Hook::IterNext => "iter_next",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies the callable an event fired against: the owning type (or
/// module) name plus the method (or function) name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallableDesc<'a> {
    pub type_name: &'a str,
    pub method: &'a str,
}

impl<'a> CallableDesc<'a> {
    pub fn new(type_name: &'a str, method: &'a str) -> Self {
        Self { type_name, method }
    }
}

impl fmt::Display for CallableDesc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.method)
    }
}

/// One hook firing, as delivered to the dispatcher.
///
/// Operand views carry identity and value information into the engine; the
/// `host` field is an opaque handle onto the original host values so that
/// user predicates can inspect arguments with full fidelity. The engine
/// itself never downcasts it.
pub struct EventPayload<'a> {
    pub hook: Hook,
    pub callable: CallableDesc<'a>,
    pub receiver: Option<&'a Operand>,
    pub args: &'a [Operand],
    pub kwargs: &'a [(String, Operand)],
    pub result: Option<&'a Operand>,
    pub location: SourceLocation,
    /// Host-side event context, downcast by the predicate adapter.
    pub host: Option<&'a dyn Any>,
}

impl EventPayload<'_> {
    /// Resolves a parameter source against this payload. Returns `None`
    /// when the source does not apply (e.g. `Result` on a before-call
    /// hook), leaving the corresponding binding position unbound.
    pub fn operand(&self, source: &ParamSource) -> Option<Operand> {
        match source {
            ParamSource::Receiver => self.receiver.cloned(),
            ParamSource::Arg(i) => self.args.get(*i).cloned(),
            ParamSource::Kwarg(name) => self
                .kwargs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone()),
            ParamSource::Result => self.result.cloned(),
        }
    }
}

impl fmt::Debug for EventPayload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPayload")
            .field("hook", &self.hook)
            .field("callable", &self.callable)
            .field("args", &self.args)
            .field("location", &self.location)
            .finish()
    }
}

/// Where a specification parameter is taken from in an event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSource {
    Receiver,
    Arg(usize),
    Kwarg(String),
    Result,
}

/// Selects the callables an event descriptor subscribes to: an exact type
/// (or module) name and a regular expression over method names.
#[derive(Debug, Clone)]
pub struct TargetSelector {
    pub type_name: String,
    pub method: Regex,
}

impl TargetSelector {
    pub fn matches(&self, callable: &CallableDesc<'_>) -> bool {
        self.type_name == callable.type_name && self.method.is_match(callable.method)
    }
}

/// Restricts an event to particular call sites: each listed argument
/// position must hold an instance of one of the allowed classes, and when
/// the allowed entry names a method, the firing callable must match it.
#[derive(Debug, Clone, Default)]
pub struct CallsiteFilter {
    pub positions: SmallVec<[usize; 2]>,
    /// Allowed `(class, method)` descriptors; an empty method means any.
    pub names: Vec<(String, String)>,
}

impl CallsiteFilter {
    pub fn accepts(&self, payload: &EventPayload<'_>) -> bool {
        if self.positions.is_empty() {
            return true;
        }
        self.positions.iter().all(|&pos| {
            let Some(arg) = payload.args.get(pos) else {
                return false;
            };
            self.names.iter().any(|(class, method)| {
                arg.type_name() == class
                    && (method.is_empty() || method == payload.callable.method)
            })
        })
    }
}

/// The predicate deciding whether a hook firing becomes this event.
pub type Predicate = Box<dyn Fn(&EventPayload<'_>) -> bool>;

/// A named event a specification observes.
///
/// Descriptors are kept in declaration order; the dispatcher evaluates
/// subscriptions in that order.
pub struct EventDescriptor {
    pub name: String,
    pub hook: Hook,
    pub target: TargetSelector,
    /// Parameter bindings: `(parameter position, operand source)`.
    pub binds: Vec<(usize, ParamSource)>,
    pub predicate: Option<Predicate>,
    pub filter: Option<CallsiteFilter>,
}

impl EventDescriptor {
    /// Whether this descriptor is interested in the given payload, before
    /// predicate evaluation.
    pub fn selects(&self, payload: &EventPayload<'_>) -> bool {
        if self.hook != payload.hook {
            return false;
        }
        if !self.target.matches(&payload.callable) {
            return false;
        }
        match &self.filter {
            Some(filter) => filter.accepts(payload),
            None => true,
        }
    }
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("name", &self.name)
            .field("hook", &self.hook)
            .field("target", &self.target)
            .field("binds", &self.binds)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload<'a>(
        hook: Hook,
        callable: CallableDesc<'a>,
        args: &'a [Operand],
    ) -> EventPayload<'a> {
        EventPayload {
            hook,
            callable,
            receiver: None,
            args,
            kwargs: &[],
            result: None,
            location: SourceLocation::new("t.vg", 1, 0),
            host: None,
        }
    }

    #[test]
    fn target_selector_matches_method_pattern() {
        let sel = TargetSelector {
            type_name: "list".into(),
            method: Regex::new("^(append|extend|insert)$").unwrap(),
        };
        assert!(sel.matches(&CallableDesc::new("list", "append")));
        assert!(!sel.matches(&CallableDesc::new("list", "index")));
        assert!(!sel.matches(&CallableDesc::new("dict", "append")));
    }

    #[test]
    fn callsite_filter_checks_argument_class() {
        let filter = CallsiteFilter {
            positions: SmallVec::from_slice(&[0]),
            names: vec![("File".into(), String::new())],
        };
        let file_arg = [Operand::Str("not a file".into())];
        let p = payload(Hook::AfterCall, CallableDesc::new("io", "open"), &file_arg);
        assert!(!filter.accepts(&p));
    }

    #[test]
    fn descriptor_requires_matching_hook() {
        let desc = EventDescriptor {
            name: "open".into(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "io".into(),
                method: Regex::new("^open$").unwrap(),
            },
            binds: vec![],
            predicate: None,
            filter: None,
        };
        let p = payload(Hook::BeforeCall, CallableDesc::new("io", "open"), &[]);
        assert!(!desc.selects(&p));
        let p = payload(Hook::AfterCall, CallableDesc::new("io", "open"), &[]);
        assert!(desc.selects(&p));
    }
}
