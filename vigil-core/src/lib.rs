//! Core monitor engine for Vigil.
//!
//! This crate is the host-agnostic half of the Vigil monitoring system. It
//! knows nothing about the scripting language being observed; it deals in
//! *events*, named occurrences carrying operand views of host values and a
//! source location, and in *specifications*: finite properties over event
//! sequences, expressed as a regular expression or an explicit state
//! machine, together with the predicates that decide which raw callbacks
//! become events.
//!
//! The flow through the crate mirrors the flow through a running program:
//!
//! 1. An instrumented operation fires a hook on the [`Dispatcher`].
//! 2. The dispatcher looks up the subscribers registered for the callable's
//!    `(type, hook)` pair, matches the method name against each
//!    subscriber's pattern, and evaluates its predicate.
//! 3. A true event is turned into a [`binding`](binding::Binding) over the
//!    specification's parameters and handed to the spec's
//!    [slicer](slice::Slicer), which locates (or creates) the monitor
//!    instances the event is relevant to and advances their automata.
//! 4. Instances entering a match state produce
//!    [violations](violation::ViolationStore).
//!
//! The companion crates supply the rest of the system: `vigil-instrument`
//! owns the host language and the AST instrumentation that generates the
//! hook traffic, and `vigil` wires user specification files onto this
//! engine.

pub mod automaton;
pub mod binding;
pub mod dispatch;
pub mod event;
pub mod location;
pub mod operand;
pub mod slice;
pub mod spec;
pub mod violation;

pub use automaton::{Automaton, AutomatonError};
pub use binding::Binding;
pub use dispatch::{Dispatcher, MonitoredSpec};
pub use event::{
    CallableDesc, CallsiteFilter, EventDescriptor, EventPayload, Hook, ParamSource, Predicate,
    TargetSelector,
};
pub use location::SourceLocation;
pub use operand::{ObjRef, Operand};
pub use slice::Algorithm;
pub use spec::{MatchInfo, SpecError, Specification, SpecificationBuilder};
pub use violation::{ViolationRecord, ViolationStore};
