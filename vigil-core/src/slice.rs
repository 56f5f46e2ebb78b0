//! Parametric trace slicing.
//!
//! A single program trace is decomposed into per-binding sub-traces: an
//! event carrying binding `β` belongs to the slice of every binding at
//! least as informative as `β`. Each slice is monitored by its own
//! [`MonitorInstance`]. The algorithms below differ in how slices come
//! into existence:
//!
//! - **A**: no slicing; one global monitor sees every event.
//! - **B**: one independent instance per observed binding; instances are
//!   created only by declared creation events and never exchange state.
//! - **C**: bindings form a lattice. When an event's binding joins with an
//!   existing instance's binding, the joined instance is created by cloning
//!   the most informative compatible ancestor, so it inherits the prefix of
//!   its sub-slices.
//! - **C+**: C with a memo of join points that previously produced
//!   nothing, so the search is not repeated (output-identical to C).
//! - **D**: C with joins restricted to declared creation events.
//!
//! Fresh (initial-state) instances always require a declared creation
//! event, under every algorithm except A.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;
use thiserror::Error;

use crate::automaton::{Automaton, StateId, Step};
use crate::binding::Binding;
use crate::location::SourceLocation;

/// Selects the parametric indexing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    A,
    B,
    C,
    CPlus,
    D,
}

#[derive(Debug, Error)]
#[error("unknown algorithm `{0}` (expected one of A, B, C, C+, D)")]
pub struct ParseAlgorithmError(String);

impl FromStr for Algorithm {
    type Err = ParseAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Algorithm::A),
            "B" => Ok(Algorithm::B),
            "C" => Ok(Algorithm::C),
            "C+" => Ok(Algorithm::CPlus),
            "D" => Ok(Algorithm::D),
            other => Err(ParseAlgorithmError(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Algorithm::A => "A",
            Algorithm::B => "B",
            Algorithm::C => "C",
            Algorithm::CPlus => "C+",
            Algorithm::D => "D",
        };
        f.write_str(s)
    }
}

/// One monitored slice: an automaton state for a particular binding.
#[derive(Debug, Clone)]
pub struct MonitorInstance {
    /// `None` once the automaton has died for this slice.
    state: Option<StateId>,
    binding: Binding,
    /// Where the creation event that opened this slice fired.
    created_at: Option<SourceLocation>,
}

impl MonitorInstance {
    fn new(binding: Binding, created_at: Option<SourceLocation>) -> Self {
        Self {
            state: Some(Automaton::INITIAL),
            binding,
            created_at,
        }
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn is_dead(&self) -> bool {
        self.state.is_none()
    }

    /// Advances by one event; returns true when the new state is a match
    /// state.
    fn advance(&mut self, automaton: &Automaton, event: &str) -> bool {
        let Some(state) = self.state else {
            return false;
        };
        match automaton.step(state, event) {
            Step::To(next) => {
                self.state = Some(next);
                automaton.is_match(next)
            }
            Step::Dead => {
                self.state = None;
                false
            }
        }
    }
}

/// One event as seen by a slicer, after predicate evaluation and binding
/// computation.
#[derive(Debug)]
pub struct EventStep<'a> {
    pub event: &'a str,
    pub is_creation: bool,
    pub binding: Binding,
    /// `None` for synthetic events (the end-of-execution sweep).
    pub location: Option<&'a SourceLocation>,
}

/// A monitor instance that entered a match state.
#[derive(Debug, Clone)]
pub struct MatchHit {
    pub binding: Binding,
    /// The creation location of the matching instance, when known.
    pub opener: Option<SourceLocation>,
}

/// What one event did to a spec's index.
#[derive(Debug, Default)]
pub struct Outcome {
    pub hits: SmallVec<[MatchHit; 1]>,
    pub created: usize,
}

/// The engine interface shared by all algorithms, so selection is a
/// dispatch-time choice.
pub trait Slicer {
    fn handle(&mut self, automaton: &Automaton, step: &EventStep<'_>) -> Outcome;

    /// Drops instances whose bindings refer to collected host objects.
    fn sweep_dead_bindings(&mut self);

    fn live_instances(&self) -> usize;
}

/// Builds the slicer for `algorithm`. `gc` enables reclamation of
/// instances whose binding objects the host has collected.
pub fn new_slicer(algorithm: Algorithm, gc: bool) -> Box<dyn Slicer> {
    match algorithm {
        Algorithm::A => Box::new(GlobalSlicer::new()),
        Algorithm::B => Box::new(IndexedSlicer::new(JoinPolicy::Never, false, gc)),
        Algorithm::C => Box::new(IndexedSlicer::new(JoinPolicy::AnyEvent, false, gc)),
        Algorithm::CPlus => Box::new(IndexedSlicer::new(JoinPolicy::AnyEvent, true, gc)),
        Algorithm::D => Box::new(IndexedSlicer::new(JoinPolicy::CreationOnly, false, gc)),
    }
}

/// Algorithm A: a single monitor over the unsliced trace.
struct GlobalSlicer {
    instance: MonitorInstance,
}

impl GlobalSlicer {
    fn new() -> Self {
        Self {
            instance: MonitorInstance::new(Binding::new(), None),
        }
    }
}

impl Slicer for GlobalSlicer {
    fn handle(&mut self, automaton: &Automaton, step: &EventStep<'_>) -> Outcome {
        let mut outcome = Outcome::default();
        if self.instance.created_at.is_none() {
            if let Some(loc) = step.location {
                // The first observed event stands in as the opener for
                // reporting purposes.
                self.instance.created_at = Some(loc.clone());
            }
        }
        if self.instance.advance(automaton, step.event) {
            outcome.hits.push(MatchHit {
                binding: Binding::new(),
                opener: self.instance.created_at.clone(),
            });
        }
        outcome
    }

    fn sweep_dead_bindings(&mut self) {}

    fn live_instances(&self) -> usize {
        usize::from(!self.instance.is_dead())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPolicy {
    /// B: instances are independent; no state is ever inherited.
    Never,
    /// C / C+: joined instances may be created by any event.
    AnyEvent,
    /// D: joined instances require a declared creation event.
    CreationOnly,
}

/// Algorithms B, C, C+ and D share one indexed engine; the join policy and
/// the disabled-join memo are the only differences.
struct IndexedSlicer {
    instances: HashMap<Binding, MonitorInstance>,
    join: JoinPolicy,
    /// C+ only: joins already searched and found impossible.
    disabled: Option<HashSet<Binding>>,
    gc: bool,
}

impl IndexedSlicer {
    fn new(join: JoinPolicy, memoize_disabled: bool, gc: bool) -> Self {
        Self {
            instances: HashMap::new(),
            join,
            disabled: memoize_disabled.then(HashSet::new),
            gc,
        }
    }

    /// All bindings an event could materialize: the event's own binding
    /// plus its join with every compatible existing binding.
    fn join_candidates(&self, binding: &Binding) -> Vec<Binding> {
        let mut out = vec![binding.clone()];
        for existing in self.instances.keys() {
            if existing.is_compatible_with(binding) {
                let joined = existing.join(binding);
                if !out.contains(&joined) {
                    out.push(joined);
                }
            }
        }
        out
    }

    /// The most informative existing instance strictly below `target`.
    fn best_ancestor(&self, target: &Binding) -> Option<&MonitorInstance> {
        self.instances
            .values()
            .filter(|inst| inst.binding != *target && inst.binding.is_sub_binding_of(target))
            .max_by_key(|inst| inst.binding.len())
    }

    fn create_phase(&mut self, step: &EventStep<'_>, outcome: &mut Outcome) {
        if self.instances.contains_key(&step.binding) {
            return;
        }
        let joins_allowed = match self.join {
            JoinPolicy::Never => false,
            JoinPolicy::AnyEvent => true,
            JoinPolicy::CreationOnly => step.is_creation,
        };
        for candidate in self.join_candidates(&step.binding) {
            if self.instances.contains_key(&candidate) {
                continue;
            }
            if let Some(disabled) = &self.disabled {
                if !step.is_creation && disabled.contains(&candidate) {
                    continue;
                }
            }
            let inherited = if joins_allowed {
                self.best_ancestor(&candidate).cloned()
            } else {
                None
            };
            let instance = match inherited {
                Some(ancestor) => MonitorInstance {
                    state: ancestor.state,
                    binding: candidate.clone(),
                    created_at: ancestor.created_at,
                },
                None if step.is_creation && candidate == step.binding => {
                    MonitorInstance::new(candidate.clone(), step.location.cloned())
                }
                None => {
                    if let Some(disabled) = &mut self.disabled {
                        disabled.insert(candidate);
                    }
                    continue;
                }
            };
            self.instances.insert(candidate, instance);
            outcome.created += 1;
        }
    }
}

impl Slicer for IndexedSlicer {
    fn handle(&mut self, automaton: &Automaton, step: &EventStep<'_>) -> Outcome {
        let mut outcome = Outcome::default();
        self.create_phase(step, &mut outcome);

        for inst in self.instances.values_mut() {
            if !step.binding.is_sub_binding_of(&inst.binding) {
                continue;
            }
            if inst.advance(automaton, step.event) {
                outcome.hits.push(MatchHit {
                    binding: inst.binding.clone(),
                    opener: inst.created_at.clone(),
                });
            }
        }

        if self.gc {
            self.sweep_dead_bindings();
        }
        outcome
    }

    fn sweep_dead_bindings(&mut self) {
        self.instances.retain(|binding, _| binding.is_alive());
    }

    fn live_instances(&self) -> usize {
        self.instances.values().filter(|i| !i.is_dead()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{ObjRef, Operand};
    use std::rc::Rc;

    fn refop(rc: &Rc<u32>, ty: &str) -> Operand {
        Operand::Ref(ObjRef::capture(rc, ty))
    }

    fn loc(line: u32) -> SourceLocation {
        SourceLocation::new("t.vg", line, 0)
    }

    fn fire(
        slicer: &mut dyn Slicer,
        automaton: &Automaton,
        event: &str,
        is_creation: bool,
        binding: Binding,
        line: u32,
    ) -> Outcome {
        let location = loc(line);
        slicer.handle(
            automaton,
            &EventStep {
                event,
                is_creation,
                binding,
                location: Some(&location),
            },
        )
    }

    fn iterator_automaton() -> Automaton {
        Automaton::from_ere("createList updateList* createIter next* updateList+ next").unwrap()
    }

    #[test]
    fn algorithm_a_ignores_bindings() {
        let automaton = Automaton::from_ere("open end").unwrap();
        let mut slicer = new_slicer(Algorithm::A, true);
        let a = Rc::new(1);
        let b = Rc::new(2);
        fire(&mut *slicer, &automaton, "open", true, Binding::from_pairs([(0, refop(&a, "File"))]), 1);
        // A conflates the two files into one trace.
        let out = fire(&mut *slicer, &automaton, "end", false, Binding::from_pairs([(0, refop(&b, "File"))]), 2);
        assert_eq!(out.hits.len(), 1);
    }

    #[test]
    fn algorithm_c_inherits_prefix_through_join() {
        let automaton = iterator_automaton();
        let mut slicer = new_slicer(Algorithm::C, false);
        let l = Rc::new(1);
        let it = Rc::new(2);

        let bl = Binding::from_pairs([(0, refop(&l, "list"))]);
        let bli = Binding::from_pairs([(0, refop(&l, "list")), (1, refop(&it, "iterator"))]);
        let bi = Binding::from_pairs([(1, refop(&it, "iterator"))]);

        let out = fire(&mut *slicer, &automaton, "createList", true, bl.clone(), 1);
        assert_eq!(out.created, 1);
        let out = fire(&mut *slicer, &automaton, "createIter", false, bli, 2);
        // Joined instance inherits the createList prefix from the
        // list-only slice.
        assert_eq!(out.created, 1);
        fire(&mut *slicer, &automaton, "next", false, bi.clone(), 3);
        fire(&mut *slicer, &automaton, "updateList", false, bl, 4);
        let out = fire(&mut *slicer, &automaton, "next", false, bi, 5);
        assert_eq!(out.hits.len(), 1);
        let hit = &out.hits[0];
        assert_eq!(hit.binding.len(), 2);
        assert_eq!(hit.opener.as_ref().unwrap().line(), 1);
    }

    #[test]
    fn algorithm_b_keeps_instances_independent() {
        // Property phrased against the full binding so that no state
        // inheritance is needed.
        let automaton = Automaton::from_ere("createIter next* update+ next").unwrap();
        let mut slicer = new_slicer(Algorithm::B, false);
        let d1 = Rc::new(1);
        let d2 = Rc::new(2);
        let i1 = Rc::new(3);
        let i2 = Rc::new(4);

        let b1 = Binding::from_pairs([(0, refop(&d1, "dict")), (1, refop(&i1, "iterator"))]);
        let b2 = Binding::from_pairs([(0, refop(&d2, "dict")), (1, refop(&i2, "iterator"))]);

        fire(&mut *slicer, &automaton, "createIter", true, b1, 1);
        fire(&mut *slicer, &automaton, "createIter", true, b2, 2);
        // Mutate only d1.
        fire(
            &mut *slicer,
            &automaton,
            "update",
            false,
            Binding::from_pairs([(0, refop(&d1, "dict"))]),
            3,
        );
        // Advancing i2 is fine...
        let out = fire(
            &mut *slicer,
            &automaton,
            "next",
            false,
            Binding::from_pairs([(1, refop(&i2, "iterator"))]),
            4,
        );
        assert!(out.hits.is_empty());
        // ...but i1 sees the mutation.
        let out = fire(
            &mut *slicer,
            &automaton,
            "next",
            false,
            Binding::from_pairs([(1, refop(&i1, "iterator"))]),
            5,
        );
        assert_eq!(out.hits.len(), 1);
        assert!(out.hits[0].binding.get(0).is_some());
        assert!(out.hits[0].binding.get(1).is_some());
    }

    #[test]
    fn creation_requires_declared_creation_event() {
        let automaton = Automaton::from_ere("open close").unwrap();
        for algorithm in [Algorithm::B, Algorithm::C, Algorithm::CPlus, Algorithm::D] {
            let mut slicer = new_slicer(algorithm, false);
            let f = Rc::new(1);
            let out = fire(
                &mut *slicer,
                &automaton,
                "close",
                false,
                Binding::from_pairs([(0, refop(&f, "File"))]),
                1,
            );
            assert_eq!(out.created, 0, "algorithm {:?}", algorithm);
            assert_eq!(slicer.live_instances(), 0);
        }
    }

    #[test]
    fn c_plus_matches_c_output() {
        let automaton = iterator_automaton();
        let mut c = new_slicer(Algorithm::C, false);
        let mut cplus = new_slicer(Algorithm::CPlus, false);
        let l = Rc::new(1);
        let it = Rc::new(2);

        let bl = Binding::from_pairs([(0, refop(&l, "list"))]);
        let bli = Binding::from_pairs([(0, refop(&l, "list")), (1, refop(&it, "iterator"))]);
        let bi = Binding::from_pairs([(1, refop(&it, "iterator"))]);

        let script: &[(&str, bool, Binding)] = &[
            ("createList", true, bl.clone()),
            ("createIter", false, bli),
            ("next", false, bi.clone()),
            ("updateList", false, bl),
            ("next", false, bi),
        ];
        for (i, (event, creation, binding)) in script.iter().enumerate() {
            let a = fire(&mut *c, &automaton, event, *creation, binding.clone(), i as u32);
            let b = fire(
                &mut *cplus,
                &automaton,
                event,
                *creation,
                binding.clone(),
                i as u32,
            );
            assert_eq!(a.hits.len(), b.hits.len());
        }
    }

    #[test]
    fn gc_reclaims_dead_bindings() {
        let automaton = Automaton::from_ere("open close").unwrap();
        let mut slicer = new_slicer(Algorithm::B, true);
        {
            let f = Rc::new(1);
            fire(
                &mut *slicer,
                &automaton,
                "open",
                true,
                Binding::from_pairs([(0, refop(&f, "File"))]),
                1,
            );
            assert_eq!(slicer.live_instances(), 1);
            // `f` dropped here: the host has collected the file.
        }
        slicer.sweep_dead_bindings();
        assert_eq!(slicer.live_instances(), 0);
    }

    #[test]
    fn gc_disabled_retains_instances() {
        let automaton = Automaton::from_ere("open close").unwrap();
        let mut slicer = new_slicer(Algorithm::B, false);
        {
            let f = Rc::new(1);
            fire(
                &mut *slicer,
                &automaton,
                "open",
                true,
                Binding::from_pairs([(0, refop(&f, "File"))]),
                1,
            );
        }
        // Without gc the instance outlives its binding objects.
        assert_eq!(slicer.live_instances(), 1);
    }
}
