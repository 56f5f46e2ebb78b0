//! Parameter bindings for parametric trace slicing.

use std::fmt;
use std::hash::{Hash, Hasher};

use smallvec::SmallVec;

use crate::operand::Operand;

/// An ordered, sparse mapping from specification parameter positions to
/// observed operands.
///
/// Bindings are the keys of the parametric index: two bindings are equal
/// iff they bind the same positions to equal operands (references by
/// identity, values by value). A binding observed on an event is usually
/// *partial*; an `updateList` event binds only the list parameter, not
/// the iterator. The slicing algorithms reason about the informativeness
/// order `a ⊑ b`, which holds when `b` binds every position `a` does, to
/// the same operand.
#[derive(Clone, Default)]
pub struct Binding {
    // Sorted by position; positions are unique.
    entries: SmallVec<[(usize, Operand); 4]>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, Operand)>) -> Self {
        let mut b = Self::new();
        for (pos, op) in pairs {
            b.bind(pos, op);
        }
        b
    }

    /// Binds `pos`, replacing any previous entry.
    pub fn bind(&mut self, pos: usize, operand: Operand) {
        match self.entries.binary_search_by_key(&pos, |(p, _)| *p) {
            Ok(i) => self.entries[i].1 = operand,
            Err(i) => self.entries.insert(i, (pos, operand)),
        }
    }

    pub fn get(&self, pos: usize) -> Option<&Operand> {
        self.entries
            .binary_search_by_key(&pos, |(p, _)| *p)
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Operand)> {
        self.entries.iter().map(|(p, op)| (*p, op))
    }

    /// `self ⊑ other`: every position bound here is bound in `other` to an
    /// equal operand.
    pub fn is_sub_binding_of(&self, other: &Binding) -> bool {
        self.entries
            .iter()
            .all(|(pos, op)| other.get(*pos) == Some(op))
    }

    /// Two bindings are compatible when they agree on every position bound
    /// in both; their join is then well defined.
    pub fn is_compatible_with(&self, other: &Binding) -> bool {
        self.entries.iter().all(|(pos, op)| match other.get(*pos) {
            Some(o) => o == op,
            None => true,
        })
    }

    /// The least upper bound of two compatible bindings.
    pub fn join(&self, other: &Binding) -> Binding {
        debug_assert!(self.is_compatible_with(other));
        let mut out = self.clone();
        for (pos, op) in other.iter() {
            if out.get(pos).is_none() {
                out.bind(pos, op.clone());
            }
        }
        out
    }

    /// Whether every reference operand in the binding still points at a
    /// live host object.
    pub fn is_alive(&self) -> bool {
        self.entries.iter().all(|(_, op)| op.is_alive())
    }
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Binding {}

impl Hash for Binding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entries.len().hash(state);
        for (pos, op) in &self.entries {
            pos.hash(state);
            op.hash(state);
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (pos, op) in self.iter() {
            map.entry(&pos, &format_args!("{}", op));
        }
        map.finish()
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (pos, op)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "p{}={}", pos, op)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::ObjRef;
    use std::rc::Rc;

    fn refop(rc: &Rc<u32>) -> Operand {
        Operand::Ref(ObjRef::capture(rc, "box"))
    }

    #[test]
    fn binding_equality_is_positionwise() {
        let a = Rc::new(1);
        let b1 = Binding::from_pairs([(0, refop(&a)), (1, Operand::Int(5))]);
        let b2 = Binding::from_pairs([(1, Operand::Int(5)), (0, refop(&a))]);
        assert_eq!(b1, b2);

        let other = Rc::new(1);
        let b3 = Binding::from_pairs([(0, refop(&other)), (1, Operand::Int(5))]);
        assert_ne!(b1, b3);
    }

    #[test]
    fn sub_binding_and_join() {
        let l = Rc::new(10);
        let it = Rc::new(20);
        let partial = Binding::from_pairs([(0, refop(&l))]);
        let full = Binding::from_pairs([(0, refop(&l)), (1, refop(&it))]);

        assert!(partial.is_sub_binding_of(&full));
        assert!(!full.is_sub_binding_of(&partial));
        assert!(partial.is_compatible_with(&full));

        let joined = partial.join(&Binding::from_pairs([(1, refop(&it))]));
        assert_eq!(joined, full);
    }

    #[test]
    fn incompatible_on_conflicting_position() {
        let a = Rc::new(1);
        let b = Rc::new(2);
        let ba = Binding::from_pairs([(0, refop(&a))]);
        let bb = Binding::from_pairs([(0, refop(&b))]);
        assert!(!ba.is_compatible_with(&bb));
    }

    #[test]
    fn liveness_tracks_host_drops() {
        let a = Rc::new(1);
        let binding = Binding::from_pairs([(0, refop(&a)), (1, Operand::Int(3))]);
        assert!(binding.is_alive());
        drop(a);
        assert!(!binding.is_alive());
    }
}
