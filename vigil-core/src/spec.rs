//! Specifications: a property automaton plus the events that feed it.

use std::fmt;

use thiserror::Error;

use crate::automaton::{Automaton, AutomatonError};
use crate::binding::Binding;
use crate::event::EventDescriptor;
use crate::location::SourceLocation;

/// Context handed to a specification's match action.
#[derive(Debug)]
pub struct MatchInfo<'a> {
    pub spec: &'a str,
    pub event: &'a str,
    pub binding: &'a Binding,
    pub location: &'a SourceLocation,
}

/// A user-supplied reporter invoked when a monitor instance matches. It
/// may return a custom violation message.
pub type MatchAction = Box<dyn Fn(&MatchInfo<'_>) -> Option<String>>;

/// A compiled specification, ready to be registered with the dispatcher.
pub struct Specification {
    pub name: String,
    pub description: Option<String>,
    /// Declaration order matters: subscriptions are evaluated in it.
    pub events: Vec<EventDescriptor>,
    pub creation_events: Vec<String>,
    /// Events fired once per live monitor by the end-of-execution sweep.
    pub end_events: Vec<String>,
    pub automaton: Automaton,
    /// Default violation message when the match action supplies none.
    pub message: Option<String>,
    pub on_match: Option<MatchAction>,
}

impl Specification {
    pub fn builder(name: impl Into<String>) -> SpecificationBuilder {
        SpecificationBuilder::new(name)
    }

    pub fn is_creation_event(&self, event: &str) -> bool {
        self.creation_events.iter().any(|e| e == event)
    }

    pub fn default_message(&self) -> &str {
        self.message.as_deref().unwrap_or("property violated")
    }
}

impl fmt::Debug for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification")
            .field("name", &self.name)
            .field("events", &self.events.len())
            .field("creation_events", &self.creation_events)
            .field("end_events", &self.end_events)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("specification `{0}` declares no events")]
    NoEvents(String),
    #[error("specification `{0}` declares event `{1}` twice")]
    DuplicateEvent(String, String),
    #[error("specification `{0}` must declare exactly one of `ere` or `fsm`")]
    PropertyCount(String),
    #[error("specification `{0}`: {1}")]
    Automaton(String, #[source] AutomatonError),
    #[error("specification `{0}` lists undeclared creation event `{1}`")]
    UnknownCreationEvent(String, String),
    #[error("specification `{0}` lists undeclared end event `{1}`")]
    UnknownEndEvent(String, String),
}

enum Property {
    Ere(String),
    Fsm(String),
}

/// Assembles a [`Specification`], validating the cross-references between
/// the property, the declared events, and the creation list.
pub struct SpecificationBuilder {
    name: String,
    description: Option<String>,
    events: Vec<EventDescriptor>,
    creation_events: Vec<String>,
    end_events: Vec<String>,
    properties: Vec<Property>,
    message: Option<String>,
    on_match: Option<MatchAction>,
}

impl SpecificationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            events: Vec::new(),
            creation_events: Vec::new(),
            end_events: Vec::new(),
            properties: Vec::new(),
            message: None,
            on_match: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn event(mut self, descriptor: EventDescriptor) -> Self {
        self.events.push(descriptor);
        self
    }

    pub fn creation_events(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.creation_events.extend(names);
        self
    }

    pub fn end_events(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.end_events.extend(names);
        self
    }

    pub fn ere(mut self, expr: impl Into<String>) -> Self {
        self.properties.push(Property::Ere(expr.into()));
        self
    }

    pub fn fsm(mut self, table: impl Into<String>) -> Self {
        self.properties.push(Property::Fsm(table.into()));
        self
    }

    pub fn message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }

    pub fn on_match(mut self, action: MatchAction) -> Self {
        self.on_match = Some(action);
        self
    }

    pub fn build(mut self) -> Result<Specification, SpecError> {
        if self.events.is_empty() {
            return Err(SpecError::NoEvents(self.name));
        }
        for (i, ev) in self.events.iter().enumerate() {
            if self.events[..i].iter().any(|e| e.name == ev.name) {
                return Err(SpecError::DuplicateEvent(self.name, ev.name.clone()));
            }
        }
        if self.properties.len() != 1 {
            return Err(SpecError::PropertyCount(self.name));
        }
        let automaton = match self.properties.pop().expect("checked length") {
            Property::Ere(expr) => Automaton::from_ere(&expr),
            Property::Fsm(table) => Automaton::from_fsm(&table),
        }
        .map_err(|e| SpecError::Automaton(self.name.clone(), e))?;

        let declared: Vec<String> = self.events.iter().map(|e| e.name.clone()).collect();
        automaton
            .check_symbols_declared(&declared)
            .map_err(|e| SpecError::Automaton(self.name.clone(), e))?;
        for c in &self.creation_events {
            if !declared.contains(c) {
                return Err(SpecError::UnknownCreationEvent(self.name, c.clone()));
            }
        }
        for e in &self.end_events {
            if !declared.contains(e) {
                return Err(SpecError::UnknownEndEvent(self.name, e.clone()));
            }
        }

        Ok(Specification {
            name: self.name,
            description: self.description,
            events: self.events,
            creation_events: self.creation_events,
            end_events: self.end_events,
            automaton,
            message: self.message,
            on_match: self.on_match,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Hook, TargetSelector};
    use regex::Regex;

    fn descriptor(name: &str) -> EventDescriptor {
        EventDescriptor {
            name: name.into(),
            hook: Hook::AfterCall,
            target: TargetSelector {
                type_name: "io".into(),
                method: Regex::new("^open$").unwrap(),
            },
            binds: vec![],
            predicate: None,
            filter: None,
        }
    }

    #[test]
    fn builds_with_one_property() {
        let spec = Specification::builder("FileClosed")
            .event(descriptor("open"))
            .event(descriptor("close"))
            .ere("open close")
            .creation_events(["open".to_string()])
            .build()
            .unwrap();
        assert!(spec.is_creation_event("open"));
        assert!(!spec.is_creation_event("close"));
    }

    #[test]
    fn rejects_zero_or_two_properties() {
        let err = Specification::builder("S")
            .event(descriptor("open"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SpecError::PropertyCount(_)));

        let err = Specification::builder("S")
            .event(descriptor("open"))
            .ere("open")
            .fsm("s0 [\n]\nalias match = s0\n")
            .build()
            .unwrap_err();
        assert!(matches!(err, SpecError::PropertyCount(_)));
    }

    #[test]
    fn rejects_undeclared_automaton_symbol() {
        let err = Specification::builder("S")
            .event(descriptor("open"))
            .ere("open close")
            .build()
            .unwrap_err();
        assert!(matches!(err, SpecError::Automaton(..)));
    }

    #[test]
    fn rejects_unknown_creation_event() {
        let err = Specification::builder("S")
            .event(descriptor("open"))
            .ere("open")
            .creation_events(["mystery".to_string()])
            .build()
            .unwrap_err();
        assert!(matches!(err, SpecError::UnknownCreationEvent(..)));
    }
}
