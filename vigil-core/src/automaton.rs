//! Property automata.
//!
//! A specification's property is compiled to a deterministic automaton over
//! its event names, either from a regular expression (`ere`) or from a
//! textual state table (`fsm`). Monitors hold a state id and advance it one
//! event at a time; entering a *match* state is a violation.
//!
//! Transition semantics: an event with no transition out of the current
//! state sends the monitor to an implicit dead state, from which it can
//! never match again. An `fsm` state may declare `default <state>` to
//! redirect otherwise-undeclared events instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use thiserror::Error;

/// Index of an automaton state. The initial state is always `0`.
pub type StateId = u32;

#[derive(Debug, Error)]
pub enum AutomatonError {
    #[error("empty property expression")]
    EmptyExpression,
    #[error("unbalanced parenthesis in property expression")]
    UnbalancedParen,
    #[error("unexpected token `{0}` in property expression")]
    UnexpectedToken(String),
    #[error("state table has no states")]
    EmptyTable,
    #[error("malformed state table line: `{0}`")]
    MalformedLine(String),
    #[error("state table declares no match state (missing `alias match = ...`)")]
    NoMatchState,
    #[error("duplicate transition for `{event}` in state `{state}`")]
    DuplicateTransition { state: String, event: String },
    #[error("event `{0}` is not declared by the specification")]
    UndeclaredSymbol(String),
}

#[derive(Debug, Clone, Default)]
struct State {
    transitions: HashMap<u32, StateId>,
    default: Option<StateId>,
}

/// A compiled deterministic automaton.
#[derive(Debug, Clone)]
pub struct Automaton {
    symbols: Vec<String>,
    states: Vec<State>,
    matching: Vec<bool>,
}

/// The result of advancing a monitor by one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    To(StateId),
    /// No transition existed; the monitor can never match again.
    Dead,
}

impl Automaton {
    pub const INITIAL: StateId = 0;

    /// The event names this automaton transitions on.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn is_match(&self, state: StateId) -> bool {
        self.matching
            .get(state as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Advances from `state` on `event`.
    pub fn step(&self, state: StateId, event: &str) -> Step {
        let st = &self.states[state as usize];
        let sym = self.symbols.iter().position(|s| s == event);
        if let Some(sym) = sym {
            if let Some(&next) = st.transitions.get(&(sym as u32)) {
                return Step::To(next);
            }
        }
        match st.default {
            Some(next) => Step::To(next),
            None => Step::Dead,
        }
    }

    /// Checks that every symbol the automaton uses is among the declared
    /// event names.
    pub fn check_symbols_declared(&self, declared: &[String]) -> Result<(), AutomatonError> {
        for sym in &self.symbols {
            if !declared.iter().any(|d| d == sym) {
                return Err(AutomatonError::UndeclaredSymbol(sym.clone()));
            }
        }
        Ok(())
    }

    /// Compiles a regular expression over event names.
    ///
    /// Grammar: alternation `|`, postfix `*` `+` `?`, parentheses, and
    /// whitespace-separated concatenation of event names.
    pub fn from_ere(text: &str) -> Result<Self, AutomatonError> {
        let tokens = ere_lex(text)?;
        if tokens.is_empty() {
            return Err(AutomatonError::EmptyExpression);
        }
        let mut parser = EreParser {
            tokens: &tokens,
            pos: 0,
            symbols: Vec::new(),
        };
        let ast = parser.alternation()?;
        if parser.pos != tokens.len() {
            return Err(AutomatonError::UnbalancedParen);
        }
        let symbols = parser.symbols;

        let mut nfa = Nfa::default();
        let frag = nfa.compile(&ast);
        let accept = nfa.add_state();
        nfa.states[frag.end].eps.push(accept);

        Ok(nfa.determinize(frag.start, accept, symbols))
    }

    /// Parses a textual state table.
    ///
    /// ```text
    /// s0 [
    ///     open -> s1
    /// ]
    /// s1 [
    ///     default s1
    ///     close -> s0
    ///     end -> s2
    /// ]
    /// alias match = s2
    /// ```
    ///
    /// The first state block is the initial state. States that appear only
    /// as transition targets get an empty body.
    pub fn from_fsm(text: &str) -> Result<Self, AutomatonError> {
        let mut order: Vec<String> = Vec::new();
        let mut bodies: BTreeMap<String, Vec<(FsmEdge, String)>> = BTreeMap::new();
        let mut match_names: Vec<String> = Vec::new();

        let mut current: Option<String> = None;
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("alias match") {
                let rest = rest.trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .ok_or_else(|| AutomatonError::MalformedLine(line.to_string()))?;
                for name in rest.split([',', ' ']).filter(|s| !s.is_empty()) {
                    match_names.push(name.to_string());
                }
                continue;
            }
            match current.clone() {
                None => {
                    // Opening a state block: `name [`.
                    let Some(name) = line.strip_suffix('[').map(str::trim) else {
                        return Err(AutomatonError::MalformedLine(line.to_string()));
                    };
                    if name.is_empty() {
                        return Err(AutomatonError::MalformedLine(line.to_string()));
                    }
                    if !order.iter().any(|n| n == name) {
                        order.push(name.to_string());
                    }
                    bodies.entry(name.to_string()).or_default();
                    current = Some(name.to_string());
                }
                Some(state) => {
                    if line == "]" {
                        current = None;
                        continue;
                    }
                    let body = bodies.get_mut(&state).expect("open state has a body");
                    if let Some(target) = line.strip_prefix("default") {
                        let target = target.trim();
                        if target.is_empty() {
                            return Err(AutomatonError::MalformedLine(line.to_string()));
                        }
                        body.push((FsmEdge::Default, target.to_string()));
                    } else if let Some((event, target)) = line.split_once("->") {
                        let event = event.trim();
                        let target = target.trim();
                        if event.is_empty() || target.is_empty() {
                            return Err(AutomatonError::MalformedLine(line.to_string()));
                        }
                        body.push((FsmEdge::On(event.to_string()), target.to_string()));
                    } else {
                        return Err(AutomatonError::MalformedLine(line.to_string()));
                    }
                }
            }
        }

        if order.is_empty() {
            return Err(AutomatonError::EmptyTable);
        }
        if match_names.is_empty() {
            return Err(AutomatonError::NoMatchState);
        }

        // Second pass: targets seen only on the right-hand side become
        // states with empty bodies.
        for body in bodies.values() {
            for (_, target) in body {
                if !order.iter().any(|n| n == target) {
                    order.push(target.clone());
                }
            }
        }
        for name in &match_names {
            if !order.iter().any(|n| n == name) {
                order.push(name.clone());
            }
        }

        let state_id = |name: &str| -> StateId {
            order.iter().position(|n| n == name).unwrap() as StateId
        };

        let mut symbols: Vec<String> = Vec::new();
        let mut states: Vec<State> = vec![State::default(); order.len()];
        for (name, body) in &bodies {
            let sid = state_id(name) as usize;
            for (edge, target) in body {
                let target_id = state_id(target);
                match edge {
                    FsmEdge::Default => states[sid].default = Some(target_id),
                    FsmEdge::On(event) => {
                        let sym = match symbols.iter().position(|s| s == event) {
                            Some(i) => i as u32,
                            None => {
                                symbols.push(event.clone());
                                (symbols.len() - 1) as u32
                            }
                        };
                        if states[sid].transitions.insert(sym, target_id).is_some() {
                            return Err(AutomatonError::DuplicateTransition {
                                state: name.clone(),
                                event: event.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut matching = vec![false; order.len()];
        for name in &match_names {
            matching[state_id(name) as usize] = true;
        }

        Ok(Automaton {
            symbols,
            states,
            matching,
        })
    }
}

impl fmt::Display for Automaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "automaton({} states, {} symbols)",
            self.states.len(),
            self.symbols.len()
        )
    }
}

enum FsmEdge {
    On(String),
    Default,
}

// === regular expression compilation ===

#[derive(Debug, Clone, PartialEq)]
enum EreToken {
    Sym(String),
    LParen,
    RParen,
    Alt,
    Star,
    Plus,
    Opt,
}

fn ere_lex(text: &str) -> Result<Vec<EreToken>, AutomatonError> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(EreToken::LParen);
            }
            ')' => {
                chars.next();
                out.push(EreToken::RParen);
            }
            '|' => {
                chars.next();
                out.push(EreToken::Alt);
            }
            '*' => {
                chars.next();
                out.push(EreToken::Star);
            }
            '+' => {
                chars.next();
                out.push(EreToken::Plus);
            }
            '?' => {
                chars.next();
                out.push(EreToken::Opt);
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(EreToken::Sym(name));
            }
            other => return Err(AutomatonError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(out)
}

#[derive(Debug)]
enum EreAst {
    Sym(u32),
    Cat(Box<EreAst>, Box<EreAst>),
    Alt(Box<EreAst>, Box<EreAst>),
    Star(Box<EreAst>),
    Plus(Box<EreAst>),
    Opt(Box<EreAst>),
}

struct EreParser<'a> {
    tokens: &'a [EreToken],
    pos: usize,
    symbols: Vec<String>,
}

impl EreParser<'_> {
    fn peek(&self) -> Option<&EreToken> {
        self.tokens.get(self.pos)
    }

    fn alternation(&mut self) -> Result<EreAst, AutomatonError> {
        let mut lhs = self.concatenation()?;
        while matches!(self.peek(), Some(EreToken::Alt)) {
            self.pos += 1;
            let rhs = self.concatenation()?;
            lhs = EreAst::Alt(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn concatenation(&mut self) -> Result<EreAst, AutomatonError> {
        let mut parts: Vec<EreAst> = Vec::new();
        loop {
            match self.peek() {
                Some(EreToken::Sym(_)) | Some(EreToken::LParen) => {
                    parts.push(self.repetition()?);
                }
                _ => break,
            }
        }
        let mut iter = parts.into_iter();
        let first = iter.next().ok_or(AutomatonError::EmptyExpression)?;
        Ok(iter.fold(first, |acc, next| EreAst::Cat(Box::new(acc), Box::new(next))))
    }

    fn repetition(&mut self) -> Result<EreAst, AutomatonError> {
        let mut node = self.atom()?;
        loop {
            match self.peek() {
                Some(EreToken::Star) => {
                    self.pos += 1;
                    node = EreAst::Star(Box::new(node));
                }
                Some(EreToken::Plus) => {
                    self.pos += 1;
                    node = EreAst::Plus(Box::new(node));
                }
                Some(EreToken::Opt) => {
                    self.pos += 1;
                    node = EreAst::Opt(Box::new(node));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn atom(&mut self) -> Result<EreAst, AutomatonError> {
        match self.peek().cloned() {
            Some(EreToken::Sym(name)) => {
                self.pos += 1;
                let sym = match self.symbols.iter().position(|s| *s == name) {
                    Some(i) => i as u32,
                    None => {
                        self.symbols.push(name);
                        (self.symbols.len() - 1) as u32
                    }
                };
                Ok(EreAst::Sym(sym))
            }
            Some(EreToken::LParen) => {
                self.pos += 1;
                let inner = self.alternation()?;
                match self.peek() {
                    Some(EreToken::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(AutomatonError::UnbalancedParen),
                }
            }
            Some(tok) => Err(AutomatonError::UnexpectedToken(format!("{:?}", tok))),
            None => Err(AutomatonError::EmptyExpression),
        }
    }
}

#[derive(Default)]
struct NfaState {
    eps: Vec<usize>,
    trans: Vec<(u32, usize)>,
}

#[derive(Default)]
struct Nfa {
    states: Vec<NfaState>,
}

struct Frag {
    start: usize,
    end: usize,
}

impl Nfa {
    fn add_state(&mut self) -> usize {
        self.states.push(NfaState::default());
        self.states.len() - 1
    }

    fn compile(&mut self, ast: &EreAst) -> Frag {
        match ast {
            EreAst::Sym(sym) => {
                let start = self.add_state();
                let end = self.add_state();
                self.states[start].trans.push((*sym, end));
                Frag { start, end }
            }
            EreAst::Cat(a, b) => {
                let fa = self.compile(a);
                let fb = self.compile(b);
                self.states[fa.end].eps.push(fb.start);
                Frag {
                    start: fa.start,
                    end: fb.end,
                }
            }
            EreAst::Alt(a, b) => {
                let start = self.add_state();
                let end = self.add_state();
                let fa = self.compile(a);
                let fb = self.compile(b);
                self.states[start].eps.push(fa.start);
                self.states[start].eps.push(fb.start);
                self.states[fa.end].eps.push(end);
                self.states[fb.end].eps.push(end);
                Frag { start, end }
            }
            EreAst::Star(inner) => {
                let start = self.add_state();
                let end = self.add_state();
                let f = self.compile(inner);
                self.states[start].eps.push(f.start);
                self.states[start].eps.push(end);
                self.states[f.end].eps.push(f.start);
                self.states[f.end].eps.push(end);
                Frag { start, end }
            }
            EreAst::Plus(inner) => {
                let f = self.compile(inner);
                let end = self.add_state();
                self.states[f.end].eps.push(f.start);
                self.states[f.end].eps.push(end);
                Frag {
                    start: f.start,
                    end,
                }
            }
            EreAst::Opt(inner) => {
                let start = self.add_state();
                let end = self.add_state();
                let f = self.compile(inner);
                self.states[start].eps.push(f.start);
                self.states[start].eps.push(end);
                self.states[f.end].eps.push(end);
                Frag { start, end }
            }
        }
    }

    fn closure(&self, set: &mut BTreeSet<usize>) {
        let mut stack: Vec<usize> = set.iter().copied().collect();
        while let Some(s) = stack.pop() {
            for &e in &self.states[s].eps {
                if set.insert(e) {
                    stack.push(e);
                }
            }
        }
    }

    /// Standard subset construction over the symbol alphabet.
    fn determinize(&self, start: usize, accept: usize, symbols: Vec<String>) -> Automaton {
        let mut start_set = BTreeSet::from([start]);
        self.closure(&mut start_set);

        let mut ids: HashMap<BTreeSet<usize>, StateId> = HashMap::new();
        let mut order: Vec<BTreeSet<usize>> = vec![start_set.clone()];
        ids.insert(start_set, 0);

        let mut states: Vec<State> = vec![State::default()];
        let mut matching: Vec<bool> = vec![order[0].contains(&accept)];

        let mut i = 0;
        while i < order.len() {
            let current = order[i].clone();
            for sym in 0..symbols.len() as u32 {
                let mut next = BTreeSet::new();
                for &s in &current {
                    for &(t, target) in &self.states[s].trans {
                        if t == sym {
                            next.insert(target);
                        }
                    }
                }
                if next.is_empty() {
                    continue;
                }
                self.closure(&mut next);
                let id = match ids.get(&next) {
                    Some(&id) => id,
                    None => {
                        let id = order.len() as StateId;
                        ids.insert(next.clone(), id);
                        order.push(next.clone());
                        states.push(State::default());
                        matching.push(next.contains(&accept));
                        id
                    }
                };
                states[i].transitions.insert(sym, id);
            }
            i += 1;
        }

        Automaton {
            symbols,
            states,
            matching,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(a: &Automaton, events: &[&str]) -> Option<StateId> {
        let mut state = Automaton::INITIAL;
        for e in events {
            match a.step(state, e) {
                Step::To(next) => state = next,
                Step::Dead => return None,
            }
        }
        Some(state)
    }

    #[test]
    fn ere_matches_exact_sequence() {
        let a = Automaton::from_ere("open close").unwrap();
        let end = run(&a, &["open", "close"]).unwrap();
        assert!(a.is_match(end));
        let end = run(&a, &["open"]).unwrap();
        assert!(!a.is_match(end));
    }

    #[test]
    fn ere_star_plus_and_alternation() {
        let a = Automaton::from_ere("create update* (next | stop)+").unwrap();
        assert!(a.is_match(run(&a, &["create", "next"]).unwrap()));
        assert!(a.is_match(run(&a, &["create", "update", "update", "stop", "next"]).unwrap()));
        assert!(!a.is_match(run(&a, &["create", "update"]).unwrap()));
    }

    #[test]
    fn ere_unsafe_iterator_shape() {
        let a =
            Automaton::from_ere("createList updateList* createIter next* updateList+ next")
                .unwrap();
        let trace = [
            "createList",
            "createIter",
            "next",
            "updateList",
            "next",
        ];
        assert!(a.is_match(run(&a, &trace).unwrap()));
        // Without the post-iterator mutation there is no match.
        let ok = ["createList", "createIter", "next", "next"];
        assert!(!a.is_match(run(&a, &ok).unwrap()));
    }

    #[test]
    fn ere_dead_on_unmatched_symbol() {
        let a = Automaton::from_ere("open close").unwrap();
        assert_eq!(run(&a, &["close"]), None);
    }

    #[test]
    fn ere_rejects_garbage() {
        assert!(Automaton::from_ere("").is_err());
        assert!(Automaton::from_ere("(open").is_err());
        assert!(Automaton::from_ere("open $ close").is_err());
    }

    #[test]
    fn fsm_basic_cycle_with_match() {
        let a = Automaton::from_fsm(
            "s0 [\n  open -> s1\n]\ns1 [\n  close -> s0\n  end -> s2\n]\nalias match = s2\n",
        )
        .unwrap();
        assert!(a.is_match(run(&a, &["open", "end"]).unwrap()));
        assert!(!a.is_match(run(&a, &["open", "close"]).unwrap()));
        // `end` with every file closed: s0 has no `end` edge, so the
        // monitor dies instead of matching.
        assert_eq!(run(&a, &["open", "close", "end"]), None);
    }

    #[test]
    fn fsm_default_self_loop() {
        let a = Automaton::from_fsm(
            "s0 [\n  default s0\n  put -> s1\n]\ns1 [\n]\nalias match = s1\n",
        )
        .unwrap();
        assert!(a.is_match(run(&a, &["get", "get", "put"]).unwrap()));
    }

    #[test]
    fn fsm_requires_match_alias() {
        let err = Automaton::from_fsm("s0 [\n  a -> s0\n]\n").unwrap_err();
        assert!(matches!(err, AutomatonError::NoMatchState));
    }

    #[test]
    fn symbols_must_be_declared() {
        let a = Automaton::from_ere("open close").unwrap();
        assert!(a
            .check_symbols_declared(&["open".into(), "close".into()])
            .is_ok());
        assert!(a.check_symbols_declared(&["open".into()]).is_err());
    }
}
