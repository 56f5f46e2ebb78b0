//! The builtin shim: the bridge between instrumented execution and the
//! monitor engine.
//!
//! Rather than mutating global builtins, an explicit shim value is
//! threaded through the interpreter; rewritten callsites reach it through
//! dedicated AST nodes, and native dispatch reaches it under the
//! `builtin` strategy. The shim lowers host values into operands and
//! fires dispatcher hooks; when no dispatcher is installed it is inert
//! and instrumented code runs at plain-execution semantics.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use vigil_core::{CallableDesc, Dispatcher, EventPayload, Hook, Operand, SourceLocation};

use crate::value::Value;

/// Which layer produces call events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Rewritten AST nodes fire hooks; full operator/loop coverage.
    Ast,
    /// Native dispatch fires call/iterator hooks; no rewriting, and
    /// operator, loop, and user-function events are unavailable.
    Builtin,
}

/// The host-side view of one hook firing, handed to predicates through
/// the payload's opaque `host` field.
pub struct HostEvent {
    pub receiver: Option<Value>,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
    pub result: Option<Value>,
}

pub struct Shim {
    dispatcher: RefCell<Option<Arc<Dispatcher>>>,
    strategy: Cell<Strategy>,
    callback_errors: Cell<usize>,
}

impl Default for Shim {
    fn default() -> Self {
        Self::new()
    }
}

impl Shim {
    pub fn new() -> Self {
        Self {
            dispatcher: RefCell::new(None),
            strategy: Cell::new(Strategy::Ast),
            callback_errors: Cell::new(0),
        }
    }

    pub fn install(&self, dispatcher: Arc<Dispatcher>, strategy: Strategy) {
        *self.dispatcher.borrow_mut() = Some(dispatcher);
        self.strategy.set(strategy);
    }

    pub fn active(&self) -> bool {
        self.dispatcher.borrow().is_some()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.get()
    }

    /// Errors raised by tracker callbacks (predicates, match actions) are
    /// swallowed by their adapters and tallied here.
    pub fn note_callback_error(&self) {
        self.callback_errors.set(self.callback_errors.get() + 1);
    }

    pub fn callback_errors(&self) -> usize {
        self.callback_errors.get()
    }

    /// Fires one hook. Values are lowered to operands; the original
    /// values travel alongside as the opaque host context.
    #[allow(clippy::too_many_arguments)]
    pub fn fire(
        &self,
        hook: Hook,
        owner: &str,
        method: &str,
        receiver: Option<&Value>,
        args: &[Value],
        kwargs: &[(String, Value)],
        result: Option<&Value>,
        loc: &SourceLocation,
    ) {
        let dispatcher = self.dispatcher.borrow();
        let Some(dispatcher) = dispatcher.as_ref() else {
            return;
        };

        let recv_operand = receiver.map(Value::to_operand);
        let arg_operands: Vec<Operand> = args.iter().map(Value::to_operand).collect();
        let kwarg_operands: Vec<(String, Operand)> = kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_operand()))
            .collect();
        let result_operand = result.map(Value::to_operand);

        let host = HostEvent {
            receiver: receiver.cloned(),
            args: args.to_vec(),
            kwargs: kwargs.to_vec(),
            result: result.cloned(),
        };

        let payload = EventPayload {
            hook,
            callable: CallableDesc::new(owner, method),
            receiver: recv_operand.as_ref(),
            args: &arg_operands,
            kwargs: &kwarg_operands,
            result: result_operand.as_ref(),
            location: loc.clone(),
            host: Some(&host as &dyn Any),
        };
        dispatcher.dispatch(&payload);
    }

    /// Convenience pair for call-shaped hooks.
    #[allow(clippy::too_many_arguments)]
    pub fn fire_call(
        &self,
        phase: Hook,
        owner: &str,
        method: &str,
        receiver: Option<&Value>,
        args: &[Value],
        kwargs: &[(String, Value)],
        result: Option<&Value>,
        loc: &SourceLocation,
    ) {
        debug_assert!(matches!(phase, Hook::BeforeCall | Hook::AfterCall));
        self.fire(phase, owner, method, receiver, args, kwargs, result, loc);
    }
}
