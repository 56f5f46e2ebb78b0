//! The tree-walking evaluator.
//!
//! Execution is `Result`-driven end to end: statements produce a [`Flow`]
//! (normal, break, continue, return) and any host-level failure is a
//! [`VmError`] that propagates with `?` until a `try` handler or the
//! lifecycle catches it.
//!
//! The interpreter is also where instrumentation becomes observable:
//! rewriter-emitted nodes ([`ExprKind::TrackedCall`],
//! [`ExprKind::ShimCall`], [`ExprKind::ShadowSafeCtor`]) fire dispatcher
//! hooks through the [`Shim`], and under the `builtin` strategy native
//! dispatch fires call hooks directly with no rewriting involved.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use vigil_core::{Hook, SourceLocation};

use crate::ast::*;
use crate::builtins::Builtins;
use crate::loader::Loader;
use crate::shim::{Shim, Strategy};
use crate::value::{
    dict_get, dict_set, eq_values, BoundMethod, ClassData, EnvRef, FuncData, InstanceData,
    IterState, NativeCall, NativeClass, Obj, Payload, Scope, Value,
};

const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    Name,
    Attribute,
    Type,
    Value,
    Key,
    Index,
    Import,
    StopIteration,
    ZeroDivision,
    Io,
    Raised,
    Recursion,
}

impl VmErrorKind {
    fn label(&self) -> &'static str {
        match self {
            VmErrorKind::Name => "NameError",
            VmErrorKind::Attribute => "AttributeError",
            VmErrorKind::Type => "TypeError",
            VmErrorKind::Value => "ValueError",
            VmErrorKind::Key => "KeyError",
            VmErrorKind::Index => "IndexError",
            VmErrorKind::Import => "ImportError",
            VmErrorKind::StopIteration => "StopIteration",
            VmErrorKind::ZeroDivision => "ZeroDivisionError",
            VmErrorKind::Io => "IoError",
            VmErrorKind::Raised => "RaisedError",
            VmErrorKind::Recursion => "RecursionError",
        }
    }
}

/// A host-level exception.
#[derive(Debug)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub message: String,
    pub loc: Option<SourceLocation>,
}

impl std::error::Error for VmError {}

impl VmError {
    pub fn new(kind: VmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            loc: None,
        }
    }

    pub fn at(mut self, loc: SourceLocation) -> Self {
        if self.loc.is_none() {
            self.loc = Some(loc);
        }
        self
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        if let Some(loc) = &self.loc {
            write!(f, " ({}:{})", loc.file(), loc.line())?;
        }
        Ok(())
    }
}

/// Statement-level control flow.
#[derive(Debug)]
pub enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// The file/module pair execution currently runs under; threaded through
/// evaluation so every emitted hook carries a correct source hint.
#[derive(Clone)]
pub struct ModuleCtx {
    pub file: Arc<str>,
    pub module: Rc<str>,
}

pub struct Interp {
    pub builtins: Builtins,
    pub loader: Loader,
    pub shim: Shim,
    depth: Cell<usize>,
}

enum Cursor {
    Seq { obj: Rc<Obj>, index: usize },
    Items { items: Vec<Value>, index: usize },
    Host { obj: Rc<Obj> },
}

impl Interp {
    pub fn new(loader: Loader) -> Interp {
        Interp {
            builtins: Builtins::new(),
            loader,
            shim: Shim::new(),
            depth: Cell::new(0),
        }
    }

    /// A fresh module scope over the builtin scope.
    pub fn module_scope(&self) -> EnvRef {
        Scope::child(&self.builtins.scope)
    }

    pub fn exec_module(&self, module: &Module, env: &EnvRef) -> Result<(), VmError> {
        let ctx = ModuleCtx {
            file: module.file.clone(),
            module: Rc::from(module.name.as_str()),
        };
        self.exec_block(&module.body, env, &ctx)?;
        Ok(())
    }

    pub fn exec_block(
        &self,
        stmts: &[Stmt],
        env: &EnvRef,
        ctx: &ModuleCtx,
    ) -> Result<Flow, VmError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env, ctx)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn at(&self, ctx: &ModuleCtx, line: u32, col: u32) -> SourceLocation {
        SourceLocation::new(ctx.file.clone(), line, col)
    }

    fn exec_stmt(&self, stmt: &Stmt, env: &EnvRef, ctx: &ModuleCtx) -> Result<Flow, VmError> {
        let loc = self.at(ctx, stmt.line, stmt.col);
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.eval(e, env, ctx)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, env, ctx)?;
                self.assign(target, value, env, ctx)?;
                Ok(Flow::Normal)
            }
            StmtKind::AnnAssign { target, value, .. } => {
                // Annotations are not evaluated.
                if let Some(value) = value {
                    let value = self.eval(value, env, ctx)?;
                    self.assign(target, value, env, ctx)?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                // Unrewritten modules evaluate the plain form directly.
                let load = match target {
                    AssignTarget::Name(n) => self.lookup(n, env, &loc)?,
                    AssignTarget::Attr { obj, name } => {
                        let obj = self.eval(obj, env, ctx)?;
                        self.get_attr(&obj, name, &loc)?
                    }
                    AssignTarget::Index { obj, index } => {
                        let obj = self.eval(obj, env, ctx)?;
                        let index = self.eval(index, env, ctx)?;
                        self.get_index(&obj, &index, &loc)?
                    }
                    AssignTarget::List(_) => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "augmented assignment target cannot destructure",
                        )
                        .at(loc));
                    }
                };
                let value = self.eval(value, env, ctx)?;
                let result = self.binary(*op, &load, &value, &loc)?;
                self.assign(target, result, env, ctx)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, env, ctx)?.truthy() {
                        return self.exec_block(body, env, ctx);
                    }
                }
                self.exec_block(orelse, env, ctx)
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond, env, ctx)?.truthy() {
                    match self.exec_block(body, env, ctx)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter, env, ctx)?;
                let mut cursor = self.open_cursor(&iterable, &loc)?;
                while let Some(item) = self.cursor_next(&mut cursor, &loc)? {
                    self.assign(target, item, env, ctx)?;
                    match self.exec_block(body, env, ctx)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::FuncDef(def) => {
                let func = self.make_function(def.clone(), env, ctx)?;
                env.define(&def.name, func);
                Ok(Flow::Normal)
            }
            StmtKind::ClassDef {
                name,
                base,
                doc,
                body,
            } => {
                let class = self.exec_class_def(name, base.as_ref(), doc, body, env, ctx)?;
                env.define(name, class);
                Ok(Flow::Normal)
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(v) => self.eval(v, env, ctx)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Import { name } => {
                let module = self.import_module(name, &loc)?;
                env.define(name, module);
                Ok(Flow::Normal)
            }
            StmtKind::Try {
                body,
                handler,
                finally,
            } => {
                let mut outcome = self.exec_block(body, env, ctx);
                if let (Err(err), Some(handler)) = (&outcome, handler) {
                    if let Some(name) = &handler.name {
                        env.define(name, Value::str(err.message.clone()));
                    }
                    outcome = self.exec_block(&handler.body, env, ctx);
                }
                match self.exec_block(finally, env, ctx)? {
                    Flow::Normal => outcome,
                    flow => Ok(flow),
                }
            }
            StmtKind::Raise(value) => {
                let message = match value {
                    Some(v) => self.eval(v, env, ctx)?.display(),
                    None => "exception".to_string(),
                };
                Err(VmError::new(VmErrorKind::Raised, message).at(loc))
            }
        }
    }

    fn make_function(
        &self,
        def: Rc<FuncDef>,
        env: &EnvRef,
        ctx: &ModuleCtx,
    ) -> Result<Value, VmError> {
        // Defaults evaluate at definition time.
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let default = match &param.default {
                Some(expr) => Some(self.eval(expr, env, ctx)?),
                None => None,
            };
            defaults.push(default);
        }
        Ok(Value::Obj(Obj::new(Payload::Func(FuncData {
            def,
            env: env.clone(),
            module: ctx.module.clone(),
            file: ctx.file.clone(),
            defaults,
        }))))
    }

    fn exec_class_def(
        &self,
        name: &str,
        base: Option<&Expr>,
        doc: &Option<String>,
        body: &[Stmt],
        env: &EnvRef,
        ctx: &ModuleCtx,
    ) -> Result<Value, VmError> {
        let base = match base {
            Some(b) => Some(self.eval(b, env, ctx)?),
            None => None,
        };
        let class_scope = Scope::child(env);
        for stmt in body {
            match &stmt.kind {
                // Methods close over the scope enclosing the class
                // statement, not the class body.
                StmtKind::FuncDef(def) => {
                    let func = self.make_function(def.clone(), env, ctx)?;
                    class_scope.define(&def.name, func);
                }
                _ => {
                    self.exec_stmt(stmt, &class_scope, ctx)?;
                }
            }
        }
        let mut attrs = std::collections::HashMap::new();
        for n in class_scope.names() {
            if let Some(v) = class_scope.lookup(&n) {
                attrs.insert(n, v);
            }
        }
        Ok(Value::Obj(Obj::new(Payload::Class(ClassData {
            name: Rc::from(name),
            base,
            attrs: std::cell::RefCell::new(attrs),
            doc: doc.clone(),
            native: None,
        }))))
    }

    pub fn import_module(&self, name: &str, loc: &SourceLocation) -> Result<Value, VmError> {
        self.loader.import(self, name, loc)
    }

    fn lookup(&self, name: &str, env: &EnvRef, loc: &SourceLocation) -> Result<Value, VmError> {
        env.lookup(name).ok_or_else(|| {
            VmError::new(VmErrorKind::Name, format!("name `{}` is not defined", name))
                .at(loc.clone())
        })
    }

    fn assign(
        &self,
        target: &AssignTarget,
        value: Value,
        env: &EnvRef,
        ctx: &ModuleCtx,
    ) -> Result<(), VmError> {
        match target {
            AssignTarget::Name(name) => {
                env.define(name, value);
                Ok(())
            }
            AssignTarget::Attr { obj, name } => {
                let objv = self.eval(obj, env, ctx)?;
                let loc = self.at(ctx, obj.line, obj.col);
                self.set_attr(&objv, name, value, &loc)
            }
            AssignTarget::Index { obj, index } => {
                let objv = self.eval(obj, env, ctx)?;
                let idx = self.eval(index, env, ctx)?;
                let loc = self.at(ctx, obj.line, obj.col);
                self.set_index(&objv, &idx, value, &loc)
            }
            AssignTarget::List(targets) => {
                let loc = self.at(ctx, 0, 0);
                let items = self.collect_items(&value, &loc)?;
                if items.len() != targets.len() {
                    return Err(VmError::new(
                        VmErrorKind::Value,
                        format!(
                            "cannot unpack {} values into {} targets",
                            items.len(),
                            targets.len()
                        ),
                    ));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign(t, v, env, ctx)?;
                }
                Ok(())
            }
        }
    }

    // === expressions ===

    pub fn eval(&self, expr: &Expr, env: &EnvRef, ctx: &ModuleCtx) -> Result<Value, VmError> {
        let loc = self.at(ctx, expr.line, expr.col);
        match &expr.kind {
            ExprKind::NoneLit => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str(s.as_str())),
            ExprKind::Name(name) => self.lookup(name, env, &loc),
            ExprKind::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, env, ctx)?);
                }
                let value = Value::list(out);
                if self.shim.active() && self.shim.strategy() == Strategy::Builtin {
                    self.shim
                        .fire_call(Hook::AfterCall, "list", "__init__", None, &[], &[], Some(&value), &loc);
                }
                Ok(value)
            }
            ExprKind::Dict(items) => {
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        DictItem::Pair(k, v) => {
                            let k = self.eval(k, env, ctx)?;
                            let v = self.eval(v, env, ctx)?;
                            dict_set(&mut pairs, k, v);
                        }
                        DictItem::Spread(e) => {
                            let spread = self.eval(e, env, ctx)?;
                            let Some(obj) = spread.obj() else {
                                return Err(VmError::new(
                                    VmErrorKind::Type,
                                    "`**` operand must be a dict",
                                )
                                .at(loc));
                            };
                            let payload = obj.payload.borrow();
                            let Payload::Dict(entries) = &*payload else {
                                return Err(VmError::new(
                                    VmErrorKind::Type,
                                    "`**` operand must be a dict",
                                )
                                .at(loc));
                            };
                            for (k, v) in entries {
                                dict_set(&mut pairs, k.clone(), v.clone());
                            }
                        }
                    }
                }
                let value = Value::dict(pairs);
                if self.shim.active() && self.shim.strategy() == Strategy::Builtin {
                    self.shim
                        .fire_call(Hook::AfterCall, "dict", "__init__", None, &[], &[], Some(&value), &loc);
                }
                Ok(value)
            }
            ExprKind::ListComp {
                elt,
                target,
                iter,
                cond,
            } => {
                let iterable = self.eval(iter, env, ctx)?;
                let mut cursor = self.open_cursor(&iterable, &loc)?;
                let mut out = Vec::new();
                while let Some(item) = self.cursor_next(&mut cursor, &loc)? {
                    self.assign(target, item, env, ctx)?;
                    if let Some(cond) = cond {
                        if !self.eval(cond, env, ctx)?.truthy() {
                            continue;
                        }
                    }
                    out.push(self.eval(elt, env, ctx)?);
                }
                Ok(Value::list(out))
            }
            ExprKind::Attr { obj, name } => {
                let objv = self.eval(obj, env, ctx)?;
                self.get_attr(&objv, name, &loc)
            }
            ExprKind::Index { obj, index } => {
                let objv = self.eval(obj, env, ctx)?;
                let idx = self.eval(index, env, ctx)?;
                self.get_index(&objv, &idx, &loc)
            }
            ExprKind::Call { func, args, kwargs } => {
                let callee = self.eval(func, env, ctx)?;
                let (args, kwargs) = self.eval_args(args, kwargs, env, ctx)?;
                self.invoke(&callee, args, kwargs, &loc)
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand, env, ctx)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(VmError::new(
                            VmErrorKind::Type,
                            format!("cannot negate {}", other.type_name()),
                        )
                        .at(loc)),
                    },
                }
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.eval(left, env, ctx)?;
                let r = self.eval(right, env, ctx)?;
                self.binary(*op, &l, &r, &loc)
            }
            ExprKind::Compare { first, rest } => {
                let mut left = self.eval(first, env, ctx)?;
                for (op, right) in rest {
                    let right = self.eval(right, env, ctx)?;
                    if !self.compare(*op, &left, &right, &loc)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::BoolChain { and, values } => {
                let mut last = Value::None;
                for (i, v) in values.iter().enumerate() {
                    last = self.eval(v, env, ctx)?;
                    let truthy = last.truthy();
                    let short = if *and { !truthy } else { truthy };
                    if short && i < values.len() - 1 {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            ExprKind::IfExp { cond, then, orelse } => {
                if self.eval(cond, env, ctx)?.truthy() {
                    self.eval(then, env, ctx)
                } else {
                    self.eval(orelse, env, ctx)
                }
            }
            ExprKind::TrackedCall { func, args, kwargs } => {
                let callee = self.eval(func, env, ctx)?;
                let (args, kwargs) = self.eval_args(args, kwargs, env, ctx)?;
                self.tracked_invoke(&callee, args, kwargs, &loc)
            }
            ExprKind::ShimCall { f, args, kwargs } => {
                let (args, kwargs) = self.eval_args(args, kwargs, env, ctx)?;
                self.shim_call(f, args, kwargs, env, &loc)
            }
            ExprKind::ShadowSafeCtor { name, args, kwargs } => {
                let resolved = self.lookup(name, env, &loc)?;
                let (args, kwargs) = self.eval_args(args, kwargs, env, ctx)?;
                let anchor = match name.as_str() {
                    "list" => &self.builtins.list_class,
                    _ => &self.builtins.dict_class,
                };
                if resolved.is_identical(anchor) {
                    let f = if name == "list" { ShimFn::List } else { ShimFn::Dict };
                    self.shim_call(&f, args, kwargs, env, &loc)
                } else {
                    // The name was shadowed by user code; call whatever it
                    // resolves to now.
                    self.invoke(&resolved, args, kwargs, &loc)
                }
            }
        }
    }

    fn eval_args(
        &self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        env: &EnvRef,
        ctx: &ModuleCtx,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), VmError> {
        let mut arg_values = Vec::with_capacity(args.len());
        for a in args {
            arg_values.push(self.eval(a, env, ctx)?);
        }
        let mut kwarg_values = Vec::with_capacity(kwargs.len());
        for (k, v) in kwargs {
            kwarg_values.push((k.clone(), self.eval(v, env, ctx)?));
        }
        Ok((arg_values, kwarg_values))
    }

    // === calls ===

    /// A call fired through the function-call tracker (`ast` strategy).
    fn tracked_invoke(
        &self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let fire = self.shim.active() && self.shim.strategy() == Strategy::Ast;
        if !fire {
            return self.invoke(callee, args, kwargs, loc);
        }
        let (owner, name) = self.callable_desc(callee);
        let receiver = receiver_of(callee);
        self.shim.fire_call(
            Hook::BeforeCall,
            &owner,
            &name,
            receiver.as_ref(),
            &args,
            &kwargs,
            None,
            loc,
        );
        let result = self.invoke(callee, args.clone(), kwargs.clone(), loc)?;
        self.shim.fire_call(
            Hook::AfterCall,
            &owner,
            &name,
            receiver.as_ref(),
            &args,
            &kwargs,
            Some(&result),
            loc,
        );
        Ok(result)
    }

    fn callable_desc(&self, callee: &Value) -> (String, String) {
        match callee {
            Value::Obj(o) => match &*o.payload.borrow() {
                Payload::Native(f) => (f.owner.to_string(), f.name.to_string()),
                Payload::BoundMethod(m) => (m.owner.to_string(), m.name.to_string()),
                Payload::Func(f) => (f.module.to_string(), f.def.name.clone()),
                Payload::Class(c) => (c.name.to_string(), "__init__".to_string()),
                _ => (callee.type_name(), "__call__".to_string()),
            },
            _ => (callee.type_name(), "__call__".to_string()),
        }
    }

    /// Invokes `callee`. Under the `builtin` strategy, native callables
    /// fire call hooks here (the no-rewriting path).
    pub fn invoke(
        &self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        if self.depth.get() >= MAX_CALL_DEPTH {
            return Err(
                VmError::new(VmErrorKind::Recursion, "maximum call depth exceeded")
                    .at(loc.clone()),
            );
        }
        self.depth.set(self.depth.get() + 1);
        let result = self.invoke_inner(callee, args, kwargs, loc);
        self.depth.set(self.depth.get() - 1);
        result
    }

    fn invoke_inner(
        &self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let Some(obj) = callee.obj() else {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not callable", callee.type_name()),
            )
            .at(loc.clone()));
        };

        enum Plan {
            Native(crate::value::NativeFn, Option<Value>),
            Func(FuncData, Option<Value>),
            Class,
        }

        let plan = {
            let payload = obj.payload.borrow();
            match &*payload {
                Payload::Native(f) => Plan::Native(f.clone(), None),
                Payload::Func(f) => Plan::Func(f.clone(), None),
                Payload::BoundMethod(m) => match m.func.obj().map(|o| o.payload.borrow()) {
                    Some(p) => match &*p {
                        Payload::Native(f) => Plan::Native(f.clone(), Some(m.recv.clone())),
                        Payload::Func(f) => Plan::Func(f.clone(), Some(m.recv.clone())),
                        _ => {
                            return Err(VmError::new(
                                VmErrorKind::Type,
                                "bound method wraps a non-callable",
                            )
                            .at(loc.clone()));
                        }
                    },
                    None => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "bound method wraps a non-callable",
                        )
                        .at(loc.clone()));
                    }
                },
                Payload::Class(_) => Plan::Class,
                _ => {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        format!("{} is not callable", callee.type_name()),
                    )
                    .at(loc.clone()));
                }
            }
        };

        let fire_builtin = self.shim.active() && self.shim.strategy() == Strategy::Builtin;
        match plan {
            Plan::Native(f, recv) => {
                if fire_builtin {
                    self.shim.fire_call(
                        Hook::BeforeCall,
                        &f.owner,
                        &f.name,
                        recv.as_ref(),
                        &args,
                        &kwargs,
                        None,
                        loc,
                    );
                }
                let call = NativeCall {
                    recv: recv.clone(),
                    args: &args,
                    kwargs: &kwargs,
                    loc,
                };
                let result = (f.f)(self, &call)?;
                if fire_builtin {
                    self.shim.fire_call(
                        Hook::AfterCall,
                        &f.owner,
                        &f.name,
                        recv.as_ref(),
                        &args,
                        &kwargs,
                        Some(&result),
                        loc,
                    );
                }
                Ok(result)
            }
            Plan::Func(func, recv) => self.call_function(&func, recv, args, kwargs, loc),
            Plan::Class => self.instantiate(callee, args, kwargs, loc, fire_builtin),
        }
    }

    fn call_function(
        &self,
        func: &FuncData,
        recv: Option<Value>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let def = &func.def;
        let defaults = &func.defaults;
        let env = Scope::child(&func.env);
        let mut positional: Vec<Value> = Vec::with_capacity(args.len() + 1);
        if let Some(recv) = recv {
            positional.push(recv);
        }
        positional.extend(args);

        if positional.len() > def.params.len() {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!(
                    "{}() takes {} arguments but {} were given",
                    def.name,
                    def.params.len(),
                    positional.len()
                ),
            )
            .at(loc.clone()));
        }

        let mut kwargs = kwargs;
        for (i, param) in def.params.iter().enumerate() {
            let value = if i < positional.len() {
                positional[i].clone()
            } else if let Some(pos) = kwargs.iter().position(|(k, _)| k == &param.name) {
                kwargs.remove(pos).1
            } else if let Some(Some(default)) = defaults.get(i) {
                default.clone()
            } else {
                return Err(VmError::new(
                    VmErrorKind::Type,
                    format!("{}() missing argument `{}`", def.name, param.name),
                )
                .at(loc.clone()));
            };
            env.define(&param.name, value);
        }
        if let Some((name, _)) = kwargs.first() {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!("{}() got an unexpected keyword argument `{}`", def.name, name),
            )
            .at(loc.clone()));
        }

        let ctx = ModuleCtx {
            file: func.file.clone(),
            module: func.module.clone(),
        };
        match self.exec_block(&def.body, &env, &ctx)? {
            Flow::Return(v) => Ok(v),
            _ => Ok(Value::None),
        }
    }

    fn instantiate(
        &self,
        class_value: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: &SourceLocation,
        fire_builtin: bool,
    ) -> Result<Value, VmError> {
        let obj = class_value.obj().expect("class payloads are heap objects");
        let (class_name, native) = {
            let payload = obj.payload.borrow();
            let Payload::Class(c) = &*payload else {
                unreachable!("instantiate called on a class value");
            };
            (c.name.clone(), c.native)
        };

        if fire_builtin {
            self.shim.fire_call(
                Hook::BeforeCall,
                &class_name,
                "__init__",
                None,
                &args,
                &kwargs,
                None,
                loc,
            );
        }

        let result = match native {
            Some(NativeClass::List) => {
                let items = match args.first() {
                    Some(v) => self.collect_items(v, loc)?,
                    None => Vec::new(),
                };
                Value::list(items)
            }
            Some(NativeClass::Dict) => self.dict_from(args.first(), &kwargs, loc)?,
            Some(NativeClass::Str) => match args.first() {
                Some(v) => Value::str(v.display()),
                None => Value::str(""),
            },
            Some(NativeClass::Int) => match args.first() {
                Some(Value::Int(i)) => Value::Int(*i),
                Some(Value::Float(f)) => Value::Int(*f as i64),
                Some(Value::Str(s)) => Value::Int(s.trim().parse().map_err(|_| {
                    VmError::new(VmErrorKind::Value, format!("invalid int literal {:?}", s))
                        .at(loc.clone())
                })?),
                Some(Value::Bool(b)) => Value::Int(i64::from(*b)),
                Some(other) => {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        format!("cannot convert {} to int", other.type_name()),
                    )
                    .at(loc.clone()));
                }
                None => Value::Int(0),
            },
            Some(NativeClass::Float) => match args.first() {
                Some(Value::Int(i)) => Value::Float(*i as f64),
                Some(Value::Float(f)) => Value::Float(*f),
                Some(Value::Str(s)) => Value::Float(s.trim().parse().map_err(|_| {
                    VmError::new(VmErrorKind::Value, format!("invalid float literal {:?}", s))
                        .at(loc.clone())
                })?),
                Some(other) => {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        format!("cannot convert {} to float", other.type_name()),
                    )
                    .at(loc.clone()));
                }
                None => Value::Float(0.0),
            },
            Some(NativeClass::Object) | None => {
                let instance = Value::Obj(Obj::new(Payload::Instance(InstanceData {
                    class: class_value.clone(),
                    attrs: std::cell::RefCell::new(std::collections::HashMap::new()),
                })));
                if native.is_none() {
                    if let Some(init) = self.find_class_attr(class_value, "init") {
                        let bound = bind_method(&instance, init, "init", &class_name);
                        self.invoke(&bound, args, kwargs, loc)?;
                    }
                }
                instance
            }
        };

        if fire_builtin {
            self.shim.fire_call(
                Hook::AfterCall,
                &class_name,
                "__init__",
                None,
                &[],
                &[],
                Some(&result),
                loc,
            );
        }
        Ok(result)
    }

    fn dict_from(
        &self,
        arg: Option<&Value>,
        kwargs: &[(String, Value)],
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let mut pairs: Vec<(Value, Value)> = Vec::new();
        if let Some(v) = arg {
            match v.obj().map(|o| o.payload.borrow()) {
                Some(p) => match &*p {
                    Payload::Dict(entries) => {
                        for (k, v) in entries {
                            dict_set(&mut pairs, k.clone(), v.clone());
                        }
                    }
                    Payload::List(items) => {
                        for item in items {
                            let pair = self.collect_items(item, loc)?;
                            if pair.len() != 2 {
                                return Err(VmError::new(
                                    VmErrorKind::Value,
                                    "dict() entries must be [key, value] pairs",
                                )
                                .at(loc.clone()));
                            }
                            dict_set(&mut pairs, pair[0].clone(), pair[1].clone());
                        }
                    }
                    _ => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "dict() argument must be a dict or a list of pairs",
                        )
                        .at(loc.clone()));
                    }
                },
                None => {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        "dict() argument must be a dict or a list of pairs",
                    )
                    .at(loc.clone()));
                }
            }
        }
        for (k, v) in kwargs {
            dict_set(&mut pairs, Value::str(k.as_str()), v.clone());
        }
        Ok(Value::dict(pairs))
    }

    /// Walks the class chain for an attribute.
    pub fn find_class_attr(&self, class_value: &Value, name: &str) -> Option<Value> {
        let obj = class_value.obj()?;
        let payload = obj.payload.borrow();
        let Payload::Class(c) = &*payload else {
            return None;
        };
        if let Some(v) = c.attrs.borrow().get(name) {
            return Some(v.clone());
        }
        let base = c.base.clone()?;
        drop(payload);
        self.find_class_attr(&base, name)
    }

    // === attributes and indexing ===

    pub fn get_attr(
        &self,
        value: &Value,
        name: &str,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let missing = || {
            VmError::new(
                VmErrorKind::Attribute,
                format!("{} has no attribute `{}`", value.type_name(), name),
            )
            .at(loc.clone())
        };

        if let Value::Str(_) = value {
            if let Some(f) = self.builtins.str_method(name) {
                return Ok(bind_method(value, Value::native(f), name, "str"));
            }
            return Err(missing());
        }

        let Some(obj) = value.obj() else {
            return Err(missing());
        };
        let payload = obj.payload.borrow();
        match &*payload {
            Payload::Module(m) => m.globals.lookup(name).ok_or_else(missing),
            Payload::Instance(inst) => {
                if let Some(v) = inst.attrs.borrow().get(name) {
                    return Ok(v.clone());
                }
                let class = inst.class.clone();
                let class_name = inst.class.type_name();
                drop(payload);
                match self.find_class_attr(&class, name) {
                    Some(found) => {
                        let bindable = matches!(
                            found.obj().map(|o| {
                                matches!(&*o.payload.borrow(), Payload::Func(_) | Payload::Native(_))
                            }),
                            Some(true)
                        );
                        if bindable {
                            Ok(bind_method(value, found, name, &class_name))
                        } else {
                            Ok(found)
                        }
                    }
                    None => Err(missing()),
                }
            }
            Payload::Class(c) => {
                if let Some(v) = c.attrs.borrow().get(name) {
                    return Ok(v.clone());
                }
                match c.base.clone() {
                    Some(base) => {
                        drop(payload);
                        self.get_attr(&base, name, loc)
                    }
                    None => Err(missing()),
                }
            }
            Payload::File(state) => {
                if name == "closed" {
                    return Ok(Value::Bool(state.closed));
                }
                drop(payload);
                match self.builtins.file_method(name) {
                    Some(f) => Ok(bind_method(value, Value::native(f), name, "File")),
                    None => Err(missing()),
                }
            }
            Payload::Socket(_) => {
                drop(payload);
                match self.builtins.socket_method(name) {
                    Some(f) => Ok(bind_method(value, Value::native(f), name, "Socket")),
                    None => Err(missing()),
                }
            }
            Payload::List(_) => {
                drop(payload);
                match self.builtins.list_method(name) {
                    Some(f) => Ok(bind_method(value, Value::native(f), name, "list")),
                    None => Err(missing()),
                }
            }
            Payload::Dict(_) => {
                drop(payload);
                match self.builtins.dict_method(name) {
                    Some(f) => Ok(bind_method(value, Value::native(f), name, "dict")),
                    None => Err(missing()),
                }
            }
            _ => Err(missing()),
        }
    }

    pub fn set_attr(
        &self,
        value: &Value,
        name: &str,
        new_value: Value,
        loc: &SourceLocation,
    ) -> Result<(), VmError> {
        let Some(obj) = value.obj() else {
            return Err(VmError::new(
                VmErrorKind::Attribute,
                format!("cannot set attribute on {}", value.type_name()),
            )
            .at(loc.clone()));
        };
        let payload = obj.payload.borrow();
        match &*payload {
            Payload::Instance(inst) => {
                inst.attrs.borrow_mut().insert(name.to_string(), new_value);
                Ok(())
            }
            Payload::Module(m) => {
                m.globals.define(name, new_value);
                Ok(())
            }
            _ => Err(VmError::new(
                VmErrorKind::Attribute,
                format!("cannot set attribute on {}", value.type_name()),
            )
            .at(loc.clone())),
        }
    }

    pub fn get_index(
        &self,
        value: &Value,
        index: &Value,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        if let Value::Str(s) = value {
            let Value::Int(i) = index else {
                return Err(VmError::new(VmErrorKind::Type, "string indices must be integers")
                    .at(loc.clone()));
            };
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len()).ok_or_else(|| {
                VmError::new(VmErrorKind::Index, "string index out of range").at(loc.clone())
            })?;
            return Ok(Value::str(chars[idx].to_string()));
        }
        let Some(obj) = value.obj() else {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not subscriptable", value.type_name()),
            )
            .at(loc.clone()));
        };
        let payload = obj.payload.borrow();
        match &*payload {
            Payload::List(items) => {
                let Value::Int(i) = index else {
                    return Err(VmError::new(VmErrorKind::Type, "list indices must be integers")
                        .at(loc.clone()));
                };
                let idx = normalize_index(*i, items.len()).ok_or_else(|| {
                    VmError::new(VmErrorKind::Index, "list index out of range").at(loc.clone())
                })?;
                Ok(items[idx].clone())
            }
            Payload::Dict(pairs) => dict_get(pairs, index).ok_or_else(|| {
                VmError::new(VmErrorKind::Key, format!("key {} not found", index.repr()))
                    .at(loc.clone())
            }),
            _ => Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not subscriptable", value.type_name()),
            )
            .at(loc.clone())),
        }
    }

    pub fn set_index(
        &self,
        value: &Value,
        index: &Value,
        new_value: Value,
        loc: &SourceLocation,
    ) -> Result<(), VmError> {
        let Some(obj) = value.obj() else {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!("{} does not support item assignment", value.type_name()),
            )
            .at(loc.clone()));
        };
        let type_name = {
            let mut payload = obj.payload.borrow_mut();
            match &mut *payload {
                Payload::List(items) => {
                    let Value::Int(i) = index else {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "list indices must be integers",
                        )
                        .at(loc.clone()));
                    };
                    let idx = normalize_index(*i, items.len()).ok_or_else(|| {
                        VmError::new(VmErrorKind::Index, "list assignment index out of range")
                            .at(loc.clone())
                    })?;
                    items[idx] = new_value.clone();
                    "list"
                }
                Payload::Dict(pairs) => {
                    dict_set(pairs, index.clone(), new_value.clone());
                    "dict"
                }
                _ => {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        format!("{} does not support item assignment", value.type_name()),
                    )
                    .at(loc.clone()));
                }
            }
        };
        // Store-subscripts are container mutations too; they fire like the
        // corresponding method under either strategy.
        if self.shim.active() {
            let args = [index.clone(), new_value];
            self.shim.fire_call(
                Hook::AfterCall,
                type_name,
                "__setitem__",
                Some(value),
                &args,
                &[],
                None,
                loc,
            );
        }
        Ok(())
    }

    // === operators ===

    pub fn binary(
        &self,
        op: BinOp,
        l: &Value,
        r: &Value,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        use BinOp::*;
        let type_err = || {
            VmError::new(
                VmErrorKind::Type,
                format!(
                    "unsupported operand types for {}: {} and {}",
                    op.name(),
                    l.type_name(),
                    r.type_name()
                ),
            )
            .at(loc.clone())
        };

        // String and list forms first.
        match (op, l, r) {
            (Add, Value::Str(a), Value::Str(b)) => {
                return Ok(Value::str(format!("{}{}", a, b)));
            }
            (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
                return Ok(Value::str(s.repeat((*n).max(0) as usize)));
            }
            (Add, Value::Obj(a), Value::Obj(b)) => {
                let (pa, pb) = (a.payload.borrow(), b.payload.borrow());
                if let (Payload::List(xs), Payload::List(ys)) = (&*pa, &*pb) {
                    let mut out = xs.clone();
                    out.extend(ys.iter().cloned());
                    return Ok(Value::list(out));
                }
            }
            (Mul, Value::Obj(a), Value::Int(n)) => {
                let pa = a.payload.borrow();
                if let Payload::List(xs) = &*pa {
                    let mut out = Vec::new();
                    for _ in 0..(*n).max(0) {
                        out.extend(xs.iter().cloned());
                    }
                    return Ok(Value::list(out));
                }
            }
            _ => {}
        }

        let as_float = |v: &Value| -> Option<f64> {
            match v {
                Value::Int(i) => Some(*i as f64),
                Value::Float(f) => Some(*f),
                _ => None,
            }
        };

        if let (Value::Int(a), Value::Int(b)) = (l, r) {
            let (a, b) = (*a, *b);
            return match op {
                Add => Ok(Value::Int(a.wrapping_add(b))),
                Sub => Ok(Value::Int(a.wrapping_sub(b))),
                Mul => Ok(Value::Int(a.wrapping_mul(b))),
                Div => {
                    if b == 0 {
                        Err(VmError::new(VmErrorKind::ZeroDivision, "division by zero")
                            .at(loc.clone()))
                    } else {
                        Ok(Value::Float(a as f64 / b as f64))
                    }
                }
                FloorDiv => {
                    if b == 0 {
                        Err(VmError::new(VmErrorKind::ZeroDivision, "division by zero")
                            .at(loc.clone()))
                    } else {
                        Ok(Value::Int(a.div_euclid(b)))
                    }
                }
                Mod => {
                    if b == 0 {
                        Err(VmError::new(VmErrorKind::ZeroDivision, "modulo by zero")
                            .at(loc.clone()))
                    } else {
                        Ok(Value::Int(a.rem_euclid(b)))
                    }
                }
                Pow => {
                    if b >= 0 {
                        Ok(Value::Int(a.wrapping_pow(b.min(u32::MAX as i64) as u32)))
                    } else {
                        Ok(Value::Float((a as f64).powi(b as i32)))
                    }
                }
                Shl => Ok(Value::Int(a.wrapping_shl(b.max(0) as u32))),
                Shr => Ok(Value::Int(a.wrapping_shr(b.max(0) as u32))),
                BitAnd => Ok(Value::Int(a & b)),
                BitOr => Ok(Value::Int(a | b)),
                BitXor => Ok(Value::Int(a ^ b)),
            };
        }

        if let (Some(a), Some(b)) = (as_float(l), as_float(r)) {
            return match op {
                Add => Ok(Value::Float(a + b)),
                Sub => Ok(Value::Float(a - b)),
                Mul => Ok(Value::Float(a * b)),
                Div => {
                    if b == 0.0 {
                        Err(VmError::new(VmErrorKind::ZeroDivision, "division by zero")
                            .at(loc.clone()))
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                FloorDiv => {
                    if b == 0.0 {
                        Err(VmError::new(VmErrorKind::ZeroDivision, "division by zero")
                            .at(loc.clone()))
                    } else {
                        Ok(Value::Float((a / b).floor()))
                    }
                }
                Mod => {
                    if b == 0.0 {
                        Err(VmError::new(VmErrorKind::ZeroDivision, "modulo by zero")
                            .at(loc.clone()))
                    } else {
                        Ok(Value::Float(a - (a / b).floor() * b))
                    }
                }
                Pow => Ok(Value::Float(a.powf(b))),
                _ => Err(type_err()),
            };
        }

        Err(type_err())
    }

    /// One comparison step. Identity and membership never consult host
    /// methods; ordering on instances does.
    pub fn compare(
        &self,
        op: CmpOp,
        l: &Value,
        r: &Value,
        loc: &SourceLocation,
    ) -> Result<bool, VmError> {
        match op {
            CmpOp::Is => Ok(l.is_identical(r)),
            CmpOp::In => self.contains(r, l, loc),
            CmpOp::Eq => self.values_equal(l, r, loc),
            CmpOp::NotEq => Ok(!self.values_equal(l, r, loc)?),
            CmpOp::Lt => self.order(l, r, loc, "__lt__", |o| o == std::cmp::Ordering::Less),
            CmpOp::LtEq => self.order(l, r, loc, "__le__", |o| o != std::cmp::Ordering::Greater),
            CmpOp::Gt => self.order(l, r, loc, "__gt__", |o| o == std::cmp::Ordering::Greater),
            CmpOp::GtEq => self.order(l, r, loc, "__ge__", |o| o != std::cmp::Ordering::Less),
        }
    }

    fn values_equal(&self, l: &Value, r: &Value, loc: &SourceLocation) -> Result<bool, VmError> {
        if let Some(method) = self.instance_method(l, "__eq__") {
            let result = self.invoke(&method, vec![r.clone()], vec![], loc)?;
            return Ok(result.truthy());
        }
        Ok(eq_values(l, r))
    }

    fn instance_method(&self, value: &Value, name: &str) -> Option<Value> {
        let obj = value.obj()?;
        let class = {
            let payload = obj.payload.borrow();
            let Payload::Instance(inst) = &*payload else {
                return None;
            };
            inst.class.clone()
        };
        let found = self.find_class_attr(&class, name)?;
        Some(bind_method(value, found, name, &class.type_name()))
    }

    fn order(
        &self,
        l: &Value,
        r: &Value,
        loc: &SourceLocation,
        method: &str,
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<bool, VmError> {
        if let Some(bound) = self.instance_method(l, method) {
            let result = self.invoke(&bound, vec![r.clone()], vec![], loc)?;
            return Ok(result.truthy());
        }
        let ordering = self.ordering_of(l, r, loc)?;
        Ok(accept(ordering))
    }

    fn ordering_of(
        &self,
        l: &Value,
        r: &Value,
        loc: &SourceLocation,
    ) -> Result<std::cmp::Ordering, VmError> {
        use std::cmp::Ordering;
        let err = || {
            VmError::new(
                VmErrorKind::Type,
                format!(
                    "comparison not supported between {} and {}",
                    l.type_name(),
                    r.type_name()
                ),
            )
            .at(loc.clone())
        };
        match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).ok_or_else(err),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b).ok_or_else(err),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)).ok_or_else(err),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Obj(a), Value::Obj(b)) => {
                let (pa, pb) = (a.payload.borrow(), b.payload.borrow());
                match (&*pa, &*pb) {
                    (Payload::List(xs), Payload::List(ys)) => {
                        let (xs, ys) = (xs.clone(), ys.clone());
                        drop(pa);
                        drop(pb);
                        for (x, y) in xs.iter().zip(ys.iter()) {
                            let o = self.ordering_of(x, y, loc)?;
                            if o != Ordering::Equal {
                                return Ok(o);
                            }
                        }
                        Ok(xs.len().cmp(&ys.len()))
                    }
                    _ => Err(err()),
                }
            }
            _ => Err(err()),
        }
    }

    fn contains(
        &self,
        container: &Value,
        item: &Value,
        loc: &SourceLocation,
    ) -> Result<bool, VmError> {
        if let (Value::Str(hay), Value::Str(needle)) = (container, item) {
            return Ok(hay.contains(&**needle));
        }
        let Some(obj) = container.obj() else {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not a container", container.type_name()),
            )
            .at(loc.clone()));
        };
        let payload = obj.payload.borrow();
        match &*payload {
            Payload::List(items) => Ok(items.iter().any(|v| eq_values(v, item))),
            Payload::Dict(pairs) => Ok(pairs.iter().any(|(k, _)| eq_values(k, item))),
            _ => Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not a container", container.type_name()),
            )
            .at(loc.clone())),
        }
    }

    // === iteration ===

    pub fn make_iter(&self, source: Value, hints: Option<SourceLocation>) -> Value {
        Value::Obj(Obj::new(Payload::Iter(IterState {
            source,
            index: 0,
            hints,
        })))
    }

    fn open_cursor(&self, value: &Value, loc: &SourceLocation) -> Result<Cursor, VmError> {
        if let Value::Str(s) = value {
            let items = s
                .chars()
                .map(|c| Value::str(c.to_string()))
                .collect::<Vec<_>>();
            return Ok(Cursor::Items { items, index: 0 });
        }
        let Some(obj) = value.obj() else {
            return Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not iterable", value.type_name()),
            )
            .at(loc.clone()));
        };
        let payload = obj.payload.borrow();
        match &*payload {
            Payload::List(_) | Payload::Dict(_) => Ok(Cursor::Seq {
                obj: obj.clone(),
                index: 0,
            }),
            Payload::Iter(_) => Ok(Cursor::Host { obj: obj.clone() }),
            _ => Err(VmError::new(
                VmErrorKind::Type,
                format!("{} is not iterable", value.type_name()),
            )
            .at(loc.clone())),
        }
    }

    fn cursor_next(
        &self,
        cursor: &mut Cursor,
        loc: &SourceLocation,
    ) -> Result<Option<Value>, VmError> {
        match cursor {
            Cursor::Items { items, index } => {
                if *index < items.len() {
                    let v = items[*index].clone();
                    *index += 1;
                    Ok(Some(v))
                } else {
                    Ok(None)
                }
            }
            Cursor::Seq { obj, index } => {
                let payload = obj.payload.borrow();
                let item = match &*payload {
                    Payload::List(items) => items.get(*index).cloned(),
                    Payload::Dict(pairs) => pairs.get(*index).map(|(k, _)| k.clone()),
                    _ => None,
                };
                if item.is_some() {
                    *index += 1;
                }
                Ok(item)
            }
            Cursor::Host { obj } => self.iter_next(obj, loc),
        }
    }

    /// Advances an iterator object. Fires the iterator-advance hook for
    /// instrumented iterators on every yielded item.
    pub fn iter_next(
        &self,
        iter_obj: &Rc<Obj>,
        loc: &SourceLocation,
    ) -> Result<Option<Value>, VmError> {
        let (item, hints) = {
            let mut payload = iter_obj.payload.borrow_mut();
            let Payload::Iter(state) = &mut *payload else {
                return Err(VmError::new(VmErrorKind::Type, "not an iterator").at(loc.clone()));
            };
            let item = match &state.source {
                Value::Str(s) => s
                    .chars()
                    .nth(state.index)
                    .map(|c| Value::str(c.to_string())),
                Value::Obj(source) => {
                    let source_payload = source.payload.borrow();
                    match &*source_payload {
                        Payload::List(items) => items.get(state.index).cloned(),
                        Payload::Dict(pairs) => pairs.get(state.index).map(|(k, _)| k.clone()),
                        _ => {
                            return Err(VmError::new(
                                VmErrorKind::Type,
                                "iterator source is not iterable",
                            )
                            .at(loc.clone()));
                        }
                    }
                }
                _ => None,
            };
            if item.is_some() {
                state.index += 1;
            }
            (item, state.hints.clone())
        };

        if let Some(item) = &item {
            if self.shim.active() {
                let iter_value = Value::Obj(iter_obj.clone());
                let fire_loc = hints.as_ref().unwrap_or(loc);
                self.shim.fire(
                    Hook::IterNext,
                    "iterator",
                    "__next__",
                    Some(&iter_value),
                    &[],
                    &[],
                    Some(item),
                    fire_loc,
                );
            }
        }
        Ok(item)
    }

    /// Validates that a value can be iterated without consuming it.
    pub fn check_iterable(&self, value: &Value, loc: &SourceLocation) -> Result<(), VmError> {
        self.open_cursor(value, loc).map(|_| ())
    }

    /// Collects the items of any iterable into a vector.
    pub fn collect_items(&self, value: &Value, loc: &SourceLocation) -> Result<Vec<Value>, VmError> {
        let mut cursor = self.open_cursor(value, loc)?;
        let mut out = Vec::new();
        while let Some(item) = self.cursor_next(&mut cursor, loc)? {
            out.push(item);
        }
        Ok(out)
    }

    // === shim entry points ===

    fn shim_call(
        &self,
        f: &ShimFn,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        env: &EnvRef,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        match f {
            ShimFn::List => {
                let items = match args.first() {
                    Some(v) => self.collect_items(v, loc)?,
                    None => Vec::new(),
                };
                Ok(self.shim_make_list(items, loc))
            }
            ShimFn::Dict => self.shim_make_dict(args.first(), &kwargs, loc),
            ShimFn::Sorted => {
                if let Some((name, _)) = kwargs.first() {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        format!("sorted() got an unexpected keyword argument `{}`", name),
                    )
                    .at(loc.clone()));
                }
                let Some(first) = args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "sorted() needs an argument")
                        .at(loc.clone()));
                };
                let items = self.collect_items(first, loc)?;
                let sorted = self.sort_values(items, loc)?;
                Ok(self.shim_make_list(sorted, loc))
            }
            ShimFn::Iter => {
                let Some(source) = args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "iter() needs an argument")
                        .at(loc.clone()));
                };
                // Validates iterability up front, like the plain builtin.
                self.open_cursor(source, loc)?;
                let iter = self.make_iter(source.clone(), Some(loc.clone()));
                if self.shim.active() {
                    self.shim.fire_call(
                        Hook::AfterCall,
                        "builtins",
                        "iter",
                        None,
                        &args,
                        &[],
                        Some(&iter),
                        loc,
                    );
                }
                Ok(iter)
            }
            ShimFn::Type => {
                let Some(v) = args.first() else {
                    return Err(
                        VmError::new(VmErrorKind::Type, "type() needs an argument").at(loc.clone())
                    );
                };
                Ok(self.builtins.type_of(v))
            }
            ShimFn::StrMaketrans => {
                let Some(v) = args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "maketrans() needs an argument")
                        .at(loc.clone()));
                };
                // Re-boxed into a fresh, untracked dict.
                self.dict_from(Some(v), &[], loc)
            }
            ShimFn::Compare(op) => {
                let (l, r) = two_args(&args, "comparison", loc)?;
                if self.shim.active() {
                    self.shim.fire(
                        Hook::Compare,
                        "operator",
                        op.name(),
                        None,
                        &args,
                        &[],
                        None,
                        loc,
                    );
                }
                Ok(Value::Bool(self.compare(*op, l, r, loc)?))
            }
            ShimFn::Binary(op) => {
                let (l, r) = two_args(&args, "operator", loc)?;
                if self.shim.active() {
                    self.shim.fire(
                        Hook::Arith,
                        "operator",
                        op.name(),
                        None,
                        &args,
                        &[],
                        None,
                        loc,
                    );
                }
                self.binary(*op, l, r, loc)
            }
            ShimFn::AugBinary(op) => {
                let (l, r) = two_args(&args, "operator", loc)?;
                if self.shim.active() {
                    self.shim.fire(
                        Hook::Arith,
                        "operator",
                        op.iname(),
                        None,
                        &args,
                        &[],
                        None,
                        loc,
                    );
                }
                self.binary(*op, l, r, loc)
            }
            ShimFn::Strip => {
                let Some(recv) = args.first() else {
                    return Err(
                        VmError::new(VmErrorKind::Type, "strip() needs a receiver").at(loc.clone())
                    );
                };
                if self.shim.active() {
                    self.shim.fire(
                        Hook::StrOp,
                        "str",
                        "strip",
                        Some(recv),
                        &args[1..],
                        &kwargs,
                        None,
                        loc,
                    );
                }
                let Value::Str(s) = recv else {
                    return Err(VmError::new(
                        VmErrorKind::Attribute,
                        format!("{} has no attribute `strip`", recv.type_name()),
                    )
                    .at(loc.clone()));
                };
                strip_str(s, args.get(1), loc)
            }
            ShimFn::LoopStart(key) => {
                let Some(iterable) = args.into_iter().next() else {
                    return Err(VmError::new(VmErrorKind::Type, "loop tracker needs an iterable")
                        .at(loc.clone()));
                };
                if self.shim.active() {
                    self.shim.fire(
                        Hook::ForLoopStart,
                        "loop",
                        "start",
                        Some(&iterable),
                        &[],
                        &[],
                        None,
                        loc,
                    );
                }
                // Block-scoped stash: the iterable is parked in a hidden
                // local so the paired loop-end can report it.
                env.define(&loop_slot(*key), iterable.clone());
                Ok(iterable)
            }
            ShimFn::LoopEnd(key) => {
                if let Some(iterable) = env.lookup(&loop_slot(*key)) {
                    if self.shim.active() {
                        self.shim.fire(
                            Hook::ForLoopEnd,
                            "loop",
                            "end",
                            Some(&iterable),
                            &[],
                            &[],
                            None,
                            loc,
                        );
                    }
                }
                Ok(Value::None)
            }
        }
    }

    /// Builds an instrumented dict and fires its construction event.
    pub fn shim_make_dict(
        &self,
        arg: Option<&Value>,
        kwargs: &[(String, Value)],
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let value = self.dict_from(arg, kwargs, loc)?;
        if self.shim.active() {
            self.shim.fire_call(
                Hook::AfterCall,
                "dict",
                "__init__",
                None,
                &[],
                &[],
                Some(&value),
                loc,
            );
        }
        Ok(value)
    }

    /// Builds an instrumented list and fires its construction event.
    pub fn shim_make_list(&self, items: Vec<Value>, loc: &SourceLocation) -> Value {
        let value = Value::list(items);
        if self.shim.active() {
            self.shim.fire_call(
                Hook::AfterCall,
                "list",
                "__init__",
                None,
                &[],
                &[],
                Some(&value),
                loc,
            );
        }
        value
    }

    pub fn sort_values(
        &self,
        mut items: Vec<Value>,
        loc: &SourceLocation,
    ) -> Result<Vec<Value>, VmError> {
        // Insertion sort so host comparison errors propagate cleanly.
        for i in 1..items.len() {
            let mut j = i;
            while j > 0 {
                let earlier_is_greater = {
                    let o = self.ordering_of(&items[j - 1], &items[j], loc)?;
                    o == std::cmp::Ordering::Greater
                };
                if !earlier_is_greater {
                    break;
                }
                items.swap(j - 1, j);
                j -= 1;
            }
        }
        Ok(items)
    }
}

fn two_args<'a>(
    args: &'a [Value],
    what: &str,
    loc: &SourceLocation,
) -> Result<(&'a Value, &'a Value), VmError> {
    match args {
        [l, r] => Ok((l, r)),
        _ => Err(VmError::new(
            VmErrorKind::Type,
            format!("{} tracker expects two operands", what),
        )
        .at(loc.clone())),
    }
}

pub(crate) fn strip_str(
    s: &Rc<str>,
    chars: Option<&Value>,
    loc: &SourceLocation,
) -> Result<Value, VmError> {
    match chars {
        None => Ok(Value::str(s.trim())),
        Some(Value::Str(set)) => {
            let set: Vec<char> = set.chars().collect();
            Ok(Value::str(s.trim_matches(|c| set.contains(&c))))
        }
        Some(other) => Err(VmError::new(
            VmErrorKind::Type,
            format!("strip() argument must be a string, not {}", other.type_name()),
        )
        .at(loc.clone())),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    if (0..len).contains(&idx) {
        Some(idx as usize)
    } else {
        None
    }
}

fn loop_slot(key: u32) -> String {
    format!("__vigil_loop_{}__", key)
}

fn receiver_of(callee: &Value) -> Option<Value> {
    let obj = callee.obj()?;
    let payload = obj.payload.borrow();
    match &*payload {
        Payload::BoundMethod(m) => Some(m.recv.clone()),
        _ => None,
    }
}

/// Binds a function or native to a receiver for method-call dispatch.
pub fn bind_method(recv: &Value, func: Value, name: &str, owner: &str) -> Value {
    Value::Obj(Obj::new(Payload::BoundMethod(BoundMethod {
        recv: recv.clone(),
        func,
        name: Rc::from(name),
        owner: Rc::from(owner),
    })))
}
