//! Runtime values and scopes.
//!
//! Immutable kinds (`none`, booleans, numbers, strings) are copied by
//! value; everything else lives on the heap behind `Rc<Obj>` and has
//! identity. Monitor operands are captured from values with
//! [`Value::to_operand`], which takes weak references to heap objects so
//! bindings never extend a monitored object's lifetime.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use vigil_core::{ObjRef, Operand, SourceLocation};

use crate::ast::FuncDef;
use crate::interp::{Interp, VmError};

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Obj(Rc<Obj>),
}

pub struct Obj {
    pub payload: RefCell<Payload>,
}

impl Obj {
    pub fn new(payload: Payload) -> Rc<Obj> {
        Rc::new(Obj {
            payload: RefCell::new(payload),
        })
    }
}

pub enum Payload {
    List(Vec<Value>),
    /// Insertion-ordered; keys compared with [`eq_values`].
    Dict(Vec<(Value, Value)>),
    Iter(IterState),
    File(FileState),
    Socket(SocketState),
    Func(FuncData),
    Class(ClassData),
    Instance(InstanceData),
    BoundMethod(BoundMethod),
    Native(NativeFn),
    Module(ModuleData),
    /// Engine-side state attached to host objects (e.g. a specification
    /// under construction).
    Opaque(OpaqueData),
}

pub struct IterState {
    pub source: Value,
    pub index: usize,
    /// Rewrite hints carried by instrumented iterators.
    pub hints: Option<SourceLocation>,
}

pub struct FileState {
    pub path: PathBuf,
    pub mode: String,
    /// Read contents or pending written data; writes reach disk on close.
    pub data: String,
    pub read_pos: usize,
    pub closed: bool,
}

#[derive(Default)]
pub struct SocketState {
    pub timeout: Option<f64>,
    pub peer: Option<(String, i64)>,
    pub closed: bool,
}

#[derive(Clone)]
pub struct FuncData {
    pub def: Rc<FuncDef>,
    /// The defining environment (closure).
    pub env: EnvRef,
    /// The defining module's name, used in callable descriptors.
    pub module: Rc<str>,
    /// The defining file, threaded back in when the body executes.
    pub file: Arc<str>,
    /// Parameter defaults, evaluated at definition time.
    pub defaults: Vec<Option<Value>>,
}

/// Tags for classes with native construction behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeClass {
    List,
    Dict,
    Str,
    Int,
    Float,
    Object,
}

pub struct ClassData {
    pub name: Rc<str>,
    pub base: Option<Value>,
    pub attrs: RefCell<HashMap<String, Value>>,
    pub doc: Option<String>,
    pub native: Option<NativeClass>,
}

pub struct InstanceData {
    pub class: Value,
    pub attrs: RefCell<HashMap<String, Value>>,
}

pub struct BoundMethod {
    pub recv: Value,
    pub func: Value,
    /// The method name and the receiver type, for callable descriptors.
    pub name: Rc<str>,
    pub owner: Rc<str>,
}

pub type NativeImpl = dyn Fn(&Interp, &NativeCall<'_>) -> Result<Value, VmError>;

pub struct NativeCall<'a> {
    pub recv: Option<Value>,
    pub args: &'a [Value],
    pub kwargs: &'a [(String, Value)],
    pub loc: &'a SourceLocation,
}

impl NativeCall<'_> {
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

#[derive(Clone)]
pub struct NativeFn {
    pub name: Rc<str>,
    /// Owning module or type name, e.g. `builtins` or `list`.
    pub owner: Rc<str>,
    pub f: Rc<NativeImpl>,
}

impl NativeFn {
    pub fn new(
        owner: &str,
        name: &str,
        f: impl Fn(&Interp, &NativeCall<'_>) -> Result<Value, VmError> + 'static,
    ) -> NativeFn {
        NativeFn {
            name: Rc::from(name),
            owner: Rc::from(owner),
            f: Rc::new(f),
        }
    }
}

pub struct ModuleData {
    pub name: Rc<str>,
    pub file: Option<Arc<str>>,
    pub globals: EnvRef,
    pub native: bool,
}

pub struct OpaqueData {
    pub type_name: Rc<str>,
    pub data: Rc<dyn Any>,
}

// === scopes ===

pub type EnvRef = Rc<Scope>;

pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<EnvRef>,
}

impl Scope {
    pub fn root() -> EnvRef {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &EnvRef) -> EnvRef {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref()?.lookup(name)
    }

    /// Binds in this scope, shadowing outer bindings.
    pub fn define(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    pub fn names(&self) -> Vec<String> {
        self.vars.borrow().keys().cloned().collect()
    }
}

// === value behavior ===

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::Obj(Obj::new(Payload::List(items)))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
        Value::Obj(Obj::new(Payload::Dict(pairs)))
    }

    pub fn native(f: NativeFn) -> Value {
        Value::Obj(Obj::new(Payload::Native(f)))
    }

    pub fn obj(&self) -> Option<&Rc<Obj>> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "none".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::Obj(o) => match &*o.payload.borrow() {
                Payload::List(_) => "list".into(),
                Payload::Dict(_) => "dict".into(),
                Payload::Iter(_) => "iterator".into(),
                Payload::File(_) => "File".into(),
                Payload::Socket(_) => "Socket".into(),
                Payload::Func(_) => "function".into(),
                Payload::Class(c) => c.name.to_string(),
                Payload::Instance(i) => i.class.type_name(),
                Payload::BoundMethod(_) => "method".into(),
                Payload::Native(_) => "builtin_function".into(),
                Payload::Module(m) => m.name.to_string(),
                Payload::Opaque(o) => o.type_name.to_string(),
            },
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Obj(o) => match &*o.payload.borrow() {
                Payload::List(items) => !items.is_empty(),
                Payload::Dict(pairs) => !pairs.is_empty(),
                _ => true,
            },
        }
    }

    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Lowers this value into a monitor operand: immutable kinds by value,
    /// heap objects as weak identity references.
    pub fn to_operand(&self) -> Operand {
        match self {
            Value::None => Operand::None,
            Value::Bool(b) => Operand::Bool(*b),
            Value::Int(i) => Operand::Int(*i),
            Value::Float(f) => Operand::Float(*f),
            Value::Str(s) => Operand::Str(Arc::from(&**s)),
            Value::Obj(o) => Operand::Ref(ObjRef::capture(o, self.type_name())),
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::None => "none".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => format!("{:?}", s),
            Value::Obj(o) => match &*o.payload.borrow() {
                Payload::List(items) => {
                    let inner: Vec<String> = items.iter().map(Value::repr).collect();
                    format!("[{}]", inner.join(", "))
                }
                Payload::Dict(pairs) => {
                    let inner: Vec<String> = pairs
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                        .collect();
                    format!("{{{}}}", inner.join(", "))
                }
                Payload::Iter(_) => "<iterator>".into(),
                Payload::File(f) => format!("<File {:?} mode={}>", f.path, f.mode),
                Payload::Socket(_) => "<Socket>".into(),
                Payload::Func(f) => format!("<function {}>", f.def.name),
                Payload::Class(c) => format!("<class {}>", c.name),
                Payload::Instance(i) => {
                    format!("<{} instance at {:p}>", i.class.type_name(), Rc::as_ptr(o))
                }
                Payload::BoundMethod(m) => format!("<method {}.{}>", m.owner, m.name),
                Payload::Native(f) => format!("<builtin {}.{}>", f.owner, f.name),
                Payload::Module(m) => format!("<module {}>", m.name),
                Payload::Opaque(d) => format!("<{}>", d.type_name),
            },
        }
    }

    /// `str()` / `print` rendering: strings unquoted, everything else as
    /// its repr.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Structural equality with host semantics: numbers compare across
/// int/float, containers element-wise, other heap objects by identity.
pub fn eq_values(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            *x as f64 == *y
        }
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (px, py) = (x.payload.borrow(), y.payload.borrow());
            match (&*px, &*py) {
                (Payload::List(xs), Payload::List(ys)) => {
                    xs.len() == ys.len()
                        && xs.iter().zip(ys.iter()).all(|(a, b)| eq_values(a, b))
                }
                (Payload::Dict(xs), Payload::Dict(ys)) => {
                    xs.len() == ys.len()
                        && xs.iter().all(|(k, v)| {
                            ys.iter()
                                .any(|(k2, v2)| eq_values(k, k2) && eq_values(v, v2))
                        })
                }
                _ => false,
            }
        }
        _ => false,
    }
}

/// Looks up `key` in an association list with host key equality.
pub fn dict_get(pairs: &[(Value, Value)], key: &Value) -> Option<Value> {
    pairs
        .iter()
        .find(|(k, _)| eq_values(k, key))
        .map(|(_, v)| v.clone())
}

pub fn dict_set(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    match pairs.iter_mut().find(|(k, _)| eq_values(k, &key)) {
        Some(slot) => slot.1 = value,
        None => pairs.push((key, value)),
    }
}

pub fn dict_remove(pairs: &mut Vec<(Value, Value)>, key: &Value) -> Option<Value> {
    let idx = pairs.iter().position(|(k, _)| eq_values(k, key))?;
    Some(pairs.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_crosses_numeric_kinds() {
        assert!(eq_values(&Value::Int(3), &Value::Float(3.0)));
        assert!(!eq_values(&Value::Int(3), &Value::Str(Rc::from("3"))));
    }

    #[test]
    fn list_equality_is_elementwise() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let c = Value::list(vec![Value::Int(1)]);
        assert!(eq_values(&a, &b));
        assert!(!eq_values(&a, &c));
        assert!(!a.is_identical(&b));
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::list(vec![Value::None]).truthy());
        assert!(!Value::Str(Rc::from("")).truthy());
    }

    #[test]
    fn scope_chain_shadows() {
        let root = Scope::root();
        root.define("x", Value::Int(1));
        let inner = Scope::child(&root);
        assert!(matches!(inner.lookup("x"), Some(Value::Int(1))));
        inner.define("x", Value::Int(2));
        assert!(matches!(inner.lookup("x"), Some(Value::Int(2))));
        assert!(matches!(root.lookup("x"), Some(Value::Int(1))));
    }

    #[test]
    fn dict_helpers_use_value_keys() {
        let mut pairs = Vec::new();
        dict_set(&mut pairs, Value::str("a"), Value::Int(1));
        dict_set(&mut pairs, Value::str("a"), Value::Int(2));
        assert_eq!(pairs.len(), 1);
        assert!(matches!(
            dict_get(&pairs, &Value::str("a")),
            Some(Value::Int(2))
        ));
        assert!(dict_remove(&mut pairs, &Value::str("a")).is_some());
        assert!(pairs.is_empty());
    }
}
