//! The builtin scope: global functions, type anchors, and the method
//! tables for native payloads.
//!
//! Builtin type names (`list`, `dict`, `str`, ...) resolve to singleton
//! class anchors. `type(x)` returns the anchor for builtin payloads, so
//! `type(xs) == list` holds whether or not `xs` was built through the
//! instrumented constructors; instrumentation never leaks into type
//! identity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::interp::{strip_str, VmError, VmErrorKind};
use crate::value::{
    dict_get, dict_remove, dict_set, eq_values, ClassData, EnvRef, NativeCall, NativeClass,
    NativeFn, Obj, Payload, Scope, Value,
};

pub struct Builtins {
    pub scope: EnvRef,
    pub list_class: Value,
    pub dict_class: Value,
    pub str_class: Value,
    pub int_class: Value,
    pub float_class: Value,
    pub object_class: Value,
    /// Lazily synthesized anchors for types without a builtin class name.
    anchors: RefCell<HashMap<String, Value>>,
}

fn native_class(name: &str, tag: NativeClass) -> Value {
    Value::Obj(Obj::new(Payload::Class(ClassData {
        name: Rc::from(name),
        base: None,
        attrs: RefCell::new(HashMap::new()),
        doc: None,
        native: Some(tag),
    })))
}

impl Builtins {
    pub fn new() -> Builtins {
        let scope = Scope::root();
        let list_class = native_class("list", NativeClass::List);
        let dict_class = native_class("dict", NativeClass::Dict);
        let str_class = native_class("str", NativeClass::Str);
        let int_class = native_class("int", NativeClass::Int);
        let float_class = native_class("float", NativeClass::Float);
        let object_class = native_class("object", NativeClass::Object);

        // `str.maketrans` lives on the class, not on instances.
        if let Payload::Class(c) = &*str_class.obj().expect("class is heap").payload.borrow() {
            c.attrs.borrow_mut().insert(
                "maketrans".to_string(),
                Value::native(NativeFn::new("str", "maketrans", |interp, call| {
                    let Some(mapping) = call.args.first() else {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "maketrans() needs an argument",
                        )
                        .at(call.loc.clone()));
                    };
                    let items = match mapping.obj().map(|o| o.payload.borrow()) {
                        Some(p) => match &*p {
                            Payload::Dict(pairs) => pairs.clone(),
                            _ => {
                                return Err(VmError::new(
                                    VmErrorKind::Type,
                                    "maketrans() argument must be a dict",
                                )
                                .at(call.loc.clone()));
                            }
                        },
                        None => {
                            return Err(VmError::new(
                                VmErrorKind::Type,
                                "maketrans() argument must be a dict",
                            )
                            .at(call.loc.clone()));
                        }
                    };
                    let _ = interp;
                    Ok(Value::dict(items))
                })),
            );
        }

        scope.define("list", list_class.clone());
        scope.define("dict", dict_class.clone());
        scope.define("str", str_class.clone());
        scope.define("int", int_class.clone());
        scope.define("float", float_class.clone());
        scope.define("object", object_class.clone());

        scope.define(
            "print",
            Value::native(NativeFn::new("builtins", "print", |_interp, call| {
                let parts: Vec<String> = call.args.iter().map(Value::display).collect();
                println!("{}", parts.join(" "));
                Ok(Value::None)
            })),
        );
        scope.define(
            "len",
            Value::native(NativeFn::new("builtins", "len", |_interp, call| {
                let Some(v) = call.args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "len() needs an argument")
                        .at(call.loc.clone()));
                };
                let n = match v {
                    Value::Str(s) => s.chars().count(),
                    Value::Obj(o) => match &*o.payload.borrow() {
                        Payload::List(items) => items.len(),
                        Payload::Dict(pairs) => pairs.len(),
                        _ => {
                            return Err(VmError::new(
                                VmErrorKind::Type,
                                format!("{} has no length", v.type_name()),
                            )
                            .at(call.loc.clone()));
                        }
                    },
                    _ => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            format!("{} has no length", v.type_name()),
                        )
                        .at(call.loc.clone()));
                    }
                };
                Ok(Value::Int(n as i64))
            })),
        );
        scope.define(
            "range",
            Value::native(NativeFn::new("builtins", "range", |_interp, call| {
                let int_arg = |i: usize| -> Result<i64, VmError> {
                    match call.args.get(i) {
                        Some(Value::Int(v)) => Ok(*v),
                        _ => Err(VmError::new(
                            VmErrorKind::Type,
                            "range() arguments must be integers",
                        )
                        .at(call.loc.clone())),
                    }
                };
                let (start, stop, step) = match call.args.len() {
                    1 => (0, int_arg(0)?, 1),
                    2 => (int_arg(0)?, int_arg(1)?, 1),
                    3 => (int_arg(0)?, int_arg(1)?, int_arg(2)?),
                    n => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            format!("range() takes 1 to 3 arguments, got {}", n),
                        )
                        .at(call.loc.clone()));
                    }
                };
                if step == 0 {
                    return Err(VmError::new(VmErrorKind::Value, "range() step must not be zero")
                        .at(call.loc.clone()));
                }
                let mut items = Vec::new();
                let mut v = start;
                while (step > 0 && v < stop) || (step < 0 && v > stop) {
                    items.push(Value::Int(v));
                    v += step;
                }
                Ok(Value::list(items))
            })),
        );
        scope.define(
            "iter",
            Value::native(NativeFn::new("builtins", "iter", |interp, call| {
                let Some(source) = call.args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "iter() needs an argument")
                        .at(call.loc.clone()));
                };
                interp.check_iterable(source, call.loc)?;
                Ok(interp.make_iter(source.clone(), None))
            })),
        );
        scope.define(
            "next",
            Value::native(NativeFn::new("builtins", "next", |interp, call| {
                let Some(Value::Obj(obj)) = call.args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "next() needs an iterator")
                        .at(call.loc.clone()));
                };
                match interp.iter_next(obj, call.loc)? {
                    Some(item) => Ok(item),
                    None => match call.args.get(1) {
                        Some(default) => Ok(default.clone()),
                        None => Err(VmError::new(VmErrorKind::StopIteration, "iterator exhausted")
                            .at(call.loc.clone())),
                    },
                }
            })),
        );
        scope.define(
            "sorted",
            Value::native(NativeFn::new("builtins", "sorted", |interp, call| {
                let Some(source) = call.args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "sorted() needs an argument")
                        .at(call.loc.clone()));
                };
                let items = interp.collect_items(source, call.loc)?;
                Ok(Value::list(interp.sort_values(items, call.loc)?))
            })),
        );
        scope.define(
            "type",
            Value::native(NativeFn::new("builtins", "type", |interp, call| {
                let Some(v) = call.args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "type() needs an argument")
                        .at(call.loc.clone()));
                };
                Ok(interp.builtins.type_of(v))
            })),
        );
        scope.define(
            "repr",
            Value::native(NativeFn::new("builtins", "repr", |_interp, call| {
                let Some(v) = call.args.first() else {
                    return Err(VmError::new(VmErrorKind::Type, "repr() needs an argument")
                        .at(call.loc.clone()));
                };
                Ok(Value::str(v.repr()))
            })),
        );

        Builtins {
            scope,
            list_class,
            dict_class,
            str_class,
            int_class,
            float_class,
            object_class,
            anchors: RefCell::new(HashMap::new()),
        }
    }

    /// The class anchor for a value's type.
    pub fn type_of(&self, value: &Value) -> Value {
        match value {
            Value::Str(_) => self.str_class.clone(),
            Value::Int(_) => self.int_class.clone(),
            Value::Float(_) => self.float_class.clone(),
            Value::Obj(o) => match &*o.payload.borrow() {
                Payload::List(_) => self.list_class.clone(),
                Payload::Dict(_) => self.dict_class.clone(),
                Payload::Instance(inst) => inst.class.clone(),
                Payload::Class(_) => self.anchor("type"),
                _ => self.anchor(&value.type_name()),
            },
            _ => self.anchor(&value.type_name()),
        }
    }

    fn anchor(&self, name: &str) -> Value {
        if let Some(v) = self.anchors.borrow().get(name) {
            return v.clone();
        }
        let class = Value::Obj(Obj::new(Payload::Class(ClassData {
            name: Rc::from(name),
            base: None,
            attrs: RefCell::new(HashMap::new()),
            doc: None,
            native: None,
        })));
        self.anchors
            .borrow_mut()
            .insert(name.to_string(), class.clone());
        class
    }

    // === method tables ===

    pub fn list_method(&self, name: &str) -> Option<NativeFn> {
        let f = match name {
            "append" => NativeFn::new("list", "append", |_i, call| {
                let item = one_arg(call, "append")?;
                with_list_mut(call, |items| {
                    items.push(item.clone());
                    Ok(Value::None)
                })
            }),
            "extend" => NativeFn::new("list", "extend", |interp, call| {
                let arg = one_arg(call, "extend")?;
                let new_items = interp.collect_items(&arg, call.loc)?;
                with_list_mut(call, |items| {
                    items.extend(new_items.iter().cloned());
                    Ok(Value::None)
                })
            }),
            "insert" => NativeFn::new("list", "insert", |_i, call| {
                let (Some(Value::Int(index)), Some(item)) = (call.args.first(), call.args.get(1))
                else {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        "insert() takes an index and a value",
                    )
                    .at(call.loc.clone()));
                };
                let item = item.clone();
                let index = *index;
                with_list_mut(call, |items| {
                    let at = index.clamp(0, items.len() as i64) as usize;
                    items.insert(at, item.clone());
                    Ok(Value::None)
                })
            }),
            "pop" => NativeFn::new("list", "pop", |_i, call| {
                let index = match call.args.first() {
                    Some(Value::Int(i)) => Some(*i),
                    None => None,
                    _ => {
                        return Err(VmError::new(VmErrorKind::Type, "pop() index must be an integer")
                            .at(call.loc.clone()));
                    }
                };
                with_list_mut(call, |items| {
                    if items.is_empty() {
                        return Err(VmError::new(VmErrorKind::Index, "pop from empty list")
                            .at(call.loc.clone()));
                    }
                    let at = match index {
                        Some(i) => {
                            let len = items.len() as i64;
                            let i = if i < 0 { i + len } else { i };
                            if !(0..len).contains(&i) {
                                return Err(VmError::new(
                                    VmErrorKind::Index,
                                    "pop index out of range",
                                )
                                .at(call.loc.clone()));
                            }
                            i as usize
                        }
                        None => items.len() - 1,
                    };
                    Ok(items.remove(at))
                })
            }),
            "remove" => NativeFn::new("list", "remove", |_i, call| {
                let item = one_arg(call, "remove")?;
                with_list_mut(call, |items| {
                    match items.iter().position(|v| eq_values(v, &item)) {
                        Some(at) => {
                            items.remove(at);
                            Ok(Value::None)
                        }
                        None => Err(VmError::new(VmErrorKind::Value, "value not in list")
                            .at(call.loc.clone())),
                    }
                })
            }),
            "clear" => NativeFn::new("list", "clear", |_i, call| {
                with_list_mut(call, |items| {
                    items.clear();
                    Ok(Value::None)
                })
            }),
            "sort" => NativeFn::new("list", "sort", |interp, call| {
                let snapshot = with_list_mut(call, |items| Ok(items.clone()))?;
                let sorted = interp.sort_values(snapshot, call.loc)?;
                with_list_mut(call, |items| {
                    *items = sorted.clone();
                    Ok(Value::None)
                })
            }),
            "index" => NativeFn::new("list", "index", |_i, call| {
                let item = one_arg(call, "index")?;
                with_list_mut(call, |items| {
                    match items.iter().position(|v| eq_values(v, &item)) {
                        Some(at) => Ok(Value::Int(at as i64)),
                        None => Err(VmError::new(VmErrorKind::Value, "value not in list")
                            .at(call.loc.clone())),
                    }
                })
            }),
            "count" => NativeFn::new("list", "count", |_i, call| {
                let item = one_arg(call, "count")?;
                with_list_mut(call, |items| {
                    Ok(Value::Int(
                        items.iter().filter(|v| eq_values(v, &item)).count() as i64,
                    ))
                })
            }),
            "reverse" => NativeFn::new("list", "reverse", |_i, call| {
                with_list_mut(call, |items| {
                    items.reverse();
                    Ok(Value::None)
                })
            }),
            _ => return None,
        };
        Some(f)
    }

    pub fn dict_method(&self, name: &str) -> Option<NativeFn> {
        let f = match name {
            "get" => NativeFn::new("dict", "get", |_i, call| {
                let key = one_arg(call, "get")?;
                let default = call.args.get(1).cloned().unwrap_or(Value::None);
                with_dict_mut(call, |pairs| Ok(dict_get(pairs, &key).unwrap_or(default.clone())))
            }),
            "keys" => NativeFn::new("dict", "keys", |_i, call| {
                with_dict_mut(call, |pairs| {
                    Ok(Value::list(pairs.iter().map(|(k, _)| k.clone()).collect()))
                })
            }),
            "values" => NativeFn::new("dict", "values", |_i, call| {
                with_dict_mut(call, |pairs| {
                    Ok(Value::list(pairs.iter().map(|(_, v)| v.clone()).collect()))
                })
            }),
            "items" => NativeFn::new("dict", "items", |_i, call| {
                with_dict_mut(call, |pairs| {
                    Ok(Value::list(
                        pairs
                            .iter()
                            .map(|(k, v)| Value::list(vec![k.clone(), v.clone()]))
                            .collect(),
                    ))
                })
            }),
            "update" => NativeFn::new("dict", "update", |_i, call| {
                let other = one_arg(call, "update")?;
                let entries = match other.obj().map(|o| o.payload.borrow()) {
                    Some(p) => match &*p {
                        Payload::Dict(pairs) => pairs.clone(),
                        _ => {
                            return Err(VmError::new(
                                VmErrorKind::Type,
                                "update() argument must be a dict",
                            )
                            .at(call.loc.clone()));
                        }
                    },
                    None => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "update() argument must be a dict",
                        )
                        .at(call.loc.clone()));
                    }
                };
                with_dict_mut(call, |pairs| {
                    for (k, v) in &entries {
                        dict_set(pairs, k.clone(), v.clone());
                    }
                    Ok(Value::None)
                })
            }),
            "pop" => NativeFn::new("dict", "pop", |_i, call| {
                let key = one_arg(call, "pop")?;
                let default = call.args.get(1).cloned();
                with_dict_mut(call, |pairs| match dict_remove(pairs, &key) {
                    Some(v) => Ok(v),
                    None => match &default {
                        Some(d) => Ok(d.clone()),
                        None => Err(VmError::new(
                            VmErrorKind::Key,
                            format!("key {} not found", key.repr()),
                        )
                        .at(call.loc.clone())),
                    },
                })
            }),
            "setdefault" => NativeFn::new("dict", "setdefault", |_i, call| {
                let key = one_arg(call, "setdefault")?;
                let default = call.args.get(1).cloned().unwrap_or(Value::None);
                with_dict_mut(call, |pairs| match dict_get(pairs, &key) {
                    Some(v) => Ok(v),
                    None => {
                        dict_set(pairs, key.clone(), default.clone());
                        Ok(default.clone())
                    }
                })
            }),
            "clear" => NativeFn::new("dict", "clear", |_i, call| {
                with_dict_mut(call, |pairs| {
                    pairs.clear();
                    Ok(Value::None)
                })
            }),
            _ => return None,
        };
        Some(f)
    }

    pub fn str_method(&self, name: &str) -> Option<NativeFn> {
        let f = match name {
            "strip" => NativeFn::new("str", "strip", |_i, call| {
                let s = recv_str(call)?;
                strip_str(&s, call.args.first(), call.loc)
            }),
            "split" => NativeFn::new("str", "split", |_i, call| {
                let s = recv_str(call)?;
                let parts: Vec<Value> = match call.args.first() {
                    None => s.split_whitespace().map(Value::str).collect(),
                    Some(Value::Str(sep)) => s.split(&**sep).map(Value::str).collect(),
                    Some(other) => {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            format!("split() separator must be a string, not {}", other.type_name()),
                        )
                        .at(call.loc.clone()));
                    }
                };
                Ok(Value::list(parts))
            }),
            "upper" => NativeFn::new("str", "upper", |_i, call| {
                Ok(Value::str(recv_str(call)?.to_uppercase()))
            }),
            "lower" => NativeFn::new("str", "lower", |_i, call| {
                Ok(Value::str(recv_str(call)?.to_lowercase()))
            }),
            "replace" => NativeFn::new("str", "replace", |_i, call| {
                let s = recv_str(call)?;
                match (call.args.first(), call.args.get(1)) {
                    (Some(Value::Str(from)), Some(Value::Str(to))) => {
                        Ok(Value::str(s.replace(&**from, to)))
                    }
                    _ => Err(VmError::new(VmErrorKind::Type, "replace() takes two strings")
                        .at(call.loc.clone())),
                }
            }),
            "startswith" => NativeFn::new("str", "startswith", |_i, call| {
                let s = recv_str(call)?;
                match call.args.first() {
                    Some(Value::Str(prefix)) => Ok(Value::Bool(s.starts_with(&**prefix))),
                    _ => Err(VmError::new(VmErrorKind::Type, "startswith() takes a string")
                        .at(call.loc.clone())),
                }
            }),
            "endswith" => NativeFn::new("str", "endswith", |_i, call| {
                let s = recv_str(call)?;
                match call.args.first() {
                    Some(Value::Str(suffix)) => Ok(Value::Bool(s.ends_with(&**suffix))),
                    _ => Err(VmError::new(VmErrorKind::Type, "endswith() takes a string")
                        .at(call.loc.clone())),
                }
            }),
            "join" => NativeFn::new("str", "join", |interp, call| {
                let sep = recv_str(call)?;
                let arg = one_arg(call, "join")?;
                let items = interp.collect_items(&arg, call.loc)?;
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Str(s) => parts.push(s.to_string()),
                        other => {
                            return Err(VmError::new(
                                VmErrorKind::Type,
                                format!("join() items must be strings, not {}", other.type_name()),
                            )
                            .at(call.loc.clone()));
                        }
                    }
                }
                Ok(Value::str(parts.join(&sep)))
            }),
            "find" => NativeFn::new("str", "find", |_i, call| {
                let s = recv_str(call)?;
                match call.args.first() {
                    Some(Value::Str(needle)) => Ok(Value::Int(
                        s.find(&**needle).map(|i| i as i64).unwrap_or(-1),
                    )),
                    _ => Err(VmError::new(VmErrorKind::Type, "find() takes a string")
                        .at(call.loc.clone())),
                }
            }),
            _ => return None,
        };
        Some(f)
    }

    pub fn file_method(&self, name: &str) -> Option<NativeFn> {
        crate::stdlib::file_method(name)
    }

    pub fn socket_method(&self, name: &str) -> Option<NativeFn> {
        crate::stdlib::socket_method(name)
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::new()
    }
}

fn one_arg(call: &NativeCall<'_>, what: &str) -> Result<Value, VmError> {
    call.args.first().cloned().ok_or_else(|| {
        VmError::new(VmErrorKind::Type, format!("{}() needs an argument", what))
            .at(call.loc.clone())
    })
}

fn recv_str(call: &NativeCall<'_>) -> Result<Rc<str>, VmError> {
    match &call.recv {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(
            VmError::new(VmErrorKind::Type, "string method called on a non-string")
                .at(call.loc.clone()),
        ),
    }
}

fn with_list_mut<T>(
    call: &NativeCall<'_>,
    f: impl FnOnce(&mut Vec<Value>) -> Result<T, VmError>,
) -> Result<T, VmError> {
    let Some(Value::Obj(obj)) = &call.recv else {
        return Err(VmError::new(VmErrorKind::Type, "list method called on a non-list")
            .at(call.loc.clone()));
    };
    let mut payload = obj.payload.borrow_mut();
    match &mut *payload {
        Payload::List(items) => f(items),
        _ => Err(VmError::new(VmErrorKind::Type, "list method called on a non-list")
            .at(call.loc.clone())),
    }
}

fn with_dict_mut<T>(
    call: &NativeCall<'_>,
    f: impl FnOnce(&mut Vec<(Value, Value)>) -> Result<T, VmError>,
) -> Result<T, VmError> {
    let Some(Value::Obj(obj)) = &call.recv else {
        return Err(VmError::new(VmErrorKind::Type, "dict method called on a non-dict")
            .at(call.loc.clone()));
    };
    let mut payload = obj.payload.borrow_mut();
    match &mut *payload {
        Payload::Dict(pairs) => f(pairs),
        _ => Err(VmError::new(VmErrorKind::Type, "dict method called on a non-dict")
            .at(call.loc.clone())),
    }
}
