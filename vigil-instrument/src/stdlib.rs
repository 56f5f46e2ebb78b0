//! Native standard-library modules.
//!
//! These are implemented in Rust and are never instrumented; under the
//! `builtin` strategy their entry points still produce call events
//! through native dispatch. Relative file paths resolve against the
//! entry script's directory.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::CmpOp;
use crate::interp::{Interp, VmError, VmErrorKind};
use crate::value::{
    ClassData, FileState, InstanceData, ModuleData, NativeCall, NativeFn, Obj, Payload, Scope,
    SocketState, Value,
};

/// Builds a native module by name.
pub fn native_module(name: &str) -> Option<Value> {
    let globals = Scope::root();
    match name {
        "io" => {
            globals.define(
                "open",
                Value::native(NativeFn::new("io", "open", |interp, call| {
                    io_open(interp, call)
                })),
            );
        }
        "socket" => {
            globals.define(
                "socket",
                Value::native(NativeFn::new("socket", "socket", |_interp, call| {
                    let _ = call;
                    Ok(Value::Obj(Obj::new(Payload::Socket(SocketState::default()))))
                })),
            );
        }
        "heapq" => {
            globals.define(
                "heappush",
                Value::native(NativeFn::new("heapq", "heappush", |interp, call| {
                    let (Some(heap), Some(item)) = (call.args.first(), call.args.get(1)) else {
                        return Err(VmError::new(
                            VmErrorKind::Type,
                            "heappush() takes a heap and an item",
                        )
                        .at(call.loc.clone()));
                    };
                    heap_push(interp, heap, item.clone(), call)?;
                    Ok(Value::None)
                })),
            );
            globals.define(
                "heappop",
                Value::native(NativeFn::new("heapq", "heappop", |interp, call| {
                    let Some(heap) = call.args.first() else {
                        return Err(VmError::new(VmErrorKind::Type, "heappop() takes a heap")
                            .at(call.loc.clone()));
                    };
                    heap_pop(interp, heap, call)
                })),
            );
        }
        "queue" => {
            globals.define("PriorityQueue", priority_queue_class());
        }
        _ => return None,
    }
    Some(Value::Obj(Obj::new(Payload::Module(ModuleData {
        name: Rc::from(name),
        file: None,
        globals,
        native: true,
    }))))
}

/// Names the loader treats as native.
pub fn is_native_module(name: &str) -> bool {
    matches!(name, "io" | "socket" | "heapq" | "queue")
}

fn io_open(interp: &Interp, call: &NativeCall<'_>) -> Result<Value, VmError> {
    let Some(Value::Str(path)) = call.args.first() else {
        return Err(
            VmError::new(VmErrorKind::Type, "open() path must be a string").at(call.loc.clone())
        );
    };
    let mode = match (call.args.get(1), call.kwarg("mode")) {
        (Some(Value::Str(m)), _) | (None, Some(Value::Str(m))) => m.to_string(),
        (None, None) => "r".to_string(),
        _ => {
            return Err(
                VmError::new(VmErrorKind::Type, "open() mode must be a string").at(call.loc.clone())
            );
        }
    };
    if !matches!(mode.as_str(), "r" | "w" | "a") {
        return Err(VmError::new(
            VmErrorKind::Value,
            format!("unsupported open() mode {:?}", mode),
        )
        .at(call.loc.clone()));
    }

    let resolved = interp.loader.resolve_path(path);
    let data = match mode.as_str() {
        "r" => std::fs::read_to_string(&resolved).map_err(|e| {
            VmError::new(
                VmErrorKind::Io,
                format!("cannot open {:?}: {}", resolved, e),
            )
            .at(call.loc.clone())
        })?,
        "a" => std::fs::read_to_string(&resolved).unwrap_or_default(),
        _ => String::new(),
    };

    Ok(Value::Obj(Obj::new(Payload::File(FileState {
        path: resolved,
        mode,
        data,
        read_pos: 0,
        closed: false,
    }))))
}

pub fn file_method(name: &str) -> Option<NativeFn> {
    let f = match name {
        "read" => NativeFn::new("File", "read", |_i, call| {
            with_file_mut(call, |state| {
                if state.closed {
                    return Err(VmError::new(VmErrorKind::Value, "I/O operation on closed file")
                        .at(call.loc.clone()));
                }
                let out = state.data[state.read_pos..].to_string();
                state.read_pos = state.data.len();
                Ok(Value::str(out))
            })
        }),
        "write" => NativeFn::new("File", "write", |_i, call| {
            let Some(Value::Str(text)) = call.args.first() else {
                return Err(VmError::new(VmErrorKind::Type, "write() takes a string")
                    .at(call.loc.clone()));
            };
            let text = text.clone();
            with_file_mut(call, |state| {
                if state.closed {
                    return Err(VmError::new(VmErrorKind::Value, "I/O operation on closed file")
                        .at(call.loc.clone()));
                }
                if state.mode == "r" {
                    return Err(VmError::new(VmErrorKind::Io, "file not open for writing")
                        .at(call.loc.clone()));
                }
                state.data.push_str(&text);
                Ok(Value::Int(text.chars().count() as i64))
            })
        }),
        "close" => NativeFn::new("File", "close", |_i, call| {
            with_file_mut(call, |state| {
                if !state.closed && state.mode != "r" {
                    std::fs::write(&state.path, &state.data).map_err(|e| {
                        VmError::new(
                            VmErrorKind::Io,
                            format!("cannot write {:?}: {}", state.path, e),
                        )
                        .at(call.loc.clone())
                    })?;
                }
                state.closed = true;
                Ok(Value::None)
            })
        }),
        _ => return None,
    };
    Some(f)
}

pub fn socket_method(name: &str) -> Option<NativeFn> {
    let f = match name {
        "settimeout" => NativeFn::new("Socket", "settimeout", |_i, call| {
            let timeout = match call.args.first() {
                Some(Value::Int(i)) => *i as f64,
                Some(Value::Float(f)) => *f,
                Some(Value::None) => {
                    return with_socket_mut(call, |state| {
                        state.timeout = None;
                        Ok(Value::None)
                    });
                }
                _ => {
                    return Err(VmError::new(
                        VmErrorKind::Type,
                        "settimeout() takes a number or none",
                    )
                    .at(call.loc.clone()));
                }
            };
            if timeout < 0.0 {
                return Err(
                    VmError::new(VmErrorKind::Value, "timeout value out of range")
                        .at(call.loc.clone()),
                );
            }
            with_socket_mut(call, |state| {
                state.timeout = Some(timeout);
                Ok(Value::None)
            })
        }),
        "gettimeout" => NativeFn::new("Socket", "gettimeout", |_i, call| {
            with_socket_mut(call, |state| {
                Ok(state.timeout.map(Value::Float).unwrap_or(Value::None))
            })
        }),
        "connect" => NativeFn::new("Socket", "connect", |_i, call| {
            let (Some(Value::Str(host)), Some(Value::Int(port))) =
                (call.args.first(), call.args.get(1))
            else {
                return Err(VmError::new(
                    VmErrorKind::Type,
                    "connect() takes a host string and a port",
                )
                .at(call.loc.clone()));
            };
            let peer = (host.to_string(), *port);
            with_socket_mut(call, |state| {
                if state.closed {
                    return Err(VmError::new(VmErrorKind::Value, "socket is closed")
                        .at(call.loc.clone()));
                }
                state.peer = Some(peer.clone());
                Ok(Value::None)
            })
        }),
        "close" => NativeFn::new("Socket", "close", |_i, call| {
            with_socket_mut(call, |state| {
                state.closed = true;
                Ok(Value::None)
            })
        }),
        _ => return None,
    };
    Some(f)
}

// === priority queue ===

fn priority_queue_class() -> Value {
    let attrs: RefCell<HashMap<String, Value>> = RefCell::new(HashMap::new());
    attrs.borrow_mut().insert(
        "put".to_string(),
        Value::native(NativeFn::new("PriorityQueue", "put", |interp, call| {
            let Some(item) = call.args.first() else {
                return Err(
                    VmError::new(VmErrorKind::Type, "put() takes an item").at(call.loc.clone())
                );
            };
            let heap = queue_backing(interp, call)?;
            heap_push(interp, &heap, item.clone(), call)?;
            Ok(Value::None)
        })),
    );
    attrs.borrow_mut().insert(
        "get".to_string(),
        Value::native(NativeFn::new("PriorityQueue", "get", |interp, call| {
            let heap = queue_backing(interp, call)?;
            heap_pop(interp, &heap, call)
        })),
    );
    attrs.borrow_mut().insert(
        "empty".to_string(),
        Value::native(NativeFn::new("PriorityQueue", "empty", |interp, call| {
            let heap = queue_backing(interp, call)?;
            Ok(Value::Bool(!heap.truthy()))
        })),
    );
    Value::Obj(Obj::new(Payload::Class(ClassData {
        name: Rc::from("PriorityQueue"),
        base: None,
        attrs,
        doc: Some("A minimum-first queue backed by a binary heap.".to_string()),
        native: None,
    })))
}

/// The queue's backing list, created on first use.
fn queue_backing(_interp: &Interp, call: &NativeCall<'_>) -> Result<Value, VmError> {
    let Some(Value::Obj(obj)) = &call.recv else {
        return Err(VmError::new(VmErrorKind::Type, "queue method called on a non-queue")
            .at(call.loc.clone()));
    };
    let existing = {
        let payload = obj.payload.borrow();
        let Payload::Instance(InstanceData { attrs, .. }) = &*payload else {
            return Err(VmError::new(VmErrorKind::Type, "queue method called on a non-queue")
                .at(call.loc.clone()));
        };
        let item = attrs.borrow().get("_items").cloned();
        item
    };
    match existing {
        Some(items) => Ok(items),
        None => {
            let items = Value::list(Vec::new());
            let payload = obj.payload.borrow();
            if let Payload::Instance(InstanceData { attrs, .. }) = &*payload {
                attrs
                    .borrow_mut()
                    .insert("_items".to_string(), items.clone());
            }
            Ok(items)
        }
    }
}

// Heap helpers operate on a snapshot: comparisons may run host code, so
// the list's cell must not stay borrowed across them.

fn heap_items(heap: &Value, call: &NativeCall<'_>) -> Result<Vec<Value>, VmError> {
    let Some(obj) = heap.obj() else {
        return Err(VmError::new(VmErrorKind::Type, "heap must be a list").at(call.loc.clone()));
    };
    let payload = obj.payload.borrow();
    match &*payload {
        Payload::List(items) => Ok(items.clone()),
        _ => Err(VmError::new(VmErrorKind::Type, "heap must be a list").at(call.loc.clone())),
    }
}

fn store_heap(heap: &Value, items: Vec<Value>) {
    if let Some(obj) = heap.obj() {
        let mut payload = obj.payload.borrow_mut();
        if let Payload::List(slot) = &mut *payload {
            *slot = items;
        }
    }
}

fn lt(interp: &Interp, a: &Value, b: &Value, call: &NativeCall<'_>) -> Result<bool, VmError> {
    interp.compare(CmpOp::Lt, a, b, call.loc)
}

fn heap_push(
    interp: &Interp,
    heap: &Value,
    item: Value,
    call: &NativeCall<'_>,
) -> Result<(), VmError> {
    let mut items = heap_items(heap, call)?;
    items.push(item);
    let mut i = items.len() - 1;
    while i > 0 {
        let parent = (i - 1) / 2;
        if lt(interp, &items[i], &items[parent], call)? {
            items.swap(i, parent);
            i = parent;
        } else {
            break;
        }
    }
    store_heap(heap, items);
    Ok(())
}

fn heap_pop(interp: &Interp, heap: &Value, call: &NativeCall<'_>) -> Result<Value, VmError> {
    let mut items = heap_items(heap, call)?;
    if items.is_empty() {
        return Err(VmError::new(VmErrorKind::Index, "pop from empty heap").at(call.loc.clone()));
    }
    let last = items.len() - 1;
    items.swap(0, last);
    let out = items.pop().expect("heap is non-empty");
    let mut i = 0;
    loop {
        let (l, r) = (2 * i + 1, 2 * i + 2);
        let mut smallest = i;
        if l < items.len() && lt(interp, &items[l], &items[smallest], call)? {
            smallest = l;
        }
        if r < items.len() && lt(interp, &items[r], &items[smallest], call)? {
            smallest = r;
        }
        if smallest == i {
            break;
        }
        items.swap(i, smallest);
        i = smallest;
    }
    store_heap(heap, items);
    Ok(out)
}

// === shared state accessors ===

fn with_file_mut<T>(
    call: &NativeCall<'_>,
    f: impl FnOnce(&mut FileState) -> Result<T, VmError>,
) -> Result<T, VmError> {
    let Some(Value::Obj(obj)) = &call.recv else {
        return Err(VmError::new(VmErrorKind::Type, "file method called on a non-file")
            .at(call.loc.clone()));
    };
    let mut payload = obj.payload.borrow_mut();
    match &mut *payload {
        Payload::File(state) => f(state),
        _ => Err(VmError::new(VmErrorKind::Type, "file method called on a non-file")
            .at(call.loc.clone())),
    }
}

fn with_socket_mut<T>(
    call: &NativeCall<'_>,
    f: impl FnOnce(&mut SocketState) -> Result<T, VmError>,
) -> Result<T, VmError> {
    let Some(Value::Obj(obj)) = &call.recv else {
        return Err(VmError::new(VmErrorKind::Type, "socket method called on a non-socket")
            .at(call.loc.clone()));
    };
    let mut payload = obj.payload.borrow_mut();
    match &mut *payload {
        Payload::Socket(state) => f(state),
        _ => Err(VmError::new(VmErrorKind::Type, "socket method called on a non-socket")
            .at(call.loc.clone())),
    }
}
