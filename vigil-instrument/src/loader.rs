//! The module loader pipeline.
//!
//! Every import funnels through one place: a list of [`Finder`]s locates
//! the module, a [`SourceProvider`] reads its text, and, once the
//! instrumentation hook is installed, the rewrite pass runs before the
//! module executes. The hook wraps the existing finders in delegators
//! rather than prepending a new one, so finder precedence is preserved,
//! and it installs exactly once.
//!
//! Exclusion rules keep the rewriter away from code it must not touch:
//! native modules, the spec folder (spec code runs with shim globals but
//! is never rewritten), the vendor/stdlib/harness directories unless the
//! matching `instrument-*` knob is on, and a blocked list of path
//! fragments for packages known to misbehave under rewriting.
//!
//! A load that fails mid-execution removes the partially initialized
//! module from the registry and re-raises, so a retry observes a clean
//! slate. Only top-level loads are charged to the post-instrumentation
//! timer; nested imports ride along under the outermost one.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use vigil_core::SourceLocation;

use crate::interp::{Interp, VmError, VmErrorKind};
use crate::parser::parse_module;
use crate::rewrite::rewrite_module;
use crate::stdlib;
use crate::value::{EnvRef, ModuleData, NativeFn, Obj, Payload, Scope, Value};

/// Path fragments of packages known to be incompatible with rewriting.
const BLOCKED_FRAGMENTS: &[&str] = &["vendor/ffi_bridge", "vendor/hotload"];

/// Reads module source for a finder hit.
pub trait SourceProvider {
    fn source(&self, origin: &Path) -> std::io::Result<String>;
}

/// The default provider: the filesystem.
pub struct FsSourceProvider;

impl SourceProvider for FsSourceProvider {
    fn source(&self, origin: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(origin)
    }
}

/// A located module.
pub enum Found {
    Source {
        origin: PathBuf,
        provider: Rc<dyn SourceProvider>,
    },
    Native {
        name: String,
    },
}

/// Locates modules by name.
pub trait Finder {
    fn find_module(&self, name: &str) -> Option<Found>;
}

/// Finds the native standard-library modules.
struct NativeFinder;

impl Finder for NativeFinder {
    fn find_module(&self, name: &str) -> Option<Found> {
        stdlib::is_native_module(name).then(|| Found::Native {
            name: name.to_string(),
        })
    }
}

/// Finds `.vg` files under the configured search roots.
struct PathFinder {
    roots: Rc<RefCell<Vec<PathBuf>>>,
    provider: Rc<dyn SourceProvider>,
}

impl Finder for PathFinder {
    fn find_module(&self, name: &str) -> Option<Found> {
        for root in self.roots.borrow().iter() {
            let candidate = root.join(format!("{}.vg", name));
            if candidate.is_file() {
                return Some(Found::Source {
                    origin: candidate,
                    provider: self.provider.clone(),
                });
            }
        }
        None
    }
}

/// The delegator the hook wraps every finder in. Finding is forwarded
/// unchanged; the pipeline applies the rewriter to whatever comes back.
struct InstrumentingFinder {
    inner: Rc<dyn Finder>,
}

impl Finder for InstrumentingFinder {
    fn find_module(&self, name: &str) -> Option<Found> {
        self.inner.find_module(name)
    }
}

/// Exclusion and instrumentation knobs for the pipeline.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    pub instrument_vendor: bool,
    pub instrument_stdlib: bool,
    pub instrument_harness: bool,
    pub instrument_self: bool,
    /// The third-party package directory (site-packages analog).
    pub vendor_dir: Option<PathBuf>,
    /// A directory of host-language stdlib sources, when one exists.
    pub stdlib_dir: Option<PathBuf>,
    pub harness_dir: Option<PathBuf>,
    /// The monitor's own support sources.
    pub self_dir: Option<PathBuf>,
    /// Spec folders: shim globals, never rewritten.
    pub spec_dirs: Vec<PathBuf>,
}

pub struct Loader {
    finders: RefCell<Vec<Rc<dyn Finder>>>,
    modules: RefCell<HashMap<String, Value>>,
    roots: Rc<RefCell<Vec<PathBuf>>>,
    config: RefCell<LoaderConfig>,
    hook_installed: Cell<bool>,
    rewrite_enabled: Cell<bool>,
    entry_module: RefCell<Option<String>>,
    /// Origins currently being executed, outermost first.
    loading: RefCell<Vec<PathBuf>>,
    instrumentation_complete: Cell<bool>,
    post_instrumentation_seconds: Cell<f64>,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Loader {
        let roots = Rc::new(RefCell::new(Vec::new()));
        let provider: Rc<dyn SourceProvider> = Rc::new(FsSourceProvider);
        let finders: Vec<Rc<dyn Finder>> = vec![
            Rc::new(NativeFinder),
            Rc::new(PathFinder {
                roots: roots.clone(),
                provider,
            }),
        ];
        Loader {
            finders: RefCell::new(finders),
            modules: RefCell::new(HashMap::new()),
            roots,
            config: RefCell::new(config),
            hook_installed: Cell::new(false),
            rewrite_enabled: Cell::new(false),
            entry_module: RefCell::new(None),
            loading: RefCell::new(Vec::new()),
            instrumentation_complete: Cell::new(false),
            post_instrumentation_seconds: Cell::new(0.0),
        }
    }

    pub fn config(&self) -> LoaderConfig {
        self.config.borrow().clone()
    }

    pub fn set_config(&self, config: LoaderConfig) {
        *self.config.borrow_mut() = config;
    }

    pub fn add_search_root(&self, root: impl Into<PathBuf>) {
        self.roots.borrow_mut().push(root.into());
    }

    /// Resolves a host-relative path against the primary search root (the
    /// entry script's directory).
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            return p;
        }
        match self.roots.borrow().first() {
            Some(root) => root.join(p),
            None => p,
        }
    }

    pub fn hook_installed(&self) -> bool {
        self.hook_installed.get()
    }

    /// Installs the instrumentation hook: wraps every finder in a
    /// delegator and reloads already-loaded modules through the rewriting
    /// pipeline. Installs at most once; `rewrite` is false under the
    /// `builtin` strategy.
    pub fn install_hook(&self, interp: &Interp, rewrite: bool) {
        if self.hook_installed.replace(true) {
            return;
        }
        self.rewrite_enabled.set(rewrite);
        {
            let mut finders = self.finders.borrow_mut();
            let wrapped: Vec<Rc<dyn Finder>> = finders
                .drain(..)
                .map(|inner| Rc::new(InstrumentingFinder { inner }) as Rc<dyn Finder>)
                .collect();
            *finders = wrapped;
        }

        // Reload whatever was imported before the hook existed, so no
        // module escapes instrumentation. Failures are tolerated.
        let entry = self.entry_module.borrow().clone();
        let loaded: Vec<String> = {
            let modules = self.modules.borrow();
            modules
                .iter()
                .filter(|(name, value)| {
                    !is_native_module_value(value) && Some(name.as_str()) != entry.as_deref()
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in loaded {
            self.modules.borrow_mut().remove(&name);
            let loc = SourceLocation::new("<reload>", 0, 0);
            if let Err(err) = self.import(interp, &name, &loc) {
                warn!(module = %name, error = %err, "reload after hook install failed");
            }
        }
    }

    /// Marks startup instrumentation as finished; subsequent top-level
    /// loads are charged to the post-instrumentation timer.
    pub fn set_instrumentation_complete(&self) {
        self.instrumentation_complete.set(true);
    }

    pub fn post_instrumentation_seconds(&self) -> f64 {
        self.post_instrumentation_seconds.get()
    }

    pub fn loaded_module_names(&self) -> Vec<String> {
        self.modules.borrow().keys().cloned().collect()
    }

    /// Whether the rewriter may touch a module at `origin`.
    fn should_instrument(&self, origin: &Path) -> bool {
        if origin.extension().map(|e| e != "vg").unwrap_or(true) {
            return false;
        }
        let config = self.config.borrow();
        for spec_dir in &config.spec_dirs {
            if origin.starts_with(spec_dir) {
                return false;
            }
        }
        if let Some(dir) = &config.self_dir {
            if origin.starts_with(dir) && !config.instrument_self {
                return false;
            }
        }
        if let Some(dir) = &config.stdlib_dir {
            if origin.starts_with(dir) && !config.instrument_stdlib {
                return false;
            }
        }
        if let Some(dir) = &config.harness_dir {
            if origin.starts_with(dir) && !config.instrument_harness {
                return false;
            }
        }
        if let Some(dir) = &config.vendor_dir {
            if origin.starts_with(dir) && !config.instrument_vendor {
                return false;
            }
        }
        let text = origin.to_string_lossy();
        if BLOCKED_FRAGMENTS.iter().any(|frag| text.contains(frag)) {
            return false;
        }
        true
    }

    /// Imports a module, loading it at most once.
    pub fn import(
        &self,
        interp: &Interp,
        name: &str,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        if let Some(existing) = self.modules.borrow().get(name) {
            return Ok(existing.clone());
        }

        let found = {
            let finders = self.finders.borrow();
            finders.iter().find_map(|f| f.find_module(name))
        };
        let Some(found) = found else {
            return Err(VmError::new(
                VmErrorKind::Import,
                format!("no module named `{}`", name),
            )
            .at(loc.clone()));
        };

        match found {
            Found::Native { name } => {
                let module = stdlib::native_module(&name).ok_or_else(|| {
                    VmError::new(
                        VmErrorKind::Import,
                        format!("no module named `{}`", name),
                    )
                    .at(loc.clone())
                })?;
                self.modules.borrow_mut().insert(name, module.clone());
                Ok(module)
            }
            Found::Source { origin, provider } => {
                self.load_source(interp, name, &origin, provider.as_ref(), loc)
            }
        }
    }

    fn load_source(
        &self,
        interp: &Interp,
        name: &str,
        origin: &Path,
        provider: &dyn SourceProvider,
        loc: &SourceLocation,
    ) -> Result<Value, VmError> {
        let source = provider.source(origin).map_err(|e| {
            VmError::new(
                VmErrorKind::Import,
                format!("cannot read module `{}` at {:?}: {}", name, origin, e),
            )
            .at(loc.clone())
        })?;
        let file = origin.to_string_lossy().to_string();
        let mut ast = parse_module(&source, name, &file).map_err(|e| {
            VmError::new(
                VmErrorKind::Import,
                format!("cannot load module `{}`: {}", name, e),
            )
            .at(loc.clone())
        })?;

        let instrument =
            self.hook_installed.get() && self.rewrite_enabled.get() && self.should_instrument(origin);
        if instrument {
            debug!(module = name, origin = %file, "instrumenting module");
            ast = rewrite_module(ast);
        }

        let env = interp.module_scope();
        env.define("__name__", Value::str(name));
        if instrument {
            inject_shim_globals(&env);
        }

        let module_value = Value::Obj(Obj::new(Payload::Module(ModuleData {
            name: Rc::from(name),
            file: Some(Arc::from(file.as_str())),
            globals: env.clone(),
            native: false,
        })));
        // Registered before execution so circular imports see the partial
        // module, exactly like the host registry the pipeline wraps.
        self.modules
            .borrow_mut()
            .insert(name.to_string(), module_value.clone());

        let timed = self.instrumentation_complete.get() && self.loading.borrow().is_empty();
        let started = timed.then(Instant::now);
        self.loading.borrow_mut().push(origin.to_path_buf());

        let outcome = interp.exec_module(&ast, &env);

        self.loading.borrow_mut().pop();
        if let Some(started) = started {
            self.post_instrumentation_seconds
                .set(self.post_instrumentation_seconds.get() + started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(()) => Ok(module_value),
            Err(err) => {
                // A partially executed module must not stay importable.
                self.modules.borrow_mut().remove(name);
                Err(err)
            }
        }
    }

    /// Loads the entry script as a module, making its directory the
    /// primary search root.
    pub fn load_entry(&self, interp: &Interp, path: &Path) -> Result<Value, VmError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "main".to_string());
        if let Some(parent) = path.parent() {
            self.roots.borrow_mut().insert(0, parent.to_path_buf());
        }
        *self.entry_module.borrow_mut() = Some(stem.clone());
        let loc = SourceLocation::new("<entry>", 0, 0);
        self.import(interp, &stem, &loc)
    }

    /// Loads one file outside the module registry, with caller-supplied
    /// globals injected before execution and no rewriting. Specification
    /// files are loaded this way.
    pub fn load_isolated(
        &self,
        interp: &Interp,
        path: &Path,
        inject: impl FnOnce(&EnvRef),
    ) -> Result<Value, VmError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "spec".to_string());
        let source = std::fs::read_to_string(path).map_err(|e| {
            VmError::new(
                VmErrorKind::Import,
                format!("cannot read `{}`: {}", path.display(), e),
            )
        })?;
        let file = path.to_string_lossy().to_string();
        let ast = parse_module(&source, &name, &file).map_err(|e| {
            VmError::new(VmErrorKind::Import, format!("cannot load `{}`: {}", name, e))
        })?;

        let env = interp.module_scope();
        env.define("__name__", Value::str(name.as_str()));
        inject_shim_globals(&env);
        inject(&env);
        interp.exec_module(&ast, &env)?;

        Ok(Value::Obj(Obj::new(Payload::Module(ModuleData {
            name: Rc::from(name.as_str()),
            file: Some(Arc::from(file.as_str())),
            globals: env,
            native: false,
        }))))
    }
}

fn is_native_module_value(value: &Value) -> bool {
    match value.obj() {
        Some(obj) => matches!(&*obj.payload.borrow(), Payload::Module(m) if m.native),
        None => false,
    }
}

/// The two namespaces every instrumented module receives: the original
/// builtins and the instrumented ones.
fn inject_shim_globals(env: &EnvRef) {
    let original = Scope::root_namespace("original", |globals| {
        // Identity anchors only; resolution happens through the builtin
        // scope, these names exist for explicit disambiguation.
        globals.define(
            "list",
            Value::native(NativeFn::new("original", "list", |interp, call| {
                let items = match call.args.first() {
                    Some(v) => interp.collect_items(v, call.loc)?,
                    None => Vec::new(),
                };
                Ok(Value::list(items))
            })),
        );
        globals.define(
            "dict",
            Value::native(NativeFn::new("original", "dict", |interp, call| {
                let mut pairs = Vec::new();
                if let Some(Value::Obj(obj)) = call.args.first() {
                    if let Payload::Dict(entries) = &*obj.payload.borrow() {
                        pairs = entries.clone();
                    }
                }
                let _ = interp;
                Ok(Value::dict(pairs))
            })),
        );
    });
    let injected = Scope::root_namespace("injected", |globals| {
        globals.define(
            "list",
            Value::native(NativeFn::new("injected", "list", |interp, call| {
                let items = match call.args.first() {
                    Some(v) => interp.collect_items(v, call.loc)?,
                    None => Vec::new(),
                };
                Ok(interp.shim_make_list(items, call.loc))
            })),
        );
        globals.define(
            "dict",
            Value::native(NativeFn::new("injected", "dict", |interp, call| {
                interp.shim_make_dict(call.args.first(), call.kwargs, call.loc)
            })),
        );
    });
    env.define("__original__", original);
    env.define("__injected__", injected);
}

// Small helper for building namespace-like module values.
trait NamespaceExt {
    fn root_namespace(name: &str, fill: impl FnOnce(&EnvRef)) -> Value;
}

impl NamespaceExt for Scope {
    fn root_namespace(name: &str, fill: impl FnOnce(&EnvRef)) -> Value {
        let globals = Scope::root();
        fill(&globals);
        Value::Obj(Obj::new(Payload::Module(ModuleData {
            name: Rc::from(name),
            file: None,
            globals,
            native: true,
        })))
    }
}
