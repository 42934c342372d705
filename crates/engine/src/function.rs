//! User-authored cell functions.
//!
//! A `CellFunction` owns its source text and caches two derived artifacts,
//! both keyed by the source fingerprint (blake3 of the text):
//!
//! - the compiled callable (or the diagnostics of a failed compile)
//! - the extracted `Dependencies`
//!
//! Neither is recomputed until the source changes. `set_source` with new
//! text announces `FunctionEvent::DependenciesChanged` so bound cells can
//! rebuild their subscriptions.

use std::cell::{Cell as StdCell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cell::Value;
use crate::compiler::{CompiledFunction, Diagnostics, SourceCompiler};
use crate::context::ExecutionContext;
use crate::events::{ListenerId, Listeners};
use crate::refs::{extract, Dependencies};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionKind {
    /// Computes a cell's value
    Populate,
    /// Runs side effects after an edit; result ignored
    Trigger,
    /// Ranks a collection item for a sorted view
    Rank,
}

impl FunctionKind {
    pub fn produces_value(self) -> bool {
        !matches!(self, FunctionKind::Trigger)
    }
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionKind::Populate => write!(f, "populate"),
            FunctionKind::Trigger => write!(f, "trigger"),
            FunctionKind::Rank => write!(f, "rank"),
        }
    }
}

/// Content hash of a function's source.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(source: &str) -> Self {
        Self(*blake3::hash(source.as_bytes()).as_bytes())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionError {
    Compile(Diagnostics),
    Runtime(String),
    Panicked(String),
}

impl std::fmt::Display for FunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compile(d) => write!(f, "compile error: {d}"),
            Self::Runtime(msg) => write!(f, "{msg}"),
            Self::Panicked(msg) => write!(f, "function panicked: {msg}"),
        }
    }
}

impl std::error::Error for FunctionError {}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionEvent {
    /// The source changed; dependencies must be re-read.
    DependenciesChanged { name: String },
}

enum CompileState {
    Uncompiled,
    Compiled {
        fingerprint: Fingerprint,
        callable: Rc<dyn CompiledFunction>,
    },
    Failed {
        fingerprint: Fingerprint,
        diagnostics: Diagnostics,
    },
}

pub struct CellFunction {
    name: String,
    kind: FunctionKind,
    source: RefCell<String>,
    fingerprint: StdCell<Fingerprint>,
    state: RefCell<CompileState>,
    dependencies: RefCell<Option<(Fingerprint, Rc<Dependencies>)>>,
    compile_count: StdCell<usize>,
    events: Listeners<FunctionEvent>,
}

impl std::fmt::Debug for CellFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellFunction")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("fingerprint", &self.fingerprint.get())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

impl CellFunction {
    pub fn new(kind: FunctionKind, name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            name: name.into(),
            kind,
            fingerprint: StdCell::new(Fingerprint::of(&source)),
            source: RefCell::new(source),
            state: RefCell::new(CompileState::Uncompiled),
            dependencies: RefCell::new(None),
            compile_count: StdCell::new(0),
            events: Listeners::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn source(&self) -> String {
        self.source.borrow().clone()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint.get()
    }

    pub fn events(&self) -> &Listeners<FunctionEvent> {
        &self.events
    }

    pub fn on_change(&self, callback: impl Fn(&FunctionEvent) + 'static) -> ListenerId {
        self.events.add(callback)
    }

    /// Number of times the compiler was actually invoked.
    pub fn compile_count(&self) -> usize {
        self.compile_count.get()
    }

    /// True when the cached compile matches the current source.
    pub fn is_compiled(&self) -> bool {
        let current = self.fingerprint.get();
        match &*self.state.borrow() {
            CompileState::Compiled { fingerprint, .. } | CompileState::Failed { fingerprint, .. } => {
                *fingerprint == current
            }
            CompileState::Uncompiled => false,
        }
    }

    /// Replace the source. Returns false (and does nothing) if unchanged.
    pub fn set_source(&self, source: &str) -> bool {
        if *self.source.borrow() == source {
            return false;
        }
        *self.source.borrow_mut() = source.to_string();
        self.fingerprint.set(Fingerprint::of(source));
        *self.state.borrow_mut() = CompileState::Uncompiled;

        log::debug!("{} function '{}' changed ({})", self.kind, self.name, self.fingerprint.get());
        self.events.emit(&FunctionEvent::DependenciesChanged {
            name: self.name.clone(),
        });
        true
    }

    /// The compiled callable for the current source, compiling if stale.
    pub fn compiled(&self, compiler: &dyn SourceCompiler) -> Result<Rc<dyn CompiledFunction>, FunctionError> {
        let current = self.fingerprint.get();
        match &*self.state.borrow() {
            CompileState::Compiled { fingerprint, callable } if *fingerprint == current => {
                return Ok(callable.clone());
            }
            CompileState::Failed { fingerprint, diagnostics } if *fingerprint == current => {
                return Err(FunctionError::Compile(diagnostics.clone()));
            }
            _ => {}
        }

        let source = self.source();
        let outcome = if source.trim().is_empty() {
            Err(Diagnostics::error(format!("{} function '{}' has no source", self.kind, self.name)))
        } else {
            self.compile_count.set(self.compile_count.get() + 1);
            compiler.compile(self.kind, &source)
        };

        match outcome {
            Ok(callable) => {
                *self.state.borrow_mut() = CompileState::Compiled {
                    fingerprint: current,
                    callable: callable.clone(),
                };
                Ok(callable)
            }
            Err(diagnostics) => {
                log::warn!("{} function '{}' failed to compile: {}", self.kind, self.name, diagnostics);
                *self.state.borrow_mut() = CompileState::Failed {
                    fingerprint: current,
                    diagnostics: diagnostics.clone(),
                };
                Err(FunctionError::Compile(diagnostics))
            }
        }
    }

    /// Compile if needed and invoke. Never panics.
    pub fn run(&self, compiler: &dyn SourceCompiler, ctx: &ExecutionContext<'_>) -> Result<Value, FunctionError> {
        let callable = self.compiled(compiler)?;

        match catch_unwind(AssertUnwindSafe(|| callable.invoke(ctx))) {
            Ok(Ok(value)) if self.kind.produces_value() => Ok(value),
            Ok(Ok(_)) => Ok(Value::Empty),
            Ok(Err(message)) => Err(FunctionError::Runtime(message)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("{} function '{}' panicked: {}", self.kind, self.name, message);
                Err(FunctionError::Panicked(message))
            }
        }
    }

    /// Dependencies of the current source, extracted once per fingerprint.
    pub fn dependencies(&self) -> Rc<Dependencies> {
        let current = self.fingerprint.get();
        if let Some((fingerprint, deps)) = &*self.dependencies.borrow() {
            if *fingerprint == current {
                return deps.clone();
            }
        }

        let extraction = extract(&self.source.borrow());
        for diagnostic in &extraction.diagnostics {
            log::warn!("{} function '{}': {}", self.kind, self.name, diagnostic);
        }
        let deps = Rc::new(extraction.dependencies);
        *self.dependencies.borrow_mut() = Some((current, deps.clone()));
        deps
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// All functions of a workbook, by kind and name.
#[derive(Debug, Default)]
pub struct FunctionStore {
    functions: RefCell<FxHashMap<(FunctionKind, String), Rc<CellFunction>>>,
}

impl FunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a function, creating an empty one if it does not exist yet.
    pub fn get_or_create(&self, kind: FunctionKind, name: &str) -> Rc<CellFunction> {
        self.functions
            .borrow_mut()
            .entry((kind, name.to_string()))
            .or_insert_with(|| Rc::new(CellFunction::new(kind, name, "")))
            .clone()
    }

    pub fn get(&self, kind: FunctionKind, name: &str) -> Option<Rc<CellFunction>> {
        self.functions.borrow().get(&(kind, name.to_string())).cloned()
    }

    /// Create a function or replace its source.
    pub fn define(&self, kind: FunctionKind, name: &str, source: &str) -> Rc<CellFunction> {
        let function = self.get_or_create(kind, name);
        function.set_source(source);
        function
    }

    pub fn remove(&self, kind: FunctionKind, name: &str) -> Option<Rc<CellFunction>> {
        self.functions.borrow_mut().remove(&(kind, name.to_string()))
    }

    /// Names of all functions of `kind`, sorted.
    pub fn names(&self, kind: FunctionKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .borrow()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.borrow().is_empty()
    }
}
