//! Test harness: a closure-backed compiler and a wired-up workbook.
//!
//! `TestCompiler` maps exact source strings to Rust closures. Because the
//! engine extracts dependencies from the source text itself, tests write
//! realistic sources (`return cell("A1") + 1`) and supply the behaviour
//! as a closure.
//!
//! `Fixture` wraps a `Workbook` built around a `TestCompiler` and exposes
//! every component, plus `apply_ops` for scripted multi-step scenarios.

use std::cell::{Cell as StdCell, RefCell};
use std::rc::Rc;

use livegrid_config::EngineSettings;
use rustc_hash::FxHashMap;

use crate::cell::Value;
use crate::cell_id::Location;
use crate::collection::CollectionStore;
use crate::compiler::{CompiledFunction, Diagnostics, SourceCompiler};
use crate::context::ExecutionContext;
use crate::function::{FunctionKind, FunctionStore};
use crate::notifier::{CollectionNotifier, LocationNotifier};
use crate::populate::PopulateManager;
use crate::store::CellStore;
use crate::trigger::TriggerManager;
use crate::workbook::Workbook;

pub type TestFn = Rc<dyn Fn(&ExecutionContext<'_>) -> Result<Value, String>>;

#[derive(Default)]
pub struct TestCompiler {
    sources: RefCell<FxHashMap<String, TestFn>>,
    compiles: StdCell<usize>,
}

impl TestCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `source` compile to `f`. Unknown sources fail to compile.
    pub fn define<F>(&self, source: &str, f: F)
    where
        F: Fn(&ExecutionContext<'_>) -> Result<Value, String> + 'static,
    {
        self.sources.borrow_mut().insert(source.to_string(), Rc::new(f));
    }

    /// Number of `compile` calls.
    pub fn compile_count(&self) -> usize {
        self.compiles.get()
    }
}

struct TestFunction(TestFn);

impl CompiledFunction for TestFunction {
    fn invoke(&self, ctx: &ExecutionContext<'_>) -> Result<Value, String> {
        (self.0)(ctx)
    }
}

impl SourceCompiler for TestCompiler {
    fn compile(&self, _kind: FunctionKind, source: &str) -> Result<Rc<dyn CompiledFunction>, Diagnostics> {
        self.compiles.set(self.compiles.get() + 1);
        match self.sources.borrow().get(source) {
            Some(f) => Ok(Rc::new(TestFunction(f.clone()))),
            None => Err(Diagnostics::error(format!("no test function for source {:?}", source))),
        }
    }
}

/// Operation to apply to a fixture.
#[derive(Debug, Clone)]
pub enum Op {
    SetText { address: String, text: String },
    SetPopulate { address: String, function: Option<String> },
    SetTrigger { address: String, function: Option<String> },
    Define { kind: FunctionKind, name: String, source: String },
    Move { from: String, to: String },
    Remove { address: String },
    Push { collection: String, value: Value },
}

/// Result of applying operations.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Number of ops successfully applied.
    pub applied: usize,
    /// Error of the first failing op; later ops are not applied.
    pub error: Option<(usize, String)>,
}

pub struct Fixture {
    pub compiler: Rc<TestCompiler>,
    pub workbook: Workbook,
    pub store: Rc<CellStore>,
    pub collections: Rc<CollectionStore>,
    pub functions: Rc<FunctionStore>,
    pub locations: Rc<LocationNotifier>,
    pub collection_notifier: Rc<CollectionNotifier>,
    pub populate: Rc<PopulateManager>,
    pub triggers: Rc<TriggerManager>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(Rc::new(TestCompiler::new()), settings, |_, _| {})
    }

    /// Run `setup` on fresh stores before any engine is attached.
    pub fn build(
        compiler: Rc<TestCompiler>,
        settings: EngineSettings,
        setup: impl FnOnce(&CellStore, &FunctionStore),
    ) -> Self {
        let store = Rc::new(CellStore::new());
        let functions = Rc::new(FunctionStore::new());
        setup(&store, &functions);

        let workbook = Workbook::from_parts(
            store,
            Rc::new(CollectionStore::new()),
            functions,
            compiler.clone(),
            settings,
        );

        Self {
            compiler,
            store: workbook.store().clone(),
            collections: workbook.collections().clone(),
            functions: workbook.functions().clone(),
            locations: workbook.location_notifier().clone(),
            collection_notifier: workbook.collection_notifier().clone(),
            populate: workbook.populate().clone(),
            triggers: workbook.triggers().clone(),
            workbook,
        }
    }

    /// Location of an absolute address on the default sheet.
    pub fn loc(&self, address: &str) -> Location {
        match self.workbook.location(address) {
            Ok(loc) => loc,
            Err(e) => panic!("bad test address {address}: {e}"),
        }
    }

    /// Apply operations in order, stopping at the first failure.
    pub fn apply_ops(&self, ops: &[Op]) -> ApplyResult {
        let mut applied = 0;
        for (idx, op) in ops.iter().enumerate() {
            if let Err(message) = self.apply_single_op(op) {
                return ApplyResult {
                    applied,
                    error: Some((idx, message)),
                };
            }
            applied += 1;
        }
        ApplyResult { applied, error: None }
    }

    fn apply_single_op(&self, op: &Op) -> Result<(), String> {
        let wb = &self.workbook;
        match op {
            Op::SetText { address, text } => wb.set_text(address, text).map(|_| ()),
            Op::SetPopulate { address, function } => wb.set_populate(address, function.as_deref()).map(|_| ()),
            Op::SetTrigger { address, function } => wb.set_trigger(address, function.as_deref()).map(|_| ()),
            Op::Define { kind, name, source } => {
                wb.define_function(*kind, name, source);
                Ok(())
            }
            Op::Move { from, to } => wb.move_cell(from, to).map(|_| ()),
            Op::Remove { address } => {
                wb.remove_cell(address);
                Ok(())
            }
            Op::Push { collection, value } => {
                self.collections.push(collection, value.clone());
                Ok(())
            }
        }
        .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(address: &str, text: &str) -> Op {
        Op::SetText {
            address: address.into(),
            text: text.into(),
        }
    }

    #[test]
    fn test_unknown_source_fails_to_compile() {
        let compiler = TestCompiler::new();
        assert!(compiler.compile(FunctionKind::Populate, "nope").is_err());
        assert_eq!(compiler.compile_count(), 1);
    }

    #[test]
    fn test_apply_ops_chain() {
        let fx = Fixture::new();
        let src = r#"return cell("R[-1]C") + 1"#;
        fx.compiler.define(src, |ctx| {
            Ok(Value::Number(ctx.cell("R[-1]C")?.as_number().unwrap_or(0.0) + 1.0))
        });

        let result = fx.apply_ops(&[
            Op::Define {
                kind: FunctionKind::Populate,
                name: "next".into(),
                source: src.into(),
            },
            set("A1", "1"),
            Op::SetPopulate { address: "A2".into(), function: Some("next".into()) },
            Op::SetPopulate { address: "A3".into(), function: Some("next".into()) },
            Op::SetPopulate { address: "A4".into(), function: Some("next".into()) },
        ]);
        assert_eq!(result.applied, 5);
        assert!(result.error.is_none());
        assert_eq!(fx.workbook.text("A4").as_deref(), Some("4"));

        fx.apply_ops(&[set("A1", "10")]);
        assert_eq!(fx.workbook.text("A2").as_deref(), Some("11"));
        assert_eq!(fx.workbook.text("A4").as_deref(), Some("13"));
    }

    #[test]
    fn test_apply_ops_stops_at_error() {
        let fx = Fixture::new();
        let result = fx.apply_ops(&[
            set("A1", "1"),
            Op::Move { from: "A1".into(), to: "R[1]C".into() },
            set("A2", "2"),
        ]);
        assert_eq!(result.applied, 1);
        assert_eq!(result.error.as_ref().map(|(i, _)| *i), Some(1));
        assert!(fx.workbook.text("A2").is_none());
    }
}
