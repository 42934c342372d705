//! Trigger functions: side effects on edit.
//!
//! When the text of a cell with a trigger function changes, the trigger runs
//! with an `EditContext` describing the edit. A trigger that edits its own
//! cell does not fire itself again while it is still running.

use std::cell::{Cell as StdCell, RefCell};
use std::rc::{Rc, Weak};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::Value;
use crate::cell_id::CellId;
use crate::collection::CollectionStore;
use crate::compiler::SourceCompiler;
use crate::context::{EditContext, ExecutionContext};
use crate::events::{CellChange, CellChangeEvent, ListenerId, StoreEvent};
use crate::function::{FunctionKind, FunctionStore};
use crate::store::CellStore;

pub struct TriggerManager {
    store: Rc<CellStore>,
    collections: Rc<CollectionStore>,
    functions: Rc<FunctionStore>,
    compiler: Rc<dyn SourceCompiler>,
    max_range_cells: usize,

    watchers: RefCell<FxHashMap<CellId, ListenerId>>,
    executing: RefCell<FxHashSet<CellId>>,
    /// Cells whose current error was set by a failing trigger
    failed: RefCell<FxHashSet<CellId>>,
    runs: StdCell<usize>,
    store_listener: ListenerId,
    this: Weak<Self>,
}

impl std::fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerManager")
            .field("watched", &self.watchers.borrow().len())
            .field("runs", &self.runs.get())
            .finish()
    }
}

impl TriggerManager {
    pub fn new(
        store: Rc<CellStore>,
        collections: Rc<CollectionStore>,
        functions: Rc<FunctionStore>,
        compiler: Rc<dyn SourceCompiler>,
        max_range_cells: usize,
    ) -> Rc<Self> {
        let manager = Rc::new_cyclic(|weak: &Weak<Self>| {
            let w = weak.clone();
            let store_listener = store.events().add(move |event| {
                if let Some(this) = w.upgrade() {
                    match event {
                        StoreEvent::CellAdded { cell, .. } => this.watch(*cell),
                        StoreEvent::CellRemoved { cell, .. } => this.forget(*cell),
                        StoreEvent::CellMoved { .. } => {}
                    }
                }
            });

            Self {
                store,
                collections,
                functions,
                compiler,
                max_range_cells,
                watchers: RefCell::new(FxHashMap::default()),
                executing: RefCell::new(FxHashSet::default()),
                failed: RefCell::new(FxHashSet::default()),
                runs: StdCell::new(0),
                store_listener,
                this: weak.clone(),
            }
        });

        for cell in manager.store.all_cells() {
            manager.watch(cell);
        }
        manager
    }

    /// Trigger invocations so far.
    pub fn runs(&self) -> usize {
        self.runs.get()
    }

    pub fn is_executing(&self, cell: CellId) -> bool {
        self.executing.borrow().contains(&cell)
    }

    fn watch(&self, cell: CellId) {
        let this = self.this.clone();
        let listener = self.store.watch(cell, move |event| {
            if let Some(this) = this.upgrade() {
                this.on_cell_change(event);
            }
        });
        if let Some(listener) = listener {
            self.watchers.borrow_mut().insert(cell, listener);
        }
    }

    fn forget(&self, cell: CellId) {
        self.watchers.borrow_mut().remove(&cell);
        self.failed.borrow_mut().remove(&cell);
    }

    fn on_cell_change(&self, event: &CellChangeEvent) {
        if let CellChange::Text { old, new } = &event.change {
            self.fire(
                event.cell,
                EditContext {
                    property: event.change.property().to_string(),
                    old: Value::from_input(old),
                    new: Value::from_input(new),
                },
            );
        }
    }

    /// Run `cell`'s trigger function for `edit`. Returns whether it ran.
    pub fn fire(&self, cell: CellId, edit: EditContext) -> bool {
        let Some(Some(name)) = self.store.with_cell(cell, |c| c.trigger_function.clone()) else {
            return false;
        };
        if !self.executing.borrow_mut().insert(cell) {
            log::debug!("trigger '{}' already running for {}", name, cell);
            return false;
        }

        let function = self.functions.get_or_create(FunctionKind::Trigger, &name);
        let ctx = ExecutionContext::for_cell(&self.store, &self.collections, cell)
            .with_edit(edit)
            .with_max_range_cells(self.max_range_cells);
        let result = function.run(self.compiler.as_ref(), &ctx);
        self.runs.set(self.runs.get() + 1);

        // Writes below only fail if the trigger removed its own cell.
        match result {
            Ok(_) => {
                if self.failed.borrow_mut().remove(&cell) {
                    let _ = self.store.set_error(cell, None);
                }
            }
            Err(e) => {
                log::warn!("trigger '{}' failed for {}: {}", name, cell, e);
                self.failed.borrow_mut().insert(cell);
                let _ = self.store.set_error(cell, Some(e.to_string()));
            }
        }

        self.executing.borrow_mut().remove(&cell);
        true
    }
}

impl Drop for TriggerManager {
    fn drop(&mut self) {
        self.store.events().remove(self.store_listener);
        for (cell, listener) in self.watchers.borrow_mut().drain() {
            self.store.unwatch(cell, listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Fixture;

    #[test]
    fn test_trigger_receives_edit() {
        let fx = Fixture::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        fx.compiler.define("log", move |ctx| {
            s.borrow_mut().push(ctx.edit().cloned());
            Ok(Value::Empty)
        });
        fx.functions.define(FunctionKind::Trigger, "log", "log");

        let a = fx.store.insert_text(fx.loc("A1"), "1").unwrap();
        fx.store.set_trigger_function(a, Some("log")).unwrap();
        fx.store.set_text(a, "2").unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![Some(EditContext {
                property: "text".into(),
                old: Value::Number(1.0),
                new: Value::Number(2.0),
            })]
        );
        assert_eq!(fx.triggers.runs(), 1);
    }

    #[test]
    fn test_no_trigger_no_run() {
        let fx = Fixture::new();
        let a = fx.store.insert_text(fx.loc("A1"), "1").unwrap();
        fx.store.set_text(a, "2").unwrap();
        assert_eq!(fx.triggers.runs(), 0);
    }

    #[test]
    fn test_side_effects_and_self_edit_guard() {
        let fx = Fixture::new();
        // Copies the new value next door and upper-cases its own text
        fx.compiler.define("shout", |ctx| {
            let new = ctx.edit().map(|e| e.new.to_text()).unwrap_or_default();
            ctx.set_text("RC[1]", &new)?;
            ctx.set_text("RC", &new.to_uppercase())?;
            Ok(Value::Empty)
        });
        fx.functions.define(FunctionKind::Trigger, "shout", "shout");

        let a = fx.store.insert_text(fx.loc("A1"), "").unwrap();
        fx.store.set_trigger_function(a, Some("shout")).unwrap();
        fx.store.set_text(a, "hey").unwrap();

        assert_eq!(fx.store.text(a).as_deref(), Some("HEY"));
        let b = fx.store.at(&fx.loc("B1")).unwrap();
        assert_eq!(fx.store.text(b).as_deref(), Some("hey"));
        // The self-edit did not re-fire while running
        assert_eq!(fx.triggers.runs(), 1);
        assert!(!fx.triggers.is_executing(a));
    }

    #[test]
    fn test_failure_sets_error_and_success_clears_it() {
        let fx = Fixture::new();
        fx.compiler.define("picky", |ctx| match ctx.edit().map(|e| &e.new) {
            Some(Value::Number(_)) => Ok(Value::Empty),
            _ => Err("numbers only".into()),
        });
        fx.functions.define(FunctionKind::Trigger, "picky", "picky");

        let a = fx.store.insert_text(fx.loc("A1"), "").unwrap();
        fx.store.set_trigger_function(a, Some("picky")).unwrap();

        fx.store.set_text(a, "abc").unwrap();
        assert_eq!(fx.store.error(a).as_deref(), Some("numbers only"));
        assert_eq!(fx.store.text(a).as_deref(), Some("abc"));

        fx.store.set_text(a, "12").unwrap();
        assert_eq!(fx.store.error(a), None);
    }

    #[test]
    fn test_success_keeps_foreign_error() {
        let fx = Fixture::new();
        fx.compiler.define("ok", |_| Ok(Value::Empty));
        fx.functions.define(FunctionKind::Trigger, "ok", "ok");

        let a = fx.store.insert_text(fx.loc("A1"), "").unwrap();
        fx.store.set_trigger_function(a, Some("ok")).unwrap();
        fx.store.set_error(a, Some("set elsewhere".into())).unwrap();

        fx.store.set_text(a, "x").unwrap();
        assert_eq!(fx.store.error(a).as_deref(), Some("set elsewhere"));
    }
}
