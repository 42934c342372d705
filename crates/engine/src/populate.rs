//! Incremental recalculation of populate functions.
//!
//! Every cell with a populate function gets a proxy subscriber. The proxy is
//! subscribed to the channels the function reads (resolved against the
//! cell's location) and, when any of them publishes, the manager re-runs the
//! function and writes the result back into the cell. That write may in turn
//! publish the cell's own location, which is how changes propagate.
//!
//! Bindings are rebuilt by diff whenever the function name, the cell's
//! location, the function source, or (for `own_collection()` readers) the
//! cell's own text changes.
//!
//! # Re-entrancy
//!
//! Recalculation is synchronous, so a chain A → B → C runs nested on the
//! stack. The manager keeps that stack; a request for a cell that is already
//! on it is dropped. When the cell is on top (its own write echoing back)
//! the drop is silent. Anything deeper is a feedback loop: it is counted and,
//! with `CyclePolicy::Report`, recorded as a `CycleReport`.

use std::cell::{Cell as StdCell, RefCell};
use std::rc::{Rc, Weak};

use livegrid_config::{CyclePolicy, EngineSettings};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::{CellKind, COMPILE_ERROR_TEXT, RUN_ERROR_TEXT};
use crate::cell_id::{CellId, Location};
use crate::collection::CollectionStore;
use crate::compiler::SourceCompiler;
use crate::context::ExecutionContext;
use crate::events::{CellChange, CellChangeEvent, ListenerId, StoreEvent};
use crate::function::{CellFunction, FunctionError, FunctionEvent, FunctionKind, FunctionStore};
use crate::notifier::{CollectionNotifier, LocationNotifier};
use crate::recalc::{CycleReport, RecalcStats};
use crate::registry::Subscriber;
use crate::store::CellStore;

/// Subscriber standing in for one cell.
struct CellProxy {
    manager: Weak<PopulateManager>,
    cell: CellId,
}

impl Subscriber for CellProxy {
    fn notify(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.recalculate(self.cell);
        }
    }
}

struct Binding {
    proxy: Rc<dyn Subscriber>,
    function: String,
    locations: Vec<Location>,
    collections: Vec<String>,
    /// Dependencies include `own_collection()`
    reads_own_text: bool,
}

struct FunctionHook {
    function: Rc<CellFunction>,
    listener: ListenerId,
    cells: usize,
}

/// The channels a cell is currently subscribed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundChannels {
    pub function: String,
    pub locations: Vec<Location>,
    pub collections: Vec<String>,
}

pub struct PopulateManager {
    store: Rc<CellStore>,
    collections: Rc<CollectionStore>,
    functions: Rc<FunctionStore>,
    compiler: Rc<dyn SourceCompiler>,
    locations: Rc<LocationNotifier>,
    collection_notifier: Rc<CollectionNotifier>,
    settings: EngineSettings,

    bindings: RefCell<FxHashMap<CellId, Binding>>,
    cell_watchers: RefCell<FxHashMap<CellId, ListenerId>>,
    hooks: RefCell<FxHashMap<String, FunctionHook>>,
    executing: RefCell<Vec<CellId>>,

    stats: StdCell<RecalcStats>,
    cycle_reports: RefCell<Vec<CycleReport>>,
    store_listener: ListenerId,
    this: Weak<Self>,
}

impl std::fmt::Debug for PopulateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopulateManager")
            .field("bound", &self.bindings.borrow().len())
            .field("stats", &self.stats.get())
            .finish()
    }
}

impl PopulateManager {
    /// Create the manager and bind every cell already in the store.
    pub fn new(
        store: Rc<CellStore>,
        collections: Rc<CollectionStore>,
        functions: Rc<FunctionStore>,
        compiler: Rc<dyn SourceCompiler>,
        locations: Rc<LocationNotifier>,
        collection_notifier: Rc<CollectionNotifier>,
        settings: EngineSettings,
    ) -> Rc<Self> {
        let manager = Rc::new_cyclic(|weak: &Weak<Self>| {
            let w = weak.clone();
            let store_listener = store.events().add(move |event| {
                if let Some(this) = w.upgrade() {
                    this.on_store_event(event);
                }
            });

            Self {
                store,
                collections,
                functions,
                compiler,
                locations,
                collection_notifier,
                settings,
                bindings: RefCell::new(FxHashMap::default()),
                cell_watchers: RefCell::new(FxHashMap::default()),
                hooks: RefCell::new(FxHashMap::default()),
                executing: RefCell::new(Vec::new()),
                stats: StdCell::new(RecalcStats::new()),
                cycle_reports: RefCell::new(Vec::new()),
                store_listener,
                this: weak.clone(),
            }
        });

        for cell in manager.store.all_cells() {
            manager.monitor(cell);
        }
        manager
    }

    pub fn stats(&self) -> RecalcStats {
        self.stats.get()
    }

    pub fn cycle_reports(&self) -> Vec<CycleReport> {
        self.cycle_reports.borrow().clone()
    }

    pub fn is_bound(&self, cell: CellId) -> bool {
        self.bindings.borrow().contains_key(&cell)
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.borrow().len()
    }

    pub fn bound_channels(&self, cell: CellId) -> Option<BoundChannels> {
        self.bindings.borrow().get(&cell).map(|b| BoundChannels {
            function: b.function.clone(),
            locations: b.locations.clone(),
            collections: b.collections.clone(),
        })
    }

    /// True while `cell`'s populate function is on the execution stack.
    pub fn is_executing(&self, cell: CellId) -> bool {
        self.executing.borrow().contains(&cell)
    }

    /// Number of cells hooked to `function`'s change events.
    pub fn function_hook_count(&self, function: &str) -> usize {
        self.hooks.borrow().get(function).map(|h| h.cells).unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Cell monitoring
    // -------------------------------------------------------------------------

    fn on_store_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::CellAdded { cell, .. } => self.monitor(*cell),
            StoreEvent::CellRemoved { cell, .. } => self.forget(*cell),
            // The cell's own Location change already triggered a rebind
            StoreEvent::CellMoved { .. } => {}
        }
    }

    fn monitor(&self, cell: CellId) {
        let this = self.this.clone();
        let listener = self.store.watch(cell, move |event| {
            if let Some(this) = this.upgrade() {
                this.on_cell_change(event);
            }
        });
        if let Some(listener) = listener {
            self.cell_watchers.borrow_mut().insert(cell, listener);
        }
        self.rebind(cell);
    }

    fn forget(&self, cell: CellId) {
        // The store drops the cell's listeners on removal
        self.cell_watchers.borrow_mut().remove(&cell);
        self.unbind(cell);
    }

    fn on_cell_change(&self, event: &CellChangeEvent) {
        let cell = event.cell;
        match &event.change {
            CellChange::PopulateFunction { .. } | CellChange::Location { .. } => self.rebind(cell),
            CellChange::Text { .. } => {
                let reads_own_text = self
                    .bindings
                    .borrow()
                    .get(&cell)
                    .is_some_and(|b| b.reads_own_text);
                if reads_own_text && !self.is_executing(cell) {
                    self.rebind(cell);
                }
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    /// Rebuild `cell`'s subscriptions from its current function and location.
    pub fn rebind(&self, cell: CellId) {
        let Some((location, text, name)) = self.store.with_cell(cell, |c| {
            (c.location.clone(), c.text.clone(), c.populate_function.clone())
        }) else {
            self.unbind(cell);
            return;
        };
        let Some(name) = name else {
            self.unbind(cell);
            return;
        };

        let function = self.functions.get_or_create(FunctionKind::Populate, &name);
        let deps = function.dependencies();

        let mut seen = FxHashSet::default();
        let mut locations = Vec::new();
        for r in &deps.locations {
            for loc in r.resolve(Some(&location), self.settings.max_range_cells) {
                if loc != location && seen.insert(loc.clone()) {
                    locations.push(loc);
                }
            }
        }
        if self.settings.watch_own_location {
            locations.push(location.clone());
        }

        let mut collections = Vec::new();
        for r in &deps.collections {
            if let Some(name) = r.resolve(Some(&text)) {
                if !collections.contains(&name) {
                    collections.push(name);
                }
            }
        }

        let previous = self.bindings.borrow_mut().remove(&cell);
        let proxy = match &previous {
            Some(b) => b.proxy.clone(),
            None => {
                let proxy: Rc<dyn Subscriber> = Rc::new(CellProxy {
                    manager: self.this.clone(),
                    cell,
                });
                proxy
            }
        };
        let (old_function, old_locations, old_collections) = match previous {
            Some(b) => (Some(b.function), b.locations, b.collections),
            None => (None, Vec::new(), Vec::new()),
        };

        self.bindings.borrow_mut().insert(
            cell,
            Binding {
                proxy: proxy.clone(),
                function: name.clone(),
                locations: locations.clone(),
                collections: collections.clone(),
                reads_own_text: deps.has_dynamic_collections(),
            },
        );

        if old_function.as_deref() != Some(name.as_str()) {
            self.hook_function(&name, function);
            if let Some(old) = old_function {
                self.unhook_function(&old);
            }
        }

        for loc in old_locations.iter().filter(|l| !locations.contains(l)) {
            self.locations.unsubscribe(&proxy, loc);
        }
        for loc in locations.iter().filter(|l| !old_locations.contains(l)) {
            self.locations.subscribe(&proxy, loc.clone());
        }
        for name in old_collections.iter().filter(|c| !collections.contains(c)) {
            self.collection_notifier.unsubscribe(&proxy, name);
        }
        for name in collections.iter().filter(|c| !old_collections.contains(c)) {
            self.collection_notifier.subscribe(&proxy, name);
        }

        log::debug!(
            "bound {} at {} to '{}': {} locations, {} collections",
            cell,
            location,
            name,
            locations.len(),
            collections.len()
        );

        if self.settings.populate_on_bind {
            self.recalculate(cell);
        }
    }

    /// Drop every subscription `cell` holds.
    pub fn unbind(&self, cell: CellId) {
        let Some(binding) = self.bindings.borrow_mut().remove(&cell) else {
            return;
        };
        self.locations.unsubscribe_all(&binding.proxy);
        self.collection_notifier.unsubscribe_all(&binding.proxy);
        self.unhook_function(&binding.function);
        log::debug!("unbound {}", cell);
    }

    fn hook_function(&self, name: &str, function: Rc<CellFunction>) {
        if let Some(hook) = self.hooks.borrow_mut().get_mut(name) {
            hook.cells += 1;
            return;
        }

        let this = self.this.clone();
        let listener = function.on_change(move |event| {
            let FunctionEvent::DependenciesChanged { name } = event;
            if let Some(this) = this.upgrade() {
                this.on_function_changed(name);
            }
        });
        self.hooks.borrow_mut().insert(
            name.to_string(),
            FunctionHook {
                function,
                listener,
                cells: 1,
            },
        );
    }

    fn unhook_function(&self, name: &str) {
        let mut hooks = self.hooks.borrow_mut();
        let Some(hook) = hooks.get_mut(name) else {
            return;
        };
        hook.cells -= 1;
        if hook.cells == 0 {
            if let Some(hook) = hooks.remove(name) {
                hook.function.events().remove(hook.listener);
            }
        }
    }

    fn on_function_changed(&self, name: &str) {
        let mut cells: Vec<CellId> = self
            .bindings
            .borrow()
            .iter()
            .filter(|(_, b)| b.function == name)
            .map(|(id, _)| *id)
            .collect();
        cells.sort();
        for cell in cells {
            self.rebind(cell);
        }
    }

    // -------------------------------------------------------------------------
    // Recalculation
    // -------------------------------------------------------------------------

    /// Run `cell`'s populate function now and write the result back.
    ///
    /// Returns false when nothing ran (no function, or dropped by the
    /// re-entrancy guard).
    pub fn recalculate(&self, cell: CellId) -> bool {
        if !self.enter(cell) {
            return false;
        }

        let ran = self.run_and_apply(cell);

        self.executing.borrow_mut().pop();
        ran
    }

    /// Recalculate every bound cell, in id order.
    pub fn recalculate_all(&self) -> usize {
        let mut cells: Vec<CellId> = self.bindings.borrow().keys().copied().collect();
        cells.sort();
        let changed = cells.into_iter().filter(|c| self.recalculate(*c)).count();
        log::debug!("{}", self.stats.get().log_line());
        changed
    }

    /// Push `cell` onto the executing stack, or report why not.
    fn enter(&self, cell: CellId) -> bool {
        let path = {
            let executing = self.executing.borrow();
            match executing.iter().position(|c| *c == cell) {
                None => None,
                Some(pos) if pos + 1 == executing.len() => {
                    log::trace!("dropped self-echo for {}", cell);
                    return false;
                }
                Some(pos) => Some(executing[pos..].to_vec()),
            }
        };

        let Some(mut path) = path else {
            self.executing.borrow_mut().push(cell);
            return true;
        };

        let mut stats = self.stats.get();
        stats.reentrant_skips += 1;
        path.push(cell);
        let report = CycleReport::cycle(path);
        log::debug!("re-entrant recalculation dropped: {}", report);

        if self.settings.cycle_policy == CyclePolicy::Report {
            stats.cycles_reported += 1;
            log::warn!("{}", report);
            let mut reports = self.cycle_reports.borrow_mut();
            if reports.len() < self.settings.max_cycle_reports {
                reports.push(report);
            }
        }
        self.stats.set(stats);
        false
    }

    fn run_and_apply(&self, cell: CellId) -> bool {
        let Some((name, kind)) = self
            .store
            .with_cell(cell, |c| (c.populate_function.clone(), c.kind))
        else {
            return false;
        };
        let Some(name) = name else {
            return false;
        };

        let function = self.functions.get_or_create(FunctionKind::Populate, &name);
        let ctx = ExecutionContext::for_cell(&self.store, &self.collections, cell)
            .with_max_range_cells(self.settings.max_range_cells);
        let result = function.run(self.compiler.as_ref(), &ctx);

        let mut stats = self.stats.get();
        stats.runs += 1;
        if result.is_err() {
            stats.failures += 1;
        }
        self.stats.set(stats);

        // Writes below only fail if a listener removed the cell mid-run.
        match result {
            Ok(value) => {
                log::trace!("{} = {:?}", cell, value);
                let _ = match kind {
                    CellKind::Collection => self.store.set_populate_result(cell, Some(value)),
                    CellKind::Plain => self.store.set_text(cell, &value.to_text()),
                };
                let _ = self.store.set_error(cell, None);
            }
            Err(e) => {
                log::debug!("populate '{}' failed for {}: {}", name, cell, e);
                let marker = match e {
                    FunctionError::Compile(_) => COMPILE_ERROR_TEXT,
                    FunctionError::Runtime(_) | FunctionError::Panicked(_) => RUN_ERROR_TEXT,
                };
                let _ = self.store.set_error(cell, Some(e.to_string()));
                let _ = match kind {
                    CellKind::Collection => self.store.set_populate_result(cell, None),
                    CellKind::Plain => self.store.set_text(cell, marker),
                };
            }
        }
        true
    }
}

impl Drop for PopulateManager {
    fn drop(&mut self) {
        self.store.events().remove(self.store_listener);
        for (cell, listener) in self.cell_watchers.borrow_mut().drain() {
            self.store.unwatch(cell, listener);
        }
        for (_, hook) in self.hooks.borrow_mut().drain() {
            hook.function.events().remove(hook.listener);
        }
        for (_, binding) in self.bindings.borrow_mut().drain() {
            self.locations.unsubscribe_all(&binding.proxy);
            self.collection_notifier.unsubscribe_all(&binding.proxy);
        }
    }
}
