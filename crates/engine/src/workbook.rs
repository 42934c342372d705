//! Workbook: the stores, notifiers and engines wired together.
//!
//! Most callers only need this type. It owns one instance of everything,
//! addresses cells by reference text (`"B3"`, `"Data!A1"`), and exposes the
//! individual components for finer control.

use std::cell::RefCell;
use std::rc::Rc;

use livegrid_config::EngineSettings;
use rustc_hash::FxHashMap;

use crate::cell::{CellKind, Value};
use crate::cell_id::{CellId, Location};
use crate::collection::CollectionStore;
use crate::compiler::SourceCompiler;
use crate::function::{CellFunction, FunctionKind, FunctionStore};
use crate::notifier::{CollectionNotifier, LocationNotifier};
use crate::populate::PopulateManager;
use crate::recalc::{CycleReport, RecalcStats};
use crate::refs::{parse_reference, ReferenceError};
use crate::sorted_view::SortedView;
use crate::store::{CellStore, StoreError};
use crate::trigger::TriggerManager;

pub use crate::context::DEFAULT_SHEET;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkbookError {
    Reference(ReferenceError),
    /// The address is relative or a range; workbook calls need one absolute cell.
    NotACell(String),
    Store(StoreError),
}

impl std::fmt::Display for WorkbookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reference(e) => write!(f, "{e}"),
            Self::NotACell(addr) => write!(f, "'{addr}' is not a single absolute cell"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WorkbookError {}

impl From<ReferenceError> for WorkbookError {
    fn from(e: ReferenceError) -> Self {
        Self::Reference(e)
    }
}

impl From<StoreError> for WorkbookError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

pub struct Workbook {
    settings: EngineSettings,
    default_sheet: RefCell<String>,
    store: Rc<CellStore>,
    collections: Rc<CollectionStore>,
    functions: Rc<FunctionStore>,
    compiler: Rc<dyn SourceCompiler>,
    locations: Rc<LocationNotifier>,
    collection_notifier: Rc<CollectionNotifier>,
    populate: Rc<PopulateManager>,
    triggers: Rc<TriggerManager>,
    views: RefCell<FxHashMap<String, Rc<SortedView>>>,
}

impl std::fmt::Debug for Workbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workbook")
            .field("cells", &self.store.len())
            .field("collections", &self.collections.names().len())
            .field("functions", &self.functions.len())
            .field("views", &self.views.borrow().len())
            .finish()
    }
}

impl Workbook {
    /// Create an empty workbook with default settings.
    pub fn new(compiler: Rc<dyn SourceCompiler>) -> Self {
        Self::with_settings(compiler, EngineSettings::default())
    }

    pub fn with_settings(compiler: Rc<dyn SourceCompiler>, settings: EngineSettings) -> Self {
        Self::from_parts(
            Rc::new(CellStore::new()),
            Rc::new(CollectionStore::new()),
            Rc::new(FunctionStore::new()),
            compiler,
            settings,
        )
    }

    /// Wire engines around existing stores. Cells already present are bound
    /// (and, with `recalc.populateOnBind`, computed) immediately.
    pub fn from_parts(
        store: Rc<CellStore>,
        collections: Rc<CollectionStore>,
        functions: Rc<FunctionStore>,
        compiler: Rc<dyn SourceCompiler>,
        settings: EngineSettings,
    ) -> Self {
        let locations = LocationNotifier::new(store.clone());
        let collection_notifier = CollectionNotifier::new(collections.clone());
        let populate = PopulateManager::new(
            store.clone(),
            collections.clone(),
            functions.clone(),
            compiler.clone(),
            locations.clone(),
            collection_notifier.clone(),
            settings.clone(),
        );
        let triggers = TriggerManager::new(
            store.clone(),
            collections.clone(),
            functions.clone(),
            compiler.clone(),
            settings.max_range_cells,
        );

        Self {
            settings,
            default_sheet: RefCell::new(DEFAULT_SHEET.to_string()),
            store,
            collections,
            functions,
            compiler,
            locations,
            collection_notifier,
            populate,
            triggers,
            views: RefCell::new(FxHashMap::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Rc<CellStore> {
        &self.store
    }

    pub fn collections(&self) -> &Rc<CollectionStore> {
        &self.collections
    }

    pub fn functions(&self) -> &Rc<FunctionStore> {
        &self.functions
    }

    pub fn compiler(&self) -> &Rc<dyn SourceCompiler> {
        &self.compiler
    }

    pub fn location_notifier(&self) -> &Rc<LocationNotifier> {
        &self.locations
    }

    pub fn collection_notifier(&self) -> &Rc<CollectionNotifier> {
        &self.collection_notifier
    }

    pub fn populate(&self) -> &Rc<PopulateManager> {
        &self.populate
    }

    pub fn triggers(&self) -> &Rc<TriggerManager> {
        &self.triggers
    }

    pub fn recalc_stats(&self) -> RecalcStats {
        self.populate.stats()
    }

    pub fn cycle_reports(&self) -> Vec<CycleReport> {
        self.populate.cycle_reports()
    }

    // -------------------------------------------------------------------------
    // Addressing
    // -------------------------------------------------------------------------

    pub fn default_sheet(&self) -> String {
        self.default_sheet.borrow().clone()
    }

    pub fn set_default_sheet(&self, sheet: &str) {
        *self.default_sheet.borrow_mut() = sheet.to_string();
    }

    /// Resolve an absolute single-cell address such as `B3` or `Data!R2C1`.
    pub fn location(&self, address: &str) -> Result<Location, WorkbookError> {
        let r = parse_reference(address)?;
        if r.is_range() || r.is_relative() {
            return Err(WorkbookError::NotACell(address.to_string()));
        }
        let sheet = r.sheet.clone().unwrap_or_else(|| self.default_sheet());
        let base = Location::new(sheet, 0, 0);
        r.resolve(Some(&base), 1)
            .into_iter()
            .next()
            .ok_or_else(|| WorkbookError::NotACell(address.to_string()))
    }

    pub fn cell_at(&self, address: &str) -> Option<CellId> {
        self.location(address).ok().and_then(|loc| self.store.at(&loc))
    }

    fn cell_or_insert(&self, address: &str, kind: CellKind) -> Result<CellId, WorkbookError> {
        let location = self.location(address)?;
        match self.store.at(&location) {
            Some(id) => Ok(id),
            None => Ok(self.store.insert(location, kind)?),
        }
    }

    // -------------------------------------------------------------------------
    // Cells
    // -------------------------------------------------------------------------

    /// Set a cell's text, creating a plain cell if the location is empty.
    pub fn set_text(&self, address: &str, text: &str) -> Result<CellId, WorkbookError> {
        let id = self.cell_or_insert(address, CellKind::Plain)?;
        self.store.set_text(id, text)?;
        Ok(id)
    }

    /// Create a collection-typed cell (or return the existing cell).
    pub fn collection_cell(&self, address: &str, collection: &str) -> Result<CellId, WorkbookError> {
        let id = self.cell_or_insert(address, CellKind::Collection)?;
        self.store.set_text(id, collection)?;
        Ok(id)
    }

    pub fn set_populate(&self, address: &str, function: Option<&str>) -> Result<CellId, WorkbookError> {
        let id = self.cell_or_insert(address, CellKind::Plain)?;
        self.store.set_populate_function(id, function)?;
        Ok(id)
    }

    pub fn set_trigger(&self, address: &str, function: Option<&str>) -> Result<CellId, WorkbookError> {
        let id = self.cell_or_insert(address, CellKind::Plain)?;
        self.store.set_trigger_function(id, function)?;
        Ok(id)
    }

    pub fn move_cell(&self, from: &str, to: &str) -> Result<bool, WorkbookError> {
        let from = self.location(from)?;
        let to = self.location(to)?;
        let Some(id) = self.store.at(&from) else {
            return Ok(false);
        };
        Ok(self.store.move_cell(id, to)?)
    }

    pub fn remove_cell(&self, address: &str) -> bool {
        self.cell_at(address)
            .and_then(|id| self.store.remove(id))
            .is_some()
    }

    pub fn text(&self, address: &str) -> Option<String> {
        self.cell_at(address).and_then(|id| self.store.text(id))
    }

    pub fn value(&self, address: &str) -> Value {
        self.location(address)
            .map(|loc| self.store.value_at(&loc))
            .unwrap_or_default()
    }

    pub fn error(&self, address: &str) -> Option<String> {
        self.cell_at(address).and_then(|id| self.store.error(id))
    }

    // -------------------------------------------------------------------------
    // Functions and views
    // -------------------------------------------------------------------------

    /// Create or update a function. Bound cells follow automatically.
    pub fn define_function(&self, kind: FunctionKind, name: &str, source: &str) -> Rc<CellFunction> {
        self.functions.define(kind, name, source)
    }

    /// Create (or replace) the sorted view `name` over collection `base`.
    pub fn create_sorted_view(&self, name: &str, base: &str, rank_function: &str) -> Rc<SortedView> {
        let rank = self.functions.get_or_create(FunctionKind::Rank, rank_function);
        let view = SortedView::new(
            base,
            rank,
            self.store.clone(),
            self.collections.clone(),
            self.compiler.clone(),
            self.settings.max_range_cells,
            &self.default_sheet(),
        );
        self.views.borrow_mut().insert(name.to_string(), view.clone());
        view
    }

    pub fn sorted_view(&self, name: &str) -> Option<Rc<SortedView>> {
        self.views.borrow().get(name).cloned()
    }

    pub fn drop_sorted_view(&self, name: &str) -> bool {
        self.views.borrow_mut().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestCompiler;

    fn workbook() -> (Rc<TestCompiler>, Workbook) {
        let compiler = Rc::new(TestCompiler::new());
        let wb = Workbook::new(compiler.clone());
        (compiler, wb)
    }

    #[test]
    fn test_location_parsing() {
        let (_, wb) = workbook();
        assert_eq!(wb.location("B3").unwrap(), Location::new("Sheet1", 2, 1));
        assert_eq!(wb.location("Data!R1C1").unwrap(), Location::new("Data", 0, 0));
        assert!(matches!(wb.location("R[-1]C"), Err(WorkbookError::NotACell(_))));
        assert!(matches!(wb.location("A1:B2"), Err(WorkbookError::NotACell(_))));
        assert!(matches!(wb.location("??"), Err(WorkbookError::Reference(_))));

        wb.set_default_sheet("Other");
        assert_eq!(wb.location("A1").unwrap().sheet, "Other");
    }

    #[test]
    fn test_end_to_end() {
        let (compiler, wb) = workbook();
        let src = r#"return cell("A1") * 2"#;
        compiler.define(src, |ctx| {
            ctx.cell("A1")?
                .as_number()
                .map(|n| Value::Number(n * 2.0))
                .ok_or_else(|| "not a number".to_string())
        });
        wb.define_function(FunctionKind::Populate, "double", src);

        wb.set_text("A1", "21").unwrap();
        wb.set_populate("B1", Some("double")).unwrap();
        assert_eq!(wb.text("B1").as_deref(), Some("42"));
        assert_eq!(wb.value("B1"), Value::Number(42.0));

        wb.set_text("A1", "x").unwrap();
        assert_eq!(wb.error("B1").as_deref(), Some("not a number"));
        assert_eq!(wb.recalc_stats().failures, 1);
    }

    #[test]
    fn test_sorted_view_registry() {
        let (compiler, wb) = workbook();
        compiler.define("return item()", |ctx| Ok(ctx.item()));
        wb.define_function(FunctionKind::Rank, "asc", "return item()");
        wb.collections().push("S", Value::Number(2.0));
        wb.collections().push("S", Value::Number(1.0));

        let view = wb.create_sorted_view("sorted", "S", "asc");
        assert_eq!(view.values(), vec![Value::Number(1.0), Value::Number(2.0)]);
        assert!(wb.sorted_view("sorted").is_some());
        assert!(wb.drop_sorted_view("sorted"));
        assert!(wb.sorted_view("sorted").is_none());
    }

    #[test]
    fn test_move_and_remove() {
        let (_, wb) = workbook();
        wb.set_text("A1", "x").unwrap();
        assert!(wb.move_cell("A1", "C3").unwrap());
        assert_eq!(wb.text("C3").as_deref(), Some("x"));
        assert!(wb.text("A1").is_none());
        assert!(!wb.move_cell("A1", "D4").unwrap());

        wb.set_text("D4", "y").unwrap();
        assert!(matches!(
            wb.move_cell("C3", "D4"),
            Err(WorkbookError::Store(StoreError::LocationOccupied(_)))
        ));
        assert!(wb.remove_cell("C3"));
        assert!(!wb.remove_cell("C3"));
    }
}
