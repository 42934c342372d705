//! What a running function can see and do.

use crate::cell::Value;
use crate::cell_id::{CellId, Location};
use crate::collection::CollectionStore;
use crate::refs::parse_reference;
use crate::store::CellStore;

/// Default cap on cells returned by one `range()` read.
pub const DEFAULT_MAX_RANGE_CELLS: usize = 10_000;

/// Sheet that unqualified references fall back to without a caller.
pub const DEFAULT_SHEET: &str = "Sheet1";

/// The edit that fired a trigger function.
#[derive(Debug, Clone, PartialEq)]
pub struct EditContext {
    pub property: String,
    pub old: Value,
    pub new: Value,
}

/// Execution environment passed to every compiled function invocation.
///
/// References are resolved relative to the calling cell's location, so the
/// same `cell("R[-1]C")` reads a different cell for every caller.
pub struct ExecutionContext<'a> {
    store: &'a CellStore,
    collections: &'a CollectionStore,
    caller: Option<CellId>,
    location: Option<Location>,
    index: Option<usize>,
    source_collection: Option<String>,
    edit: Option<EditContext>,
    max_range_cells: usize,
    default_sheet: String,
}

impl<'a> ExecutionContext<'a> {
    /// A context with no caller. Relative references fail to resolve;
    /// absolute ones land on the default sheet.
    pub fn new(store: &'a CellStore, collections: &'a CollectionStore) -> Self {
        Self {
            store,
            collections,
            caller: None,
            location: None,
            index: None,
            source_collection: None,
            edit: None,
            max_range_cells: DEFAULT_MAX_RANGE_CELLS,
            default_sheet: DEFAULT_SHEET.to_string(),
        }
    }

    /// A context for a function running on behalf of `cell`.
    pub fn for_cell(store: &'a CellStore, collections: &'a CollectionStore, cell: CellId) -> Self {
        let mut ctx = Self::new(store, collections);
        ctx.location = store.location(cell);
        ctx.caller = Some(cell);
        ctx
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_edit(mut self, edit: EditContext) -> Self {
        self.edit = Some(edit);
        self
    }

    /// Collection that `item()` reads from, at `index`.
    pub fn with_source_collection(mut self, name: impl Into<String>) -> Self {
        self.source_collection = Some(name.into());
        self
    }

    pub fn with_max_range_cells(mut self, max: usize) -> Self {
        self.max_range_cells = max;
        self
    }

    pub fn with_default_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.default_sheet = sheet.into();
        self
    }

    pub fn caller(&self) -> Option<CellId> {
        self.caller
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn edit(&self) -> Option<&EditContext> {
        self.edit.as_ref()
    }

    /// The calling cell's text (empty without a caller).
    pub fn caller_text(&self) -> String {
        self.caller
            .and_then(|id| self.store.text(id))
            .unwrap_or_default()
    }

    /// Value of the single location named by `reference`.
    pub fn cell(&self, reference: &str) -> Result<Value, String> {
        let r = parse_reference(reference).map_err(|e| e.to_string())?;
        if r.is_range() {
            return Err(format!("cell(\"{reference}\") names a range, use range()"));
        }
        match r.resolve_in(self.location.as_ref(), Some(&self.default_sheet), 1).first() {
            Some(loc) => Ok(self.cell_at(loc)),
            None => Err(format!("reference '{reference}' does not resolve here")),
        }
    }

    pub fn cell_at(&self, location: &Location) -> Value {
        self.store.value_at(location)
    }

    /// Values of every location in `reference`, row-major.
    pub fn range(&self, reference: &str) -> Result<Value, String> {
        let r = parse_reference(reference).map_err(|e| e.to_string())?;
        let locations = r.resolve_in(self.location.as_ref(), Some(&self.default_sheet), self.max_range_cells);
        if locations.is_empty() {
            return Err(format!("reference '{reference}' does not resolve here"));
        }
        Ok(Value::List(locations.iter().map(|loc| self.cell_at(loc)).collect()))
    }

    /// Items of a named collection. A missing collection reads as empty.
    pub fn collection(&self, name: &str) -> Value {
        Value::List(self.collections.values(name).unwrap_or_default())
    }

    /// Items of the collection named by the calling cell's text.
    pub fn own_collection(&self) -> Result<Value, String> {
        let name = self.caller_text();
        let name = name.trim();
        if name.is_empty() {
            return Err("the calling cell does not name a collection".to_string());
        }
        Ok(self.collection(name))
    }

    /// The item being ranked, or Empty outside a collection context.
    pub fn item(&self) -> Value {
        match (&self.source_collection, self.index) {
            (Some(name), Some(index)) => self.collections.value_at(name, index).unwrap_or_default(),
            _ => Value::Empty,
        }
    }

    /// Write `text` into the cell at `reference`, creating the cell if the
    /// location is empty.
    pub fn set_text(&self, reference: &str, text: &str) -> Result<(), String> {
        let r = parse_reference(reference).map_err(|e| e.to_string())?;
        if r.is_range() {
            return Err(format!("set(\"{reference}\") names a range"));
        }
        let Some(location) = r.resolve_in(self.location.as_ref(), Some(&self.default_sheet), 1).into_iter().next() else {
            return Err(format!("reference '{reference}' does not resolve here"));
        };

        match self.store.at(&location) {
            Some(id) => self.store.set_text(id, text).map(|_| ()).map_err(|e| e.to_string()),
            None => self
                .store
                .insert_text(location, text)
                .map(|_| ())
                .map_err(|e| e.to_string()),
        }
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("caller", &self.caller)
            .field("location", &self.location)
            .field("index", &self.index)
            .field("edit", &self.edit)
            .finish()
    }
}
