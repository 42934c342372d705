//! In-memory cell store.
//!
//! Owns every `Cell`, keyed both by stable id and by current location.
//! Engines never own cells; they observe the store's events and write
//! through the setters below.
//!
//! Setters emit a `CellChangeEvent` to the cell's own listeners only when
//! the property actually changed. No store borrow is held while listeners
//! run, so listeners may read and write the store.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::cell::{Cell, CellKind, Value};
use crate::cell_id::{CellId, Location};
use crate::events::{CellChange, CellChangeEvent, ListenerId, Listeners, StoreEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Another cell already sits at this location.
    LocationOccupied(Location),
    /// No cell with this id.
    UnknownCell(CellId),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocationOccupied(loc) => write!(f, "location {loc} is already occupied"),
            Self::UnknownCell(id) => write!(f, "unknown cell {id}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Default)]
struct StoreInner {
    cells: FxHashMap<CellId, Cell>,
    by_location: FxHashMap<Location, CellId>,
    next_id: u64,
}

#[derive(Default)]
pub struct CellStore {
    inner: RefCell<StoreInner>,
    events: Listeners<StoreEvent>,
    cell_listeners: RefCell<FxHashMap<CellId, Rc<Listeners<CellChangeEvent>>>>,
}

impl std::fmt::Debug for CellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStore").field("cells", &self.len()).finish()
    }
}

impl CellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store-level lifecycle events (added / removed / moved).
    pub fn events(&self) -> &Listeners<StoreEvent> {
        &self.events
    }

    /// Insert an empty cell at `location`.
    pub fn insert(&self, location: Location, kind: CellKind) -> Result<CellId, StoreError> {
        self.insert_cell(location, kind, String::new())
    }

    /// Insert a plain cell holding `text`.
    pub fn insert_text(&self, location: Location, text: &str) -> Result<CellId, StoreError> {
        self.insert_cell(location, CellKind::Plain, text.to_string())
    }

    fn insert_cell(&self, location: Location, kind: CellKind, text: String) -> Result<CellId, StoreError> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.by_location.contains_key(&location) {
                return Err(StoreError::LocationOccupied(location));
            }
            inner.next_id += 1;
            let id = CellId::from_raw(inner.next_id);
            let mut cell = Cell::new(id, location.clone());
            cell.kind = kind;
            cell.text = text;
            inner.by_location.insert(location.clone(), id);
            inner.cells.insert(id, cell);
            id
        };

        self.events.emit(&StoreEvent::CellAdded { cell: id, location });
        Ok(id)
    }

    /// Remove a cell. Its per-cell listeners are dropped with it.
    pub fn remove(&self, id: CellId) -> Option<Cell> {
        let cell = {
            let mut inner = self.inner.borrow_mut();
            let cell = inner.cells.remove(&id)?;
            inner.by_location.remove(&cell.location);
            cell
        };
        self.cell_listeners.borrow_mut().remove(&id);

        self.events.emit(&StoreEvent::CellRemoved {
            cell: id,
            location: cell.location.clone(),
        });
        Some(cell)
    }

    pub fn get(&self, id: CellId) -> Option<Cell> {
        self.inner.borrow().cells.get(&id).cloned()
    }

    /// Borrow a cell for the duration of `f`.
    ///
    /// `f` must not write to the store.
    pub fn with_cell<R>(&self, id: CellId, f: impl FnOnce(&Cell) -> R) -> Option<R> {
        self.inner.borrow().cells.get(&id).map(f)
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.inner.borrow().cells.contains_key(&id)
    }

    /// The cell currently at `location`, if any.
    pub fn at(&self, location: &Location) -> Option<CellId> {
        self.inner.borrow().by_location.get(location).copied()
    }

    /// Value at `location` (empty when no cell is there).
    pub fn value_at(&self, location: &Location) -> Value {
        let inner = self.inner.borrow();
        inner
            .by_location
            .get(location)
            .and_then(|id| inner.cells.get(id))
            .map(Cell::value)
            .unwrap_or_default()
    }

    pub fn text(&self, id: CellId) -> Option<String> {
        self.with_cell(id, |c| c.text.clone())
    }

    pub fn error(&self, id: CellId) -> Option<String> {
        self.with_cell(id, |c| c.error.clone()).flatten()
    }

    pub fn location(&self, id: CellId) -> Option<Location> {
        self.with_cell(id, |c| c.location.clone())
    }

    /// All cell ids, in ascending order.
    pub fn all_cells(&self) -> Vec<CellId> {
        let mut ids: Vec<CellId> = self.inner.borrow().cells.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Setters
    // -------------------------------------------------------------------------

    /// Set the cell text. Returns whether it changed.
    pub fn set_text(&self, id: CellId, text: &str) -> Result<bool, StoreError> {
        self.update(id, |cell| {
            if cell.text == text {
                return None;
            }
            let old = std::mem::replace(&mut cell.text, text.to_string());
            Some(CellChange::Text {
                old,
                new: text.to_string(),
            })
        })
    }

    /// Set or clear the populate function name. Empty names clear it.
    pub fn set_populate_function(&self, id: CellId, name: Option<&str>) -> Result<bool, StoreError> {
        let name = normalize_name(name);
        self.update(id, |cell| {
            if cell.populate_function == name {
                return None;
            }
            let old = std::mem::replace(&mut cell.populate_function, name.clone());
            Some(CellChange::PopulateFunction { old, new: name })
        })
    }

    /// Set or clear the trigger function name. Empty names clear it.
    pub fn set_trigger_function(&self, id: CellId, name: Option<&str>) -> Result<bool, StoreError> {
        let name = normalize_name(name);
        self.update(id, |cell| {
            if cell.trigger_function == name {
                return None;
            }
            let old = std::mem::replace(&mut cell.trigger_function, name.clone());
            Some(CellChange::TriggerFunction { old, new: name })
        })
    }

    pub fn set_error(&self, id: CellId, error: Option<String>) -> Result<bool, StoreError> {
        self.update(id, |cell| {
            if cell.error == error {
                return None;
            }
            let old = std::mem::replace(&mut cell.error, error.clone());
            Some(CellChange::Error { old, new: error })
        })
    }

    pub fn set_populate_result(&self, id: CellId, result: Option<Value>) -> Result<bool, StoreError> {
        self.update(id, |cell| {
            if cell.populate_result == result {
                return None;
            }
            let old = std::mem::replace(&mut cell.populate_result, result.clone());
            Some(CellChange::PopulateResult { old, new: result })
        })
    }

    /// Move a cell to an empty location.
    ///
    /// Emits `CellChange::Location` to the cell's listeners, then
    /// `StoreEvent::CellMoved`.
    pub fn move_cell(&self, id: CellId, to: Location) -> Result<bool, StoreError> {
        let from = {
            let mut inner = self.inner.borrow_mut();
            let from = match inner.cells.get(&id) {
                Some(cell) => cell.location.clone(),
                None => return Err(StoreError::UnknownCell(id)),
            };
            if from == to {
                return Ok(false);
            }
            if inner.by_location.contains_key(&to) {
                return Err(StoreError::LocationOccupied(to));
            }
            inner.by_location.remove(&from);
            inner.by_location.insert(to.clone(), id);
            if let Some(cell) = inner.cells.get_mut(&id) {
                cell.location = to.clone();
            }
            from
        };

        self.emit_change(
            id,
            CellChange::Location {
                old: from.clone(),
                new: to.clone(),
            },
        );
        self.events.emit(&StoreEvent::CellMoved { cell: id, from, to });
        Ok(true)
    }

    fn update(&self, id: CellId, f: impl FnOnce(&mut Cell) -> Option<CellChange>) -> Result<bool, StoreError> {
        let change = {
            let mut inner = self.inner.borrow_mut();
            let cell = inner.cells.get_mut(&id).ok_or(StoreError::UnknownCell(id))?;
            f(cell)
        };

        match change {
            Some(change) => {
                self.emit_change(id, change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn emit_change(&self, id: CellId, change: CellChange) {
        let listeners = self.cell_listeners.borrow().get(&id).cloned();
        if let Some(listeners) = listeners {
            listeners.emit(&CellChangeEvent { cell: id, change });
        }
    }

    // -------------------------------------------------------------------------
    // Per-cell listeners
    // -------------------------------------------------------------------------

    /// Listen to changes of one cell. Returns None if the cell does not exist.
    pub fn watch(&self, id: CellId, callback: impl Fn(&CellChangeEvent) + 'static) -> Option<ListenerId> {
        if !self.contains(id) {
            return None;
        }
        let listeners = self
            .cell_listeners
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| Rc::new(Listeners::new()))
            .clone();
        Some(listeners.add(callback))
    }

    pub fn unwatch(&self, id: CellId, listener: ListenerId) -> bool {
        let mut map = self.cell_listeners.borrow_mut();
        let Some(listeners) = map.get(&id) else {
            return false;
        };
        let removed = listeners.remove(listener);
        if listeners.is_empty() {
            map.remove(&id);
        }
        removed
    }

    /// Number of listeners attached to one cell.
    pub fn watcher_count(&self, id: CellId) -> usize {
        self.cell_listeners
            .borrow()
            .get(&id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventCollector;

    fn loc(row: usize, col: usize) -> Location {
        Location::new("Sheet1", row, col)
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = CellStore::new();
        let a = store.insert_text(loc(0, 0), "5").unwrap();
        let b = store.insert(loc(0, 1), CellKind::Collection).unwrap();

        assert_ne!(a, b);
        assert_eq!(store.at(&loc(0, 0)), Some(a));
        assert_eq!(store.value_at(&loc(0, 0)), Value::Number(5.0));
        assert_eq!(store.value_at(&loc(5, 5)), Value::Empty);
        assert_eq!(store.get(b).unwrap().kind, CellKind::Collection);
        assert_eq!(store.all_cells(), vec![a, b]);
    }

    #[test]
    fn test_insert_occupied_location_fails() {
        let store = CellStore::new();
        store.insert_text(loc(0, 0), "x").unwrap();
        assert_eq!(
            store.insert_text(loc(0, 0), "y"),
            Err(StoreError::LocationOccupied(loc(0, 0)))
        );
    }

    #[test]
    fn test_store_events() {
        let store = CellStore::new();
        let events = EventCollector::attach(store.events());

        let id = store.insert_text(loc(0, 0), "").unwrap();
        store.move_cell(id, loc(1, 1)).unwrap();
        store.remove(id);

        assert_eq!(
            events.borrow().events(),
            &[
                StoreEvent::CellAdded { cell: id, location: loc(0, 0) },
                StoreEvent::CellMoved { cell: id, from: loc(0, 0), to: loc(1, 1) },
                StoreEvent::CellRemoved { cell: id, location: loc(1, 1) },
            ]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_text_emits_only_on_change() {
        let store = CellStore::new();
        let id = store.insert_text(loc(0, 0), "1").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        store.watch(id, move |e| s.borrow_mut().push(e.change.clone())).unwrap();

        assert!(store.set_text(id, "2").unwrap());
        assert!(!store.set_text(id, "2").unwrap());

        assert_eq!(
            *seen.borrow(),
            vec![CellChange::Text { old: "1".into(), new: "2".into() }]
        );
    }

    #[test]
    fn test_function_names_normalized() {
        let store = CellStore::new();
        let id = store.insert_text(loc(0, 0), "").unwrap();

        assert!(!store.set_populate_function(id, Some("  ")).unwrap());
        assert!(store.set_populate_function(id, Some("total")).unwrap());
        assert_eq!(store.get(id).unwrap().populate_function.as_deref(), Some("total"));
        assert!(store.set_populate_function(id, None).unwrap());
        assert!(!store.get(id).unwrap().has_populate_function());
    }

    #[test]
    fn test_listener_can_write_store() {
        let store = Rc::new(CellStore::new());
        let a = store.insert_text(loc(0, 0), "").unwrap();
        let b = store.insert_text(loc(0, 1), "").unwrap();

        let s = Rc::downgrade(&store);
        store
            .watch(a, move |e| {
                if let (Some(store), CellChange::Text { new, .. }) = (s.upgrade(), &e.change) {
                    store.set_text(b, &format!("copy of {new}")).unwrap();
                }
            })
            .unwrap();

        store.set_text(a, "hi").unwrap();
        assert_eq!(store.text(b).as_deref(), Some("copy of hi"));
    }

    #[test]
    fn test_move_into_occupied_fails() {
        let store = CellStore::new();
        let a = store.insert_text(loc(0, 0), "").unwrap();
        store.insert_text(loc(0, 1), "").unwrap();
        assert!(store.move_cell(a, loc(0, 1)).is_err());
        assert_eq!(store.location(a), Some(loc(0, 0)));
        assert_eq!(store.move_cell(a, loc(0, 0)), Ok(false));
    }

    #[test]
    fn test_remove_drops_watchers() {
        let store = CellStore::new();
        let id = store.insert_text(loc(0, 0), "").unwrap();
        let listener = store.watch(id, |_| {}).unwrap();
        assert_eq!(store.watcher_count(id), 1);

        store.remove(id);
        assert_eq!(store.watcher_count(id), 0);
        assert!(!store.unwatch(id, listener));
        assert!(store.watch(id, |_| {}).is_none());
        assert_eq!(store.set_text(id, "x"), Err(StoreError::UnknownCell(id)));
    }
}
