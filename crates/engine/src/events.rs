//! Change notification plumbing.
//!
//! Every mutable entity (cell store, individual cells, collections, cell
//! functions, sorted views) exposes a `Listeners<E>` list. Emission is
//! synchronous: listeners run on the caller's stack before `emit` returns.
//!
//! Listeners may add or remove listeners (including themselves) while an
//! event is being emitted. A listener removed mid-emit is not called.

use std::cell::{Cell as StdCell, RefCell};
use std::rc::Rc;

use crate::cell::Value;
use crate::cell_id::{CellId, Location};
use crate::collection::ItemId;

/// Handle returned by `Listeners::add`, used to remove the listener again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Rc<dyn Fn(&E)>;

/// An ordered list of event callbacks.
pub struct Listeners<E> {
    entries: RefCell<Vec<(ListenerId, Callback<E>)>>,
    next_id: StdCell<u64>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: StdCell::new(1),
        }
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&E) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.entries.borrow().iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Call every listener with `event`.
    ///
    /// The list is snapshotted first so callbacks can freely re-enter.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<(ListenerId, Callback<E>)> = self.entries.borrow().clone();
        for (id, callback) in snapshot {
            if self.contains(id) {
                callback(event);
            }
        }
    }
}

/// Store-level cell lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A cell was inserted. Emitted after the cell is visible in the store.
    CellAdded { cell: CellId, location: Location },
    /// A cell was removed. Emitted after the cell is gone from the store.
    CellRemoved { cell: CellId, location: Location },
    /// A cell changed location. Emitted after the move.
    CellMoved { cell: CellId, from: Location, to: Location },
}

/// A change to one property of a single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellChange {
    Text { old: String, new: String },
    PopulateFunction { old: Option<String>, new: Option<String> },
    TriggerFunction { old: Option<String>, new: Option<String> },
    Location { old: Location, new: Location },
    Error { old: Option<String>, new: Option<String> },
    PopulateResult { old: Option<Value>, new: Option<Value> },
}

impl CellChange {
    /// Property name as exposed to trigger functions.
    pub fn property(&self) -> &'static str {
        match self {
            CellChange::Text { .. } => "text",
            CellChange::PopulateFunction { .. } => "populate_function",
            CellChange::TriggerFunction { .. } => "trigger_function",
            CellChange::Location { .. } => "location",
            CellChange::Error { .. } => "error",
            CellChange::PopulateResult { .. } => "populate_result",
        }
    }

    /// True for changes that alter what other cells read from this one.
    pub fn is_value_change(&self) -> bool {
        matches!(self, CellChange::Text { .. } | CellChange::PopulateResult { .. })
    }
}

/// Emitted to the listeners of a single cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChangeEvent {
    pub cell: CellId,
    pub change: CellChange,
}

/// Emitted to the listeners of one collection name.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    Created { name: String },
    Dropped { name: String },
    ItemAdded { name: String, item: ItemId, index: usize },
    ItemRemoved { name: String, item: ItemId, index: usize },
    ItemChanged { name: String, item: ItemId, index: usize },
}

impl CollectionEvent {
    pub fn name(&self) -> &str {
        match self {
            CollectionEvent::Created { name }
            | CollectionEvent::Dropped { name }
            | CollectionEvent::ItemAdded { name, .. }
            | CollectionEvent::ItemRemoved { name, .. }
            | CollectionEvent::ItemChanged { name, .. } => name,
        }
    }
}

/// Simple event collector for testing.
///
/// `EventCollector::attach` wires a collector to any `Listeners<E>`.
#[derive(Debug)]
pub struct EventCollector<E> {
    events: Vec<E>,
}

impl<E> Default for EventCollector<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E: Clone + 'static> EventCollector<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared collector that records everything `listeners` emits.
    pub fn attach(listeners: &Listeners<E>) -> Rc<RefCell<Self>> {
        let collector = Rc::new(RefCell::new(Self::new()));
        let sink = collector.clone();
        listeners.add(move |event: &E| sink.borrow_mut().push(event.clone()));
        collector
    }

    pub fn push(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
