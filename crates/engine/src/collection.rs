//! Named collections.
//!
//! A collection is an ordered list of items, each with a stable `ItemId`
//! and a `Value`. Listeners are registered per collection *name*, so code
//! can watch a collection before it exists and keeps watching across
//! drop/re-create.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::cell::Value;
use crate::events::{CollectionEvent, ListenerId, Listeners};

/// Stable identity of a collection item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(u64);

impl ItemId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub value: Value,
}

#[derive(Default)]
struct CollectionsInner {
    collections: FxHashMap<String, Vec<Item>>,
    next_item: u64,
}

#[derive(Default)]
pub struct CollectionStore {
    inner: RefCell<CollectionsInner>,
    listeners: RefCell<FxHashMap<String, Rc<Listeners<CollectionEvent>>>>,
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStore")
            .field("collections", &self.names())
            .finish()
    }
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection. Returns false if it already exists.
    pub fn create(&self, name: &str) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.collections.contains_key(name) {
                return false;
            }
            inner.collections.insert(name.to_string(), Vec::new());
        }
        self.emit(name, CollectionEvent::Created { name: name.to_string() });
        true
    }

    /// Drop a collection and all its items.
    pub fn drop_collection(&self, name: &str) -> bool {
        let existed = self.inner.borrow_mut().collections.remove(name).is_some();
        if existed {
            self.emit(name, CollectionEvent::Dropped { name: name.to_string() });
        }
        existed
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.borrow().collections.contains_key(name)
    }

    /// Collection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Append an item, creating the collection if needed.
    pub fn push(&self, name: &str, value: Value) -> ItemId {
        if !self.exists(name) {
            self.create(name);
        }
        let (item, index) = {
            let mut inner = self.inner.borrow_mut();
            inner.next_item += 1;
            let item = ItemId(inner.next_item);
            let items = inner.collections.entry(name.to_string()).or_default();
            items.push(Item { id: item, value });
            (item, items.len() - 1)
        };
        self.emit(
            name,
            CollectionEvent::ItemAdded {
                name: name.to_string(),
                item,
                index,
            },
        );
        item
    }

    /// Remove an item. Returns its value if it was present.
    pub fn remove(&self, name: &str, item: ItemId) -> Option<Value> {
        let (index, removed) = {
            let mut inner = self.inner.borrow_mut();
            let items = inner.collections.get_mut(name)?;
            let index = items.iter().position(|i| i.id == item)?;
            (index, items.remove(index))
        };
        self.emit(
            name,
            CollectionEvent::ItemRemoved {
                name: name.to_string(),
                item,
                index,
            },
        );
        Some(removed.value)
    }

    /// Replace an item's value. Returns false if the item is unknown or unchanged.
    pub fn update(&self, name: &str, item: ItemId, value: Value) -> bool {
        let index = {
            let mut inner = self.inner.borrow_mut();
            let Some(items) = inner.collections.get_mut(name) else {
                return false;
            };
            let Some(index) = items.iter().position(|i| i.id == item) else {
                return false;
            };
            if items[index].value == value {
                return false;
            }
            items[index].value = value;
            index
        };
        self.emit(
            name,
            CollectionEvent::ItemChanged {
                name: name.to_string(),
                item,
                index,
            },
        );
        true
    }

    pub fn items(&self, name: &str) -> Option<Vec<Item>> {
        self.inner.borrow().collections.get(name).cloned()
    }

    pub fn values(&self, name: &str) -> Option<Vec<Value>> {
        self.inner
            .borrow()
            .collections
            .get(name)
            .map(|items| items.iter().map(|i| i.value.clone()).collect())
    }

    pub fn value_at(&self, name: &str, index: usize) -> Option<Value> {
        self.inner
            .borrow()
            .collections
            .get(name)
            .and_then(|items| items.get(index))
            .map(|i| i.value.clone())
    }

    pub fn value_of(&self, name: &str, item: ItemId) -> Option<Value> {
        self.inner
            .borrow()
            .collections
            .get(name)
            .and_then(|items| items.iter().find(|i| i.id == item))
            .map(|i| i.value.clone())
    }

    /// Position of `item` within the collection.
    pub fn position(&self, name: &str, item: ItemId) -> Option<usize> {
        self.inner
            .borrow()
            .collections
            .get(name)
            .and_then(|items| items.iter().position(|i| i.id == item))
    }

    pub fn len(&self, name: &str) -> usize {
        self.inner
            .borrow()
            .collections
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Listen to events of the collection called `name`.
    pub fn watch(&self, name: &str, callback: impl Fn(&CollectionEvent) + 'static) -> ListenerId {
        let listeners = self
            .listeners
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(Listeners::new()))
            .clone();
        listeners.add(callback)
    }

    pub fn unwatch(&self, name: &str, listener: ListenerId) -> bool {
        let mut map = self.listeners.borrow_mut();
        let Some(listeners) = map.get(name) else {
            return false;
        };
        let removed = listeners.remove(listener);
        if listeners.is_empty() {
            map.remove(name);
        }
        removed
    }

    pub fn watcher_count(&self, name: &str) -> usize {
        self.listeners
            .borrow()
            .get(name)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    fn emit(&self, name: &str, event: CollectionEvent) {
        let listeners = self.listeners.borrow().get(name).cloned();
        if let Some(listeners) = listeners {
            listeners.emit(&event);
        }
    }
}
