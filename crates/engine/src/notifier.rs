//! Change notifiers: subscription registries bound to real event sources.
//!
//! `LocationNotifier` publishes "value changed at location L" and
//! `CollectionNotifier` publishes "collection C mutated". Each only listens
//! to the underlying store while the channel is open, so an unwatched cell
//! or collection costs nothing.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell_id::{CellId, Location};
use crate::collection::CollectionStore;
use crate::events::{ListenerId, StoreEvent};
use crate::registry::{ChannelEvent, Subscriber, SubscriptionRegistry};
use crate::store::CellStore;

// =============================================================================
// Locations
// =============================================================================

pub struct LocationNotifier {
    store: Rc<CellStore>,
    registry: SubscriptionRegistry<Location>,
    /// Open channels with a cell under them, and the listener on that cell
    attached: RefCell<FxHashMap<Location, (CellId, ListenerId)>>,
    /// Open channels whose location is currently empty
    pending: RefCell<FxHashSet<Location>>,
    store_listener: ListenerId,
    this: Weak<Self>,
}

impl std::fmt::Debug for LocationNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationNotifier")
            .field("channels", &self.registry.channel_count())
            .field("attached", &self.attached.borrow().len())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

impl LocationNotifier {
    pub fn new(store: Rc<CellStore>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<Self>| {
            let registry = SubscriptionRegistry::<Location>::new();
            let w = weak.clone();
            registry.on_lifecycle(move |event| {
                if let Some(this) = w.upgrade() {
                    match event {
                        ChannelEvent::Opened(loc) => this.open(loc),
                        ChannelEvent::Closed(loc) => this.close(loc),
                    }
                }
            });

            let w = weak.clone();
            let store_listener = store.events().add(move |event| {
                if let Some(this) = w.upgrade() {
                    this.on_store_event(event);
                }
            });

            Self {
                store,
                registry,
                attached: RefCell::new(FxHashMap::default()),
                pending: RefCell::new(FxHashSet::default()),
                store_listener,
                this: weak.clone(),
            }
        })
    }

    pub fn subscribe(&self, subscriber: &Rc<dyn Subscriber>, location: Location) -> usize {
        self.registry.subscribe(subscriber, location)
    }

    pub fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>, location: &Location) -> bool {
        self.registry.unsubscribe(subscriber, location)
    }

    pub fn unsubscribe_all(&self, subscriber: &Rc<dyn Subscriber>) -> usize {
        self.registry.unsubscribe_all(subscriber)
    }

    /// Tell every subscriber of `location` that its value changed.
    pub fn publish(&self, location: &Location) -> usize {
        self.registry.publish(location)
    }

    pub fn registry(&self) -> &SubscriptionRegistry<Location> {
        &self.registry
    }

    /// True when the channel is open and listening to a cell.
    pub fn is_attached(&self, location: &Location) -> bool {
        self.attached.borrow().contains_key(location)
    }

    /// True when the channel is open but nothing sits at the location.
    pub fn is_pending(&self, location: &Location) -> bool {
        self.pending.borrow().contains(location)
    }

    fn open(&self, location: &Location) {
        match self.store.at(location) {
            Some(cell) => self.attach(location, cell),
            None => {
                self.pending.borrow_mut().insert(location.clone());
            }
        }
    }

    fn close(&self, location: &Location) {
        self.detach(location);
        self.pending.borrow_mut().remove(location);
    }

    fn attach(&self, location: &Location, cell: CellId) {
        let this = self.this.clone();
        let loc = location.clone();
        let listener = self.store.watch(cell, move |event| {
            if !event.change.is_value_change() {
                return;
            }
            if let Some(this) = this.upgrade() {
                this.publish(&loc);
            }
        });
        if let Some(listener) = listener {
            self.attached
                .borrow_mut()
                .insert(location.clone(), (cell, listener));
        }
    }

    fn detach(&self, location: &Location) -> bool {
        let entry = self.attached.borrow_mut().remove(location);
        match entry {
            Some((cell, listener)) => {
                self.store.unwatch(cell, listener);
                true
            }
            None => false,
        }
    }

    fn on_store_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::CellAdded { cell, location } => self.arrive(*cell, location),
            StoreEvent::CellRemoved { location, .. } => self.leave(location),
            StoreEvent::CellMoved { cell, from, to } => {
                self.leave(from);
                self.arrive(*cell, to);
            }
        }
    }

    /// A cell appeared at `location`.
    fn arrive(&self, cell: CellId, location: &Location) {
        let was_pending = self.pending.borrow_mut().remove(location);
        if was_pending {
            self.attach(location, cell);
            self.publish(location);
        }
    }

    /// The cell at `location` went away.
    fn leave(&self, location: &Location) {
        if self.detach(location) {
            self.pending.borrow_mut().insert(location.clone());
            self.publish(location);
        }
    }
}

impl Drop for LocationNotifier {
    fn drop(&mut self) {
        self.store.events().remove(self.store_listener);
        for (_, (cell, listener)) in self.attached.borrow_mut().drain() {
            self.store.unwatch(cell, listener);
        }
    }
}

// =============================================================================
// Collections
// =============================================================================

pub struct CollectionNotifier {
    collections: Rc<CollectionStore>,
    registry: SubscriptionRegistry<String>,
    attached: RefCell<FxHashMap<String, ListenerId>>,
    this: Weak<Self>,
}

impl std::fmt::Debug for CollectionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionNotifier")
            .field("channels", &self.registry.channel_count())
            .finish()
    }
}

impl CollectionNotifier {
    pub fn new(collections: Rc<CollectionStore>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<Self>| {
            let registry = SubscriptionRegistry::<String>::new();
            let w = weak.clone();
            registry.on_lifecycle(move |event| {
                if let Some(this) = w.upgrade() {
                    match event {
                        ChannelEvent::Opened(name) => this.open(name.as_str()),
                        ChannelEvent::Closed(name) => this.close(name.as_str()),
                    }
                }
            });

            Self {
                collections,
                registry,
                attached: RefCell::new(FxHashMap::default()),
                this: weak.clone(),
            }
        })
    }

    pub fn subscribe(&self, subscriber: &Rc<dyn Subscriber>, collection: &str) -> usize {
        self.registry.subscribe(subscriber, collection.to_string())
    }

    pub fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>, collection: &str) -> bool {
        self.registry.unsubscribe(subscriber, &collection.to_string())
    }

    pub fn unsubscribe_all(&self, subscriber: &Rc<dyn Subscriber>) -> usize {
        self.registry.unsubscribe_all(subscriber)
    }

    pub fn publish(&self, collection: &str) -> usize {
        self.registry.publish(&collection.to_string())
    }

    pub fn registry(&self) -> &SubscriptionRegistry<String> {
        &self.registry
    }

    pub fn is_attached(&self, collection: &str) -> bool {
        self.attached.borrow().contains_key(collection)
    }

    fn open(&self, name: &str) {
        let this = self.this.clone();
        let channel = name.to_string();
        let listener = self.collections.watch(name, move |_| {
            if let Some(this) = this.upgrade() {
                this.registry.publish(&channel);
            }
        });
        self.attached.borrow_mut().insert(name.to_string(), listener);
    }

    fn close(&self, name: &str) {
        let listener = self.attached.borrow_mut().remove(name);
        if let Some(listener) = listener {
            self.collections.unwatch(name, listener);
        }
    }
}

impl Drop for CollectionNotifier {
    fn drop(&mut self) {
        for (name, listener) in self.attached.borrow_mut().drain() {
            self.collections.unwatch(&name, listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Value;
    use std::cell::Cell as StdCell;

    struct Counter(StdCell<usize>);

    impl Subscriber for Counter {
        fn notify(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn counter() -> (Rc<Counter>, Rc<dyn Subscriber>) {
        let c = Rc::new(Counter(StdCell::new(0)));
        let s: Rc<dyn Subscriber> = c.clone();
        (c, s)
    }

    fn loc(row: usize, col: usize) -> Location {
        Location::new("Sheet1", row, col)
    }

    #[test]
    fn test_attaches_only_while_open() {
        let store = Rc::new(CellStore::new());
        let a = store.insert_text(loc(0, 0), "1").unwrap();
        let notifier = LocationNotifier::new(store.clone());
        assert_eq!(store.watcher_count(a), 0);

        let (hits, s) = counter();
        notifier.subscribe(&s, loc(0, 0));
        assert!(notifier.is_attached(&loc(0, 0)));
        assert_eq!(store.watcher_count(a), 1);

        store.set_text(a, "2").unwrap();
        assert_eq!(hits.0.get(), 1);

        // Non-value changes are not published
        store.set_error(a, Some("x".into())).unwrap();
        assert_eq!(hits.0.get(), 1);

        notifier.unsubscribe(&s, &loc(0, 0));
        assert_eq!(store.watcher_count(a), 0);
        store.set_text(a, "3").unwrap();
        assert_eq!(hits.0.get(), 1);
    }

    #[test]
    fn test_populate_result_is_a_value_change() {
        let store = Rc::new(CellStore::new());
        let a = store.insert_text(loc(0, 0), "").unwrap();
        let notifier = LocationNotifier::new(store.clone());
        let (hits, s) = counter();
        notifier.subscribe(&s, loc(0, 0));

        store.set_populate_result(a, Some(Value::Number(1.0))).unwrap();
        assert_eq!(hits.0.get(), 1);
    }

    #[test]
    fn test_pending_location_fills_in() {
        let store = Rc::new(CellStore::new());
        let notifier = LocationNotifier::new(store.clone());
        let (hits, s) = counter();

        notifier.subscribe(&s, loc(2, 2));
        assert!(notifier.is_pending(&loc(2, 2)));

        let c = store.insert_text(loc(2, 2), "x").unwrap();
        assert_eq!(hits.0.get(), 1);
        assert!(notifier.is_attached(&loc(2, 2)));

        store.set_text(c, "y").unwrap();
        assert_eq!(hits.0.get(), 2);

        store.remove(c);
        assert_eq!(hits.0.get(), 3);
        assert!(notifier.is_pending(&loc(2, 2)));
    }

    #[test]
    fn test_moves_publish_both_ends() {
        let store = Rc::new(CellStore::new());
        let c = store.insert_text(loc(0, 0), "x").unwrap();
        let notifier = LocationNotifier::new(store.clone());
        let (from_hits, from) = counter();
        let (to_hits, to) = counter();
        notifier.subscribe(&from, loc(0, 0));
        notifier.subscribe(&to, loc(5, 5));

        store.move_cell(c, loc(5, 5)).unwrap();
        assert_eq!(from_hits.0.get(), 1);
        assert_eq!(to_hits.0.get(), 1);
        assert!(notifier.is_pending(&loc(0, 0)));
        assert!(notifier.is_attached(&loc(5, 5)));

        store.set_text(c, "y").unwrap();
        assert_eq!(from_hits.0.get(), 1);
        assert_eq!(to_hits.0.get(), 2);
    }

    #[test]
    fn test_close_clears_pending() {
        let store = Rc::new(CellStore::new());
        let notifier = LocationNotifier::new(store.clone());
        let (hits, s) = counter();

        notifier.subscribe(&s, loc(1, 1));
        notifier.unsubscribe_all(&s);
        assert!(!notifier.is_pending(&loc(1, 1)));

        store.insert_text(loc(1, 1), "x").unwrap();
        assert_eq!(hits.0.get(), 0);
    }

    #[test]
    fn test_collection_notifier() {
        let collections = Rc::new(CollectionStore::new());
        let notifier = CollectionNotifier::new(collections.clone());
        let (hits, s) = counter();

        notifier.subscribe(&s, "Orders");
        assert!(notifier.is_attached("Orders"));
        assert_eq!(collections.watcher_count("Orders"), 1);

        // Created + ItemAdded
        let item = collections.push("Orders", Value::Number(1.0));
        assert_eq!(hits.0.get(), 2);
        collections.update("Orders", item, Value::Number(2.0));
        assert_eq!(hits.0.get(), 3);
        collections.push("Other", Value::Empty);
        assert_eq!(hits.0.get(), 3);

        notifier.unsubscribe(&s, "Orders");
        assert!(!notifier.is_attached("Orders"));
        assert_eq!(collections.watcher_count("Orders"), 0);
    }

    #[test]
    fn test_drop_detaches_from_store() {
        let store = Rc::new(CellStore::new());
        let a = store.insert_text(loc(0, 0), "").unwrap();
        let notifier = LocationNotifier::new(store.clone());
        let (_, s) = counter();
        notifier.subscribe(&s, loc(0, 0));
        assert_eq!(store.events().len(), 1);

        drop(notifier);
        assert_eq!(store.events().len(), 0);
        assert_eq!(store.watcher_count(a), 0);
    }
}
