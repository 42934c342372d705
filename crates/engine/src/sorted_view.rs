//! Sorted and filtered projection of a collection.
//!
//! A `SortedView` keeps the items of a base collection that a rank function
//! accepts, ordered by ascending rank. Items with equal rank keep the order
//! in which they entered the view.
//!
//! The rank function is evaluated with the execution context's index set to
//! the item's position in the base collection, so it reads the item through
//! `item()`. Ranks are not cached: binary search re-evaluates the rank of
//! each member it compares against.
//!
//! Rank results:
//!
//! | result            | meaning                       |
//! |-------------------|-------------------------------|
//! | number            | rank (truncated to an integer)|
//! | empty / false     | excluded                      |
//! | anything else     | excluded, logged              |
//! | failure           | excluded, logged              |

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashSet;

use crate::cell::Value;
use crate::collection::{CollectionStore, ItemId};
use crate::compiler::SourceCompiler;
use crate::context::ExecutionContext;
use crate::events::{CollectionEvent, ListenerId, Listeners};
use crate::function::CellFunction;
use crate::store::CellStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortedViewEvent {
    Inserted { item: ItemId, index: usize },
    Removed { item: ItemId, index: usize },
    /// The item's order changed
    Moved { item: ItemId, from: usize, to: usize },
    /// The whole view was rebuilt
    Reset,
}

pub struct SortedView {
    base: String,
    rank: Rc<CellFunction>,
    store: Rc<CellStore>,
    collections: Rc<CollectionStore>,
    compiler: Rc<dyn SourceCompiler>,
    max_range_cells: usize,
    /// Sheet for rank references without a `Sheet!` prefix
    default_sheet: String,

    members: RefCell<Vec<ItemId>>,
    member_set: RefCell<FxHashSet<ItemId>>,
    events: Listeners<SortedViewEvent>,
    base_listener: ListenerId,
    rank_listener: ListenerId,
}

impl std::fmt::Debug for SortedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedView")
            .field("base", &self.base)
            .field("rank", &self.rank.name())
            .field("members", &self.members.borrow().len())
            .finish()
    }
}

impl SortedView {
    /// Build a view over `base` and keep it up to date.
    pub fn new(
        base: &str,
        rank: Rc<CellFunction>,
        store: Rc<CellStore>,
        collections: Rc<CollectionStore>,
        compiler: Rc<dyn SourceCompiler>,
        max_range_cells: usize,
        default_sheet: &str,
    ) -> Rc<Self> {
        let view = Rc::new_cyclic(|weak: &Weak<Self>| {
            let w = weak.clone();
            let base_listener = collections.watch(base, move |event| {
                if let Some(this) = w.upgrade() {
                    this.on_base_event(event);
                }
            });
            let w = weak.clone();
            let rank_listener = rank.on_change(move |_| {
                if let Some(this) = w.upgrade() {
                    this.rebuild();
                }
            });

            Self {
                base: base.to_string(),
                rank,
                store,
                collections,
                compiler,
                max_range_cells,
                default_sheet: default_sheet.to_string(),
                members: RefCell::new(Vec::new()),
                member_set: RefCell::new(FxHashSet::default()),
                events: Listeners::new(),
                base_listener,
                rank_listener,
            }
        });
        view.populate();
        view
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn rank_function(&self) -> &Rc<CellFunction> {
        &self.rank
    }

    pub fn events(&self) -> &Listeners<SortedViewEvent> {
        &self.events
    }

    /// Member items in view order.
    pub fn members(&self) -> Vec<ItemId> {
        self.members.borrow().clone()
    }

    /// Member values in view order.
    pub fn values(&self) -> Vec<Value> {
        self.members()
            .into_iter()
            .filter_map(|item| self.collections.value_of(&self.base, item))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }

    pub fn contains(&self, item: ItemId) -> bool {
        self.member_set.borrow().contains(&item)
    }

    pub fn index_of(&self, item: ItemId) -> Option<usize> {
        if !self.contains(item) {
            return None;
        }
        self.members.borrow().iter().position(|m| *m == item)
    }

    fn place(&self, index: usize, item: ItemId) {
        self.members.borrow_mut().insert(index, item);
        self.member_set.borrow_mut().insert(item);
    }

    fn on_base_event(&self, event: &CollectionEvent) {
        match event {
            CollectionEvent::ItemAdded { item, .. } => {
                self.insert(*item);
            }
            CollectionEvent::ItemRemoved { item, .. } => {
                self.remove(*item);
            }
            CollectionEvent::ItemChanged { item, .. } => self.on_member_changed(*item),
            CollectionEvent::Created { .. } | CollectionEvent::Dropped { .. } => self.rebuild(),
        }
    }

    /// Rank `item` and insert it. Returns its index, or None if excluded.
    pub fn insert(&self, item: ItemId) -> Option<usize> {
        if self.contains(item) {
            self.on_member_changed(item);
            return self.index_of(item);
        }
        let position = self.collections.position(&self.base, item)?;
        let rank = self.rank_at(position)?;

        let members = self.members();
        let index = self.upper_bound(&members, rank);
        self.place(index, item);
        self.events.emit(&SortedViewEvent::Inserted { item, index });
        Some(index)
    }

    /// Remove `item` from the view. Returns its former index.
    pub fn remove(&self, item: ItemId) -> Option<usize> {
        let index = self.index_of(item)?;
        self.members.borrow_mut().remove(index);
        self.member_set.borrow_mut().remove(&item);
        self.events.emit(&SortedViewEvent::Removed { item, index });
        Some(index)
    }

    /// Re-rank `item` after its value changed.
    pub fn on_member_changed(&self, item: ItemId) {
        let Some(position) = self.collections.position(&self.base, item) else {
            self.remove(item);
            return;
        };
        let rank = self.rank_at(position);

        let Some(from) = self.index_of(item) else {
            // Non-member: joins if it now passes
            if let Some(rank) = rank {
                let members = self.members();
                let index = self.upper_bound(&members, rank);
                self.place(index, item);
                self.events.emit(&SortedViewEvent::Inserted { item, index });
            }
            return;
        };
        let Some(rank) = rank else {
            self.remove(item);
            return;
        };

        let mut others = self.members();
        others.remove(from);
        if self.fits_at(&others, from, rank) {
            return;
        }

        let to = self.upper_bound(&others, rank);
        others.insert(to, item);
        *self.members.borrow_mut() = others;
        self.events.emit(&SortedViewEvent::Moved { item, from, to });
    }

    /// Recompute membership and order from scratch.
    pub fn rebuild(&self) {
        self.members.borrow_mut().clear();
        self.member_set.borrow_mut().clear();
        self.populate();
        log::debug!("sorted view over '{}' rebuilt: {} members", self.base, self.len());
        self.events.emit(&SortedViewEvent::Reset);
    }

    fn populate(&self) {
        let items = self.collections.items(&self.base).unwrap_or_default();
        for (position, entry) in items.iter().enumerate() {
            if let Some(rank) = self.rank_at(position) {
                let members = self.members();
                let index = self.upper_bound(&members, rank);
                self.place(index, entry.id);
            }
        }
    }

    /// True if `rank` belongs at `index` among `others` without moving.
    fn fits_at(&self, others: &[ItemId], index: usize, rank: i64) -> bool {
        let after_prev = index == 0 || self.member_rank(others[index - 1]).is_some_and(|r| r <= rank);
        let before_next = index >= others.len() || self.member_rank(others[index]).is_some_and(|r| rank <= r);
        after_prev && before_next
    }

    /// First index whose rank is greater than `rank`.
    fn upper_bound(&self, members: &[ItemId], rank: i64) -> usize {
        let (mut lo, mut hi) = (0, members.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.member_rank(members[mid]) {
                Some(r) if r <= rank => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    fn member_rank(&self, item: ItemId) -> Option<i64> {
        let position = self.collections.position(&self.base, item)?;
        self.rank_at(position)
    }

    /// Run the rank function for the item at `position`.
    fn rank_at(&self, position: usize) -> Option<i64> {
        let ctx = ExecutionContext::new(&self.store, &self.collections)
            .with_source_collection(self.base.clone())
            .with_index(position)
            .with_max_range_cells(self.max_range_cells)
            .with_default_sheet(self.default_sheet.clone());

        match self.rank.run(self.compiler.as_ref(), &ctx) {
            Ok(Value::Empty) | Ok(Value::Bool(false)) => None,
            Ok(Value::Number(n)) => Some(n.trunc() as i64),
            Ok(other) => match other.as_number() {
                Some(n) => Some(n.trunc() as i64),
                None => {
                    log::warn!(
                        "rank '{}' returned {:?} for '{}'[{}], excluding",
                        self.rank.name(),
                        other,
                        self.base,
                        position
                    );
                    None
                }
            },
            Err(e) => {
                log::warn!(
                    "rank '{}' failed for '{}'[{}]: {}",
                    self.rank.name(),
                    self.base,
                    position,
                    e
                );
                None
            }
        }
    }
}

impl Drop for SortedView {
    fn drop(&mut self) {
        self.collections.unwatch(&self.base, self.base_listener);
        self.rank.events().remove(self.rank_listener);
    }
}
