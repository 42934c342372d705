//! Generic ref-counted publish/subscribe registry.
//!
//! A channel is any hashable key. Subscribing the same subscriber to the
//! same channel twice bumps a count; it takes two unsubscribes to let go.
//! A channel exists exactly while at least one subscriber holds it, and the
//! registry announces the transitions through `ChannelEvent::Opened` and
//! `ChannelEvent::Closed` so adapters can attach to the real event sources
//! lazily.
//!
//! Subscriber identity is the address of its `Rc` allocation.

use std::cell::RefCell;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::events::{ListenerId, Listeners};

/// Anything that can be told "something you depend on changed".
pub trait Subscriber {
    fn notify(&self);
}

/// Identity of a subscriber, derived from its allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(usize);

impl SubscriberId {
    pub fn of(subscriber: &Rc<dyn Subscriber>) -> Self {
        Self(Rc::as_ptr(subscriber) as *const () as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent<C> {
    Opened(C),
    Closed(C),
}

struct Entry {
    id: SubscriberId,
    subscriber: Rc<dyn Subscriber>,
    count: usize,
}

struct RegistryInner<C> {
    /// Subscribers per channel, in subscription order.
    channels: FxHashMap<C, Vec<Entry>>,
    /// Channels per subscriber, in subscription order.
    by_subscriber: FxHashMap<SubscriberId, Vec<C>>,
}

impl<C> Default for RegistryInner<C> {
    fn default() -> Self {
        Self {
            channels: FxHashMap::default(),
            by_subscriber: FxHashMap::default(),
        }
    }
}

pub struct SubscriptionRegistry<C> {
    inner: RefCell<RegistryInner<C>>,
    lifecycle: Listeners<ChannelEvent<C>>,
}

impl<C> Default for SubscriptionRegistry<C> {
    fn default() -> Self {
        Self {
            inner: RefCell::new(RegistryInner::default()),
            lifecycle: Listeners::new(),
        }
    }
}

impl<C: Debug> Debug for SubscriptionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &inner.channels.len())
            .field("subscribers", &inner.by_subscriber.len())
            .finish()
    }
}

impl<C: Clone + Eq + Hash + Debug> SubscriptionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to channel opened/closed events.
    pub fn on_lifecycle(&self, callback: impl Fn(&ChannelEvent<C>) + 'static) -> ListenerId {
        self.lifecycle.add(callback)
    }

    pub fn remove_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.lifecycle.remove(id)
    }

    /// Add one reference from `subscriber` to `channel`. Returns the new count.
    pub fn subscribe(&self, subscriber: &Rc<dyn Subscriber>, channel: C) -> usize {
        let id = SubscriberId::of(subscriber);
        let (count, opened) = {
            let mut inner = self.inner.borrow_mut();
            let opened = !inner.channels.contains_key(&channel);
            let entries = inner.channels.entry(channel.clone()).or_default();

            let count = match entries.iter_mut().find(|e| e.id == id) {
                Some(entry) => {
                    entry.count += 1;
                    entry.count
                }
                None => {
                    entries.push(Entry {
                        id,
                        subscriber: subscriber.clone(),
                        count: 1,
                    });
                    1
                }
            };
            if count == 1 {
                inner.by_subscriber.entry(id).or_default().push(channel.clone());
            }
            (count, opened)
        };

        if opened {
            log::debug!("channel opened: {:?}", channel);
            self.lifecycle.emit(&ChannelEvent::Opened(channel));
        }
        count
    }

    /// Drop one reference. Returns false if there was none.
    pub fn unsubscribe(&self, subscriber: &Rc<dyn Subscriber>, channel: &C) -> bool {
        self.release(SubscriberId::of(subscriber), channel, false)
    }

    /// Drop every reference `subscriber` holds, on every channel.
    pub fn unsubscribe_all(&self, subscriber: &Rc<dyn Subscriber>) -> usize {
        let id = SubscriberId::of(subscriber);
        let channels = self
            .inner
            .borrow()
            .by_subscriber
            .get(&id)
            .cloned()
            .unwrap_or_default();
        for channel in &channels {
            self.release(id, channel, true);
        }
        channels.len()
    }

    fn release(&self, id: SubscriberId, channel: &C, all: bool) -> bool {
        let closed = {
            let mut inner = self.inner.borrow_mut();
            let Some(entries) = inner.channels.get_mut(channel) else {
                return false;
            };
            let Some(pos) = entries.iter().position(|e| e.id == id) else {
                return false;
            };

            let entry = &mut entries[pos];
            entry.count = if all { 0 } else { entry.count - 1 };
            if entry.count > 0 {
                return true;
            }
            entries.remove(pos);
            let closed = entries.is_empty();
            if closed {
                inner.channels.remove(channel);
            }

            if let Some(list) = inner.by_subscriber.get_mut(&id) {
                list.retain(|c| c != channel);
                if list.is_empty() {
                    inner.by_subscriber.remove(&id);
                }
            }
            closed
        };

        if closed {
            log::debug!("channel closed: {:?}", channel);
            self.lifecycle.emit(&ChannelEvent::Closed(channel.clone()));
        }
        true
    }

    /// Notify every subscriber of `channel` once, in subscription order.
    ///
    /// Subscribers unsubscribed by an earlier notification are skipped.
    /// Returns how many were notified.
    pub fn publish(&self, channel: &C) -> usize {
        let snapshot: Vec<(SubscriberId, Rc<dyn Subscriber>)> = match self.inner.borrow().channels.get(channel) {
            Some(entries) => entries.iter().map(|e| (e.id, e.subscriber.clone())).collect(),
            None => return 0,
        };

        let mut notified = 0;
        for (id, subscriber) in snapshot {
            if self.is_subscribed(id, channel) {
                subscriber.notify();
                notified += 1;
            }
        }
        notified
    }

    fn is_subscribed(&self, id: SubscriberId, channel: &C) -> bool {
        self.inner
            .borrow()
            .channels
            .get(channel)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }

    pub fn subscribers_of(&self, channel: &C) -> Vec<Rc<dyn Subscriber>> {
        self.inner
            .borrow()
            .channels
            .get(channel)
            .map(|entries| entries.iter().map(|e| e.subscriber.clone()).collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, subscriber: &Rc<dyn Subscriber>) -> Vec<C> {
        self.inner
            .borrow()
            .by_subscriber
            .get(&SubscriberId::of(subscriber))
            .cloned()
            .unwrap_or_default()
    }

    /// Current reference count of (subscriber, channel).
    pub fn subscription_count(&self, subscriber: &Rc<dyn Subscriber>, channel: &C) -> usize {
        let id = SubscriberId::of(subscriber);
        self.inner
            .borrow()
            .channels
            .get(channel)
            .and_then(|entries| entries.iter().find(|e| e.id == id))
            .map(|e| e.count)
            .unwrap_or(0)
    }

    pub fn has_channel(&self, channel: &C) -> bool {
        self.inner.borrow().channels.contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    /// All open channels, in no particular order.
    pub fn channels(&self) -> Vec<C> {
        self.inner.borrow().channels.keys().cloned().collect()
    }
}
