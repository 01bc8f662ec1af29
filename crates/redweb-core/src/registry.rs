//! Identity-keyed containers with add/remove notification.
//!
//! Handlers and services use a [`Registry`] to track socket-bound objects
//! (players, rooms, sessions) independently of the route's own client map.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// An item that can be stored in a [`Registry`].
pub trait RegistryItem: Send + Sync + 'static {
    /// The item's identifier.
    fn id(&self) -> &str;

    /// Look up a named field for [`Registry::remove_by`].
    ///
    /// The default only knows `"id"`.
    fn field(&self, name: &str) -> Option<String> {
        (name == "id").then(|| self.id().to_string())
    }
}

/// A registry change.
#[derive(Debug)]
pub enum RegistryEvent<T> {
    /// An item was appended.
    Added(Arc<T>),
    /// An item was removed.
    Removed(Arc<T>),
}

type Observer<T> = Arc<dyn Fn(&RegistryEvent<T>) + Send + Sync>;

/// An ordered list of items with synchronous change observers.
pub struct Registry<T> {
    items: RwLock<Vec<Arc<T>>>,
    observers: RwLock<Vec<Observer<T>>>,
}

impl<T: RegistryItem> Registry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer. Observers run in registration order.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&RegistryEvent<T>) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Append an item and notify observers.
    pub fn add(&self, item: impl Into<Arc<T>>) -> Arc<T> {
        let item = item.into();
        self.items.write().push(Arc::clone(&item));
        trace!(id = %item.id(), "Registry item added");
        self.notify(&RegistryEvent::Added(Arc::clone(&item)));
        item
    }

    /// Remove an item by reference.
    ///
    /// Returns `true` if it was present.
    pub fn remove(&self, item: &Arc<T>) -> bool {
        self.remove_where(|candidate| Arc::ptr_eq(candidate, item))
    }

    /// Remove the first item whose field `key` equals `value`.
    ///
    /// Returns `true` if an item was removed.
    pub fn remove_by(&self, key: &str, value: &str) -> bool {
        self.remove_where(|candidate| candidate.field(key).as_deref() == Some(value))
    }

    /// Remove the item with the given id.
    pub fn remove_id(&self, id: &str) -> bool {
        self.remove_by("id", id)
    }

    /// Get the first item with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.items.read().iter().find(|item| item.id() == id).cloned()
    }

    /// Get a copy of all items, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<T>> {
        self.items.read().clone()
    }

    /// Get the number of items.
    #[must_use]
    pub fn count(&self) -> usize {
        self.items.read().len()
    }

    fn remove_where(&self, pred: impl Fn(&Arc<T>) -> bool) -> bool {
        let removed = {
            let mut items = self.items.write();
            items
                .iter()
                .position(|item| pred(item))
                .map(|index| items.remove(index))
        };

        match removed {
            Some(item) => {
                trace!(id = %item.id(), "Registry item removed");
                self.notify(&RegistryEvent::Removed(item));
                true
            }
            None => false,
        }
    }

    // Observers are snapshotted so they may touch the registry themselves.
    fn notify(&self, event: &RegistryEvent<T>) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(event);
        }
    }
}

impl<T: RegistryItem> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RegistryItem> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("count", &self.count())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}
