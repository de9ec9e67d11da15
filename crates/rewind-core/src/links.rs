//! Bidirectional (value, observer) → resource table for the store.

use indexmap::{IndexMap, IndexSet};

use crate::resource::Resource;

/// Link table indexed from both sides. Mutators hand evicted resources
/// back to the caller, which decides how to await their release.
pub(crate) struct LinkMap {
    links: IndexMap<(u64, u64), Resource>,
    by_value: IndexMap<u64, IndexSet<u64>>,
    by_observer: IndexMap<u64, IndexSet<u64>>,
}

impl LinkMap {
    pub fn new() -> LinkMap {
        LinkMap {
            links: IndexMap::new(),
            by_value: IndexMap::new(),
            by_observer: IndexMap::new(),
        }
    }

    /// Inserts a link; an existing resource for the pair is returned so
    /// the caller can release it before the replacement is relied on.
    pub fn link(&mut self, value: u64, observer: u64, resource: Resource) -> Option<Resource> {
        let evicted = self.links.insert((value, observer), resource);
        self.by_value.entry(value).or_default().insert(observer);
        self.by_observer.entry(observer).or_default().insert(value);
        evicted
    }

    /// Removes every link keyed on `value`, returning the resources.
    pub fn unlink_value(&mut self, value: u64) -> Vec<Resource> {
        let observers = self.by_value.shift_remove(&value).unwrap_or_default();
        let mut removed = Vec::with_capacity(observers.len());
        for observer in observers {
            if let Some(set) = self.by_observer.get_mut(&observer) {
                set.shift_remove(&value);
            }
            if let Some(resource) = self.links.shift_remove(&(value, observer)) {
                removed.push(resource);
            }
        }
        removed
    }

    /// Removes every link keyed on `observer`, returning the resources.
    pub fn unlink_observer(&mut self, observer: u64) -> Vec<Resource> {
        let values = self.by_observer.shift_remove(&observer).unwrap_or_default();
        let mut removed = Vec::with_capacity(values.len());
        for value in values {
            if let Some(set) = self.by_value.get_mut(&value) {
                set.shift_remove(&observer);
            }
            if let Some(resource) = self.links.shift_remove(&(value, observer)) {
                removed.push(resource);
            }
        }
        removed
    }

    /// Empties the table, returning every resource.
    pub fn unlink_all(&mut self) -> Vec<Resource> {
        self.by_value.clear();
        self.by_observer.clear();
        self.links.drain(..).map(|(_, r)| r).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.links.len()
    }
}
