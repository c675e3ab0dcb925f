// Subscription manager
// Tracks which keys a push listener currently cares about and diffs a new
// desired set against it, so listeners are only touched when membership
// actually changes.

use std::collections::HashSet;
use std::hash::Hash;

/// Membership change produced by [`SubscriptionSet::reconcile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDiff<K> {
    pub added: Vec<K>,
    pub removed: Vec<K>,
}

impl<K> KeyDiff<K> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionSet<K: Eq + Hash + Clone> {
    keys: HashSet<K>,
    revision: u64,
}

impl<K: Eq + Hash + Clone> Default for SubscriptionSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> SubscriptionSet<K> {
    pub fn new() -> Self {
        SubscriptionSet {
            keys: HashSet::new(),
            revision: 0,
        }
    }

    /// Replace the subscribed set with `desired`.
    ///
    /// # Returns
    ///
    /// The keys that were added and removed. The revision only moves when
    /// the diff is non-empty.
    pub fn reconcile<I>(&mut self, desired: I) -> KeyDiff<K>
    where
        I: IntoIterator<Item = K>,
    {
        let desired: HashSet<K> = desired.into_iter().collect();
        let added: Vec<K> = desired.difference(&self.keys).cloned().collect();
        let removed: Vec<K> = self.keys.difference(&desired).cloned().collect();
        if !added.is_empty() || !removed.is_empty() {
            self.keys = desired;
            self.revision += 1;
        }
        KeyDiff { added, removed }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.keys.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Incremented on every membership change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn clear(&mut self) {
        if !self.keys.is_empty() {
            self.keys.clear();
            self.revision += 1;
        }
    }
}
