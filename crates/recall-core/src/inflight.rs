use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-key suppression of overlapping calls.
///
/// A second `try_acquire` for a key that is already held returns `None`
/// rather than queueing. The key is released when the guard is dropped.
pub struct InFlightRegistry<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Clone for InFlightRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
        }
    }
}

impl<K: Eq + Hash> Default for InFlightRegistry<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlightRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<K>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self, key: K) -> Option<InFlightGuard<K>> {
        if !self.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key: Some(key),
        })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[must_use = "the key is released as soon as the guard is dropped"]
pub struct InFlightGuard<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut keys = self
                .keys
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            keys.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let registry = InFlightRegistry::new();
        let guard = registry.try_acquire("top");
        assert!(guard.is_some());
        assert!(registry.try_acquire("top").is_none());
        assert!(registry.is_in_flight(&"top"));
        // other keys are independent
        assert!(registry.try_acquire("bottom").is_some());
    }

    #[test]
    fn test_release_on_drop() {
        let registry = InFlightRegistry::new();
        {
            let _guard = registry.try_acquire("c1".to_string()).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
        assert!(registry.try_acquire("c1".to_string()).is_some());
    }
}
