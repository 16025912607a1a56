//! Single-writer state container with change notification.
//!
//! All mutation goes through `update`/`update_if`. Subscribers receive a
//! monotonically increasing version number each time the state changes and
//! read the state itself with `snapshot` or `read`.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

pub struct Store<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<T>,
    version: watch::Sender<u64>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Store<T> {
    pub fn new(initial: T) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(initial),
                version,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // A panic inside an update closure must not wedge every later reader.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the state and notify subscribers.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.update_if(|state| (f(state), true))
    }

    /// Mutate the state; subscribers are notified only when `f` reports a change.
    pub fn update_if<R>(&self, f: impl FnOnce(&mut T) -> (R, bool)) -> R {
        let (result, changed) = {
            let mut state = self.lock();
            f(&mut state)
        };
        if changed {
            self.inner.version.send_modify(|v| *v += 1);
        }
        result
    }

    /// Number of notifications published so far.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }
}

impl<T: Clone> Store<T> {
    pub fn snapshot(&self) -> T {
        self.lock().clone()
    }
}
