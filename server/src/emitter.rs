//! Typed event emitter.
//!
//! Components own a private [`EventEmitter`] and expose `on`/`once`/`off`
//! publicly while keeping `emit` crate-internal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned when registering a listener, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    id: u64,
    once: bool,
    listener: Listener<E>,
}

/// A list of listeners for events of type `E`.
pub struct EventEmitter<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Entry<E>>>,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<E> EventEmitter<E> {
    /// Creates an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener called for every event.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(false, Arc::new(listener))
    }

    /// Registers a listener called for the next event only.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(true, Arc::new(listener))
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id.0);
        listeners.len() != before
    }

    /// Removes every listener.
    pub fn off_all(&self) {
        self.listeners.lock().clear();
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Calls every listener with the event.
    ///
    /// Listeners run outside the lock, so they may register or remove
    /// listeners themselves.
    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let mut listeners = self.listeners.lock();
            let snapshot = listeners
                .iter()
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            listeners.retain(|entry| !entry.once);
            snapshot
        };

        for listener in snapshot {
            listener(event);
        }
    }

    fn register(&self, once: bool, listener: Listener<E>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Entry { id, once, listener });
        ListenerId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_receives_every_event() {
        let emitter = EventEmitter::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&total);
        emitter.on(move |n| {
            seen.fetch_add(*n as usize, Ordering::SeqCst);
        });

        emitter.emit(&2);
        emitter.emit(&3);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_once_fires_once() {
        let emitter = EventEmitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        emitter.once(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&());
        emitter.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_off_removes_listener() {
        let emitter = EventEmitter::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = emitter.on(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_register_during_emit() {
        let emitter = Arc::new(EventEmitter::<()>::new());
        let inner = Arc::clone(&emitter);
        emitter.once(move |_| {
            inner.on(|_| {});
        });

        emitter.emit(&());
        assert_eq!(emitter.listener_count(), 1);
    }
}
