//! One-slot hand-off between a capture thread and its consumer. Publishing
//! overwrites whatever the consumer has not taken yet, so a slow consumer
//! always gets the newest frame.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

struct State<T> {
    value: Option<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Newest-value mailbox. Clones share the same slot.
pub struct Latest<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value: None,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the pending value. Returns `false` once the slot is closed.
    pub fn publish(&self, value: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.value = Some(value);
        self.shared.ready.notify_all();
        true
    }

    /// Drop the pending value, if any.
    pub fn clear(&self) {
        self.lock().value = None;
    }

    /// Wake every waiter; later publishes are refused. A value already
    /// pending can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.ready.notify_all();
    }

    /// Block until a value is pending and take it. `None` once the slot is
    /// closed and empty.
    pub fn take(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(v) = state.value.take() {
                return Some(v);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
