//! Shared mutable state injected into components at construction.
//! No globals: every table is owned by whoever holds a clone of its handle.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Copy taken under the lock, so readers never see a half-applied update.
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}
