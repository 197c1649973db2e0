// SPDX-License-Identifier: GPL-3.0-only

//! Process-wide shared instances that live as long as somebody holds them

use std::sync::{Arc, Mutex, Weak};

/// Holds a weak reference to a lazily built shared value.
///
/// [`Self::acquire`] hands out the live value if any holder still has it and
/// builds a new one otherwise. Once the last [`Arc`] is dropped the value is
/// destroyed; the registry never keeps it alive by itself.
pub struct SharedInstance<T> {
    slot: Mutex<Weak<T>>,
}

impl<T> SharedInstance<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Weak::new()),
        }
    }

    pub fn acquire(&self, init: impl FnOnce() -> T) -> Arc<T> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = slot.upgrade() {
            return existing;
        }

        let instance = Arc::new(init());
        *slot = Arc::downgrade(&instance);
        instance
    }
}

impl<T> Default for SharedInstance<T> {
    fn default() -> Self {
        Self::new()
    }
}
