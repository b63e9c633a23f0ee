//! A single named handler-registration slot, the building block both
//! `Provider`/`Consumer` and their per-display aggregates compose into
//! role-specific handler tables.
//!
//! Each named handler (`host_display_change`, `add_display`, `driver_capabilities`,
//! ...) gets its own [`HandlerSlot`] field on the owning struct rather than
//! a single dynamically-typed map, so each slot's callback signature is
//! checked by the compiler instead of by a runtime downcast.

use std::sync::{Arc, Mutex};

/// A caller-registered callback, held under the owning aggregate's lock
/// as a shared reference to a caller-provided closure.
pub struct HandlerSlot<F: ?Sized> {
    inner: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for HandlerSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> HandlerSlot<F> {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Register (or replace) the callback.
    pub fn register(&self, handler: Arc<F>) {
        *self.lock() = Some(handler);
    }

    /// Clear the callback, so a callback that arrives after teardown
    /// observes nothing registered.
    pub fn clear(&self) {
        *self.lock() = None;
    }

    /// Take a clone of the current callback, if any, to invoke outside
    /// the owning aggregate's lock.
    #[must_use]
    pub fn get(&self) -> Option<Arc<F>> {
        self.lock().clone()
    }

    /// Whether a callback is currently registered.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<F>>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("handler-slot mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_clear_round_trip() {
        let slot: HandlerSlot<dyn Fn(u32) + Send + Sync> = HandlerSlot::new();
        assert!(!slot.is_set());

        slot.register(Arc::new(|_n: u32| {}));
        assert!(slot.is_set());
        assert!(slot.get().is_some());

        slot.clear();
        assert!(!slot.is_set());
        assert!(slot.get().is_none());
    }
}
