//! The one-shot fatal-error handler slot shared by both aggregate kinds.
//!
//! A fatal error fires the aggregate's single registered handler at most
//! once, with the slot nulled out *before* the handler runs so a handler
//! that triggers another fatal condition (directly or by dropping the
//! last reference to the aggregate) cannot re-enter. Both the provider
//! and consumer aggregates share this one type: per-aggregate nulling of
//! the handler slot under its own lock, rather than each side growing its
//! own re-entrancy mechanism.

use std::sync::{Arc, Mutex};

/// Why an aggregate's fatal handler fired.
#[derive(Debug, Clone)]
pub enum FatalCause {
    /// The partial-read receiver rejected a packet (bad magic, bad CRC,
    /// or an oversize length).
    Protocol(pvd_proto::ProtocolError),
    /// The IVC transport refused an operation this aggregate depends on
    /// (e.g. `getAvailableData` failed, or an accepted connection's
    /// shared-memory view could not be obtained).
    Transport(String),
    /// A required channel (control, event, or framebuffer) disconnected.
    Disconnected {
        /// Which channel disconnected.
        channel: &'static str,
    },
}

impl std::fmt::Display for FatalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Disconnected { channel } => write!(f, "{channel} channel disconnected"),
        }
    }
}

/// A callback invoked at most once, with the cause of the fatal condition.
pub type FatalHandler = Arc<dyn Fn(FatalCause) + Send + Sync>;

/// A single fatal-handler slot, guarded by its own lock that nests inside
/// no other lock.
///
/// `take` both clears and returns the handler atomically, so a second
/// concurrent fatal condition sees an empty slot and does nothing — this
/// is the whole re-entrancy guard. Nothing in this type calls the
/// handler while holding the lock: callers are expected to `take()` then
/// invoke the result after the guard has dropped, so no lock is ever held
/// across a callback invocation into caller-supplied handler code.
#[derive(Default)]
pub struct FatalSlot {
    handler: Mutex<Option<FatalHandler>>,
}

impl FatalSlot {
    /// An empty slot with no handler registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }

    /// Register (or replace) the handler.
    pub fn register(&self, handler: FatalHandler) {
        let mut slot = self.lock();
        *slot = Some(handler);
    }

    /// Whether a handler is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Take the handler out of the slot, if any remains. The caller is
    /// responsible for invoking it (outside the lock, which has already
    /// been released by the time this returns).
    #[must_use]
    pub fn take(&self) -> Option<FatalHandler> {
        self.lock().take()
    }

    /// Fire the fatal handler with `cause`, if one is still armed. Returns
    /// whether a handler actually ran — at most once, ever, per slot.
    pub fn fire(&self, cause: FatalCause) -> bool {
        match self.take() {
            Some(handler) => {
                tracing::error!(%cause, "aggregate fatal error, invoking handler");
                handler(cause);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<FatalHandler>> {
        self.handler.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("fatal-handler mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_at_most_once() {
        let slot = FatalSlot::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        slot.register(Arc::new(move |_cause| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(slot.fire(FatalCause::Disconnected { channel: "event" }));
        assert!(!slot.fire(FatalCause::Disconnected { channel: "event" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unarmed_slot_fires_nothing() {
        let slot = FatalSlot::new();
        assert!(!slot.is_armed());
        assert!(!slot.fire(FatalCause::Transport("no handler".into())));
    }

    #[test]
    fn reentrant_fire_from_within_handler_is_noop() {
        let slot = Arc::new(FatalSlot::new());
        let inner = slot.clone();
        let reentrant_fired = Arc::new(AtomicUsize::new(0));
        let reentrant_fired2 = reentrant_fired.clone();
        slot.register(Arc::new(move |_cause| {
            // A handler that itself triggers another fatal condition on
            // the same aggregate must not re-invoke a handler: the slot
            // is already empty by the time this body runs.
            if inner.fire(FatalCause::Transport("reentrant".into())) {
                reentrant_fired2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        slot.fire(FatalCause::Transport("first".into()));
        assert_eq!(reentrant_fired.load(Ordering::SeqCst), 0);
    }
}
