// Subscription bus - decouples UI re-render timing from fetch timing
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Events published after a refresh pass. Events carry no payload beyond
/// the trigger: consumers read the cache for current state and treat
/// events purely as an invalidation signal. There is no replay; a
/// subscriber registered after an event misses it.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Update {
        timestamp: DateTime<Utc>,
    },
    Error {
        machine_id: String,
        cause: String,
    },
}

type Handler = Box<dyn Fn(&BusEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Slot {
    id: SubscriptionId,
    handler: Handler,
    active: AtomicBool,
    // Held while the handler runs; `unsubscribe` drains it so an
    // in-flight invocation finishes before the call returns.
    delivering: Mutex<()>,
}

thread_local! {
    // Id of the slot this thread is currently delivering to, 0 if none.
    // Lets a handler unsubscribe itself without deadlocking on its own
    // drain lock.
    static DELIVERING_TO: Cell<u64> = const { Cell::new(0) };
}

/// Synchronous fan-out to registered handlers, in publish order.
///
/// Delivery runs over a snapshot taken outside the registry lock, so a
/// handler may freely subscribe or unsubscribe (itself included) from
/// inside a callback. `unsubscribe` waits out any in-flight invocation
/// of that handler, so once it returns the handler sees no further
/// events.
pub struct SubscriptionBus {
    slots: Mutex<Vec<Arc<Slot>>>,
    next_id: AtomicU64,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots
            .lock()
            .expect("subscription registry poisoned")
            .push(Arc::new(Slot {
                id,
                handler: Box::new(handler),
                active: AtomicBool::new(true),
                delivering: Mutex::new(()),
            }));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = {
            let mut slots = self
                .slots
                .lock()
                .expect("subscription registry poisoned");
            match slots.iter().position(|slot| slot.id == id) {
                Some(index) => slots.remove(index),
                None => return,
            }
        };
        removed.active.store(false, Ordering::SeqCst);
        // Drain an in-flight invocation, unless we are that invocation.
        if DELIVERING_TO.get() != id.0 {
            drop(removed.delivering.lock().expect("delivery lock poisoned"));
        }
    }

    /// Deliver an event to every handler in subscription order. A
    /// panicking handler is isolated and logged; delivery continues.
    pub fn publish(&self, event: &BusEvent) {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .lock()
            .expect("subscription registry poisoned")
            .clone();
        for slot in slots {
            let guard = slot.delivering.lock().expect("delivery lock poisoned");
            if !slot.active.load(Ordering::SeqCst) {
                continue;
            }
            DELIVERING_TO.set(slot.id.0);
            let outcome = catch_unwind(AssertUnwindSafe(|| (slot.handler)(event)));
            DELIVERING_TO.set(0);
            drop(guard);
            if outcome.is_err() {
                tracing::warn!(subscription = slot.id.0, "subscriber panicked while handling event");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots
            .lock()
            .expect("subscription registry poisoned")
            .len()
    }
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}
