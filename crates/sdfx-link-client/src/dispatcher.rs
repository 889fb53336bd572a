//! Event dispatcher: a kind-keyed registry of subscriber callbacks.
//!
//! Callbacks fire in subscription order. Each dispatch iterates over a
//! snapshot of the registry taken under a short read lock, so callbacks may
//! subscribe, unsubscribe or dispatch re-entrantly without deadlocking and
//! without affecting the in-flight delivery.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use sdfx_link_core::events::{Event, EventKind};
use thiserror::Error;
use tracing::warn;

/// Subscriber callback. Returning `Err` is logged and does not affect other subscribers.
pub type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Identifies one registration; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks that completed normally.
    pub delivered: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown event kind '{0}': not built in and never subscribed to")]
    UnknownKind(String),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<EventKind, Vec<(u64, Callback)>>,
    /// Every dynamic kind that was ever subscribed to.
    registered: HashSet<EventKind>,
}

#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<Registry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `kind`. The kind stays known even after the
    /// last callback for it is removed.
    pub fn subscribe<F>(&self, kind: impl Into<EventKind>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.registered.insert(kind.clone());
        registry
            .subscribers
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        SubscriptionHandle { id, kind }
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(chain) = registry.subscribers.get_mut(&handle.kind) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|(id, _)| *id != handle.id);
        before != chain.len()
    }

    /// Whether events of this kind may be dispatched.
    pub fn is_known(&self, kind: &EventKind) -> bool {
        kind.is_fixed()
            || self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .registered
                .contains(kind)
    }

    pub fn subscriber_count(&self, kind: &EventKind) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Deliver an event to every current subscriber of its kind, in order.
    pub fn dispatch(&self, event: &Event) -> Result<DispatchReport, DispatchError> {
        let chain: Vec<Callback> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            if !event.kind.is_fixed() && !registry.registered.contains(&event.kind) {
                return Err(DispatchError::UnknownKind(event.kind.to_string()));
            }
            registry
                .subscribers
                .get(&event.kind)
                .map(|chain| chain.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };

        let mut report = DispatchReport::default();
        for callback in chain {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(kind = %event.kind, error = %e, "Subscriber error, continuing");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(kind = %event.kind, "Subscriber panicked, continuing");
                }
            }
        }
        Ok(report)
    }
}
