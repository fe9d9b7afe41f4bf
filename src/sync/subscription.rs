//! Event listener registry with one handler per event name.
//!
//! Registering a handler for a name replaces whatever was registered before,
//! so handlers never stack. The returned [`Subscription`] releases the
//! registration when dropped, but only if it has not been superseded.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::events::{ChannelEvent, EventKind};

struct Entry {
    generation: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct Registry {
    next_generation: u64,
    entries: HashMap<EventKind, Entry>,
}

#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<Registry>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Subscription {
        let mut registry = self.inner.lock();
        registry.next_generation += 1;
        let generation = registry.next_generation;
        if registry
            .entries
            .insert(kind, Entry { generation, tx })
            .is_some()
        {
            log::debug!("replaced existing {:?} handler", kind);
        }
        Subscription {
            kind,
            generation,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe_all(
        &self,
        kinds: &[EventKind],
        tx: &mpsc::UnboundedSender<ChannelEvent>,
    ) -> Vec<Subscription> {
        kinds
            .iter()
            .map(|kind| self.subscribe(*kind, tx.clone()))
            .collect()
    }

    /// Deliver to the handler registered for the event's name. Returns false
    /// when nobody is listening.
    pub fn dispatch(&self, event: ChannelEvent) -> bool {
        let kind = event.kind();
        let mut registry = self.inner.lock();
        let Some(entry) = registry.entries.get(&kind) else {
            log::debug!("no handler for {:?}", kind);
            return false;
        };
        if entry.tx.send(event).is_err() {
            registry.entries.remove(&kind);
            return false;
        }
        true
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.inner.lock().entries.contains_key(&kind)
    }
}

/// Handle for one registration. Dropping it releases the registration.
#[must_use = "dropping a subscription unregisters it"]
pub struct Subscription {
    kind: EventKind,
    generation: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        let current = registry.entries.get(&self.kind).map(|e| e.generation);
        if current == Some(self.generation) {
            registry.entries.remove(&self.kind);
        }
    }
}
