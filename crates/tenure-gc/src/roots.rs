//! Roots that live outside mutator handle areas.
//!
//! A [`Handle`] is a heap-independent root slot that keeps its referent
//! alive until the last clone is dropped. Embedders with their own root
//! tables implement [`RootProvider`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

/// A producer of root slots visited at pauses.
///
/// Slots hold raw object addresses (`0` is null). The collector may
/// rewrite a slot to point at the moved copy of its object.
pub trait RootProvider: Send + Sync {
    /// Calls `f` with every root slot.
    fn roots_do(&self, f: &mut dyn FnMut(&AtomicUsize));
}

/// A persistent root.
///
/// Clones share the slot. Reading and writing goes through a
/// [`MutatorScope`](crate::MutatorScope) so barriers apply.
#[derive(Clone)]
pub struct Handle(Arc<AtomicUsize>);

impl Handle {
    /// Whether the handle holds no object.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub(crate) fn slot(&self) -> &AtomicUsize {
        &self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0.load(Ordering::Relaxed))
    }
}

/// Persistent handles and registered providers of one heap.
#[derive(Default)]
pub struct RootSet {
    handles: Mutex<Vec<Weak<AtomicUsize>>>,
    providers: RwLock<Vec<Arc<dyn RootProvider>>>,
}

impl fmt::Debug for RootSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSet")
            .field("handles", &self.handles.lock().len())
            .field("providers", &self.providers.read().len())
            .finish()
    }
}

impl RootSet {
    pub(crate) fn new_handle(&self, raw: usize) -> Handle {
        let slot = Arc::new(AtomicUsize::new(raw));
        self.handles.lock().push(Arc::downgrade(&slot));
        Handle(slot)
    }

    /// Registers `provider`; its roots are visited at every pause.
    pub fn add_provider(&self, provider: Arc<dyn RootProvider>) {
        self.providers.write().push(provider);
    }

    /// Live persistent handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.strong_count() > 0)
            .count()
    }

    /// Visits every handle slot and every provider's slots, forgetting
    /// handles whose last clone is gone.
    pub(crate) fn roots_do(&self, f: &mut dyn FnMut(&AtomicUsize)) {
        let live: Vec<Arc<AtomicUsize>> = {
            let mut handles = self.handles.lock();
            handles.retain(|h| h.strong_count() > 0);
            handles.iter().filter_map(Weak::upgrade).collect()
        };
        for slot in &live {
            f(slot);
        }
        for provider in self.providers.read().iter() {
            provider.roots_do(f);
        }
    }
}
