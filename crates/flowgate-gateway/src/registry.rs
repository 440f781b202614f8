//! Bookkeeping of every process handle this gateway has started.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};
use uuid::Uuid;

use crate::runtime::ProcessHandle;

/// Shared by every spawn call of one gateway. Cloning shares the same list.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    handles: Vec<Arc<dyn ProcessHandle>>,
    /// Set by `close_all`. Later registrations are closed on arrival.
    closed: bool,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: Arc<dyn ProcessHandle>) {
        {
            let mut inner = self.lock();
            if !inner.closed {
                info!("Registered {} ({})", handle.name(), handle.id());
                inner.handles.push(handle);
                return;
            }
        }
        warn!("Registry is closed, closing {} ({})", handle.name(), handle.id());
        if let Err(e) = handle.close() {
            warn!("Failed to close {} ({}): {e:#}", handle.name(), handle.id());
        }
    }

    /// Remove the handle with `id`. Returns whether it was present.
    pub fn unregister(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        let handles = &mut inner.handles;
        match handles.iter().position(|h| h.id() == id) {
            Some(pos) => {
                let handle = handles.remove(pos);
                info!("Unregistered {} ({})", handle.name(), id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().handles.iter().any(|h| h.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }

    /// Close every registered handle and empty the registry. Handles
    /// registered afterwards are closed straight away.
    ///
    /// A handle failing to close is logged and does not stop the others.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.handles.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!("Closing {} spawned process handle(s)", drained.len());
        for handle in drained {
            if let Err(e) = handle.close() {
                warn!("Failed to close {} ({}): {e:#}", handle.name(), handle.id());
            }
        }
    }
}

/// Ties a handle's registration to a scope: dropping the guard unregisters
/// the handle and closes it.
pub struct Registration {
    registry: ProcessRegistry,
    handle: Arc<dyn ProcessHandle>,
}

impl Registration {
    pub fn new(registry: &ProcessRegistry, handle: Arc<dyn ProcessHandle>) -> Self {
        registry.register(Arc::clone(&handle));
        Self {
            registry: registry.clone(),
            handle,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.handle.id());
        if let Err(e) = self.handle.close() {
            warn!("Failed to close {}: {e:#}", self.handle.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandle {
        id: Uuid,
        name: String,
        fail: bool,
        closes: AtomicUsize,
    }

    impl FakeHandle {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                name: name.to_string(),
                fail,
                closes: AtomicUsize::new(0),
            })
        }
    }

    impl ProcessHandle for FakeHandle {
        fn id(&self) -> Uuid {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("refused to die");
            }
            Ok(())
        }
    }

    #[test]
    fn register_and_unregister() {
        let registry = ProcessRegistry::new();
        let a = FakeHandle::new("a", false);
        let b = FakeHandle::new("b", false);
        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(a.id));
        assert!(!registry.unregister(a.id));
        assert!(!registry.contains(a.id));
        assert!(registry.contains(b.id));
    }

    #[test]
    fn close_all_is_best_effort() {
        let registry = ProcessRegistry::new();
        let bad = FakeHandle::new("bad", true);
        let good = FakeHandle::new("good", false);
        registry.register(bad.clone());
        registry.register(good.clone());

        registry.close_all();
        assert!(registry.is_empty());
        assert_eq!(bad.closes.load(Ordering::SeqCst), 1);
        assert_eq!(good.closes.load(Ordering::SeqCst), 1);

        registry.close_all();
        assert_eq!(good.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registering_after_close_all_closes_the_handle() {
        let registry = ProcessRegistry::new();
        registry.close_all();

        let late = FakeHandle::new("late", false);
        registry.register(late.clone());
        assert!(registry.is_empty());
        assert_eq!(late.closes.load(Ordering::SeqCst), 1);

        {
            let _reg = Registration::new(&registry, FakeHandle::new("scoped-late", false));
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn registration_scope() {
        let registry = ProcessRegistry::new();
        let handle = FakeHandle::new("scoped", false);
        {
            let _reg = Registration::new(&registry, handle.clone());
            assert!(registry.contains(handle.id));
        }
        assert!(registry.is_empty());
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_state() {
        let registry = ProcessRegistry::new();
        let other = registry.clone();
        other.register(FakeHandle::new("x", false));
        assert_eq!(registry.len(), 1);
    }
}
