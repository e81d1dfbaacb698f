//! Handle arena.

use crate::error::{DataError, DataResult};
use crate::handle::DataHandle;
use parking_lot::RwLock;
use std::sync::Arc;
use tessera_core::HandleId;

/// Owns every live handle, addressed by slot index
///
/// Slots are never reused, so a stale id resolves to `UnknownHandle`
/// instead of aliasing a newer handle.
#[derive(Default)]
pub struct HandleRegistry {
    slots: RwLock<Vec<Option<Arc<DataHandle>>>>,
}

impl HandleRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot and store the handle built for it
    pub(crate) fn insert(&self, build: impl FnOnce(HandleId) -> DataHandle) -> Arc<DataHandle> {
        let mut slots = self.slots.write();
        let id = HandleId::from_index(slots.len());
        let handle = Arc::new(build(id));
        slots.push(Some(Arc::clone(&handle)));
        handle
    }

    /// Look up a live handle
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the id was never issued or was removed
    pub fn get(&self, id: HandleId) -> DataResult<Arc<DataHandle>> {
        self.slots
            .read()
            .get(id.index())
            .and_then(Clone::clone)
            .ok_or(DataError::UnknownHandle(id))
    }

    pub(crate) fn remove(&self, id: HandleId) -> Option<Arc<DataHandle>> {
        self.slots.write().get_mut(id.index()).and_then(Option::take)
    }

    /// Number of live handles
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    /// Whether no handle is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live handle
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<DataHandle>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleState;
    use tessera_core::MemoryNode;

    fn insert(registry: &HandleRegistry) -> Arc<DataHandle> {
        registry.insert(|id| DataHandle::new(id, HandleState::new(id, 4, 0, 1, &[MemoryNode::HOST])))
    }

    #[test]
    fn test_insert_and_get() {
        let registry = HandleRegistry::new();
        let a = insert(&registry);
        let b = insert(&registry);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.get(b.id()).unwrap().id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_removed_slot_not_reused() {
        let registry = HandleRegistry::new();
        let a = insert(&registry);
        assert!(registry.remove(a.id()).is_some());
        assert!(matches!(
            registry.get(a.id()),
            Err(DataError::UnknownHandle(_))
        ));

        let b = insert(&registry);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 1);
    }
}
