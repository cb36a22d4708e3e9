//! Fixed-capacity table of registered buffers, one per surface.
//!
//! The allocator is expected to rotate through two to four front buffers;
//! the pool therefore holds at most [`SLOT_CAP`] entries and treats a fifth
//! distinct buffer object as allocator misbehaviour to surface, not mask.
//!
//! The table, the buffer objects' user-data slots and the surface's
//! active/retired cells are only mutated while the pool mutex is held,
//! which is what keeps the three views of "which buffers does this surface
//! manage" consistent with each other.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::allocator::GpuBuffer;
use crate::buffer::content::{ContentBuffer, RegisterError};
use crate::remote::RemoteClient;
use crate::surface::Surface;
use crate::utils::AtomicCell;

/// Number of distinct buffer objects one surface may have alive at once.
pub const SLOT_CAP: usize = 4;

/// Errors resolving a buffer object to a content buffer.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// More than [`SLOT_CAP`] distinct buffer objects are alive.
    #[error("all {SLOT_CAP} buffer slots are occupied")]
    Exhausted,
    /// Registering the new buffer failed.
    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Per-surface table mapping buffer objects to [`ContentBuffer`]s.
#[derive(Debug)]
pub struct BufferPool {
    slots: Mutex<[Option<Arc<ContentBuffer>>; SLOT_CAP]>,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        BufferPool {
            slots: Mutex::new(Default::default()),
        }
    }

    /// Resolve `bo` to its content buffer, registering it on first sight.
    #[profiling::function]
    pub(crate) fn get_or_create(
        &self,
        surface: &Surface,
        remote: &Arc<dyn RemoteClient>,
        bo: &Arc<dyn GpuBuffer>,
    ) -> Result<Arc<ContentBuffer>, PoolError> {
        // Recycle fast path: a buffer object we have seen before carries
        // its wrapper in the user-data slot.
        if let Some(existing) = bo.user_data().get() {
            trace!(buffer = %bo.id(), "buffer object recycled");
            return Ok(existing);
        }

        let mut slots = self.slots.lock().unwrap();

        // The slot may have been filled while we were taking the lock.
        if let Some(existing) = bo.user_data().get() {
            return Ok(existing);
        }

        let free = match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(free) => free,
            None => return Err(PoolError::Exhausted),
        };

        let buffer = ContentBuffer::new(surface, remote.clone(), bo.clone())?;
        bo.user_data().install(buffer.clone());
        *free = Some(buffer.clone());
        debug!(buffer = %bo.id(), "registered new content buffer");

        Ok(buffer)
    }

    /// Drop one buffer after the allocator announced its object is gone.
    ///
    /// Clears the user-data slot, the table slot and, if they still point
    /// at this buffer, the surface's active/retired cells.
    pub(crate) fn evict(
        &self,
        buffer: &Arc<ContentBuffer>,
        active: &AtomicCell<ContentBuffer>,
        retired: &AtomicCell<ContentBuffer>,
    ) {
        let mut slots = self.slots.lock().unwrap();
        buffer.bo().user_data().clear();
        match slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|entry| Arc::ptr_eq(entry, buffer)))
        {
            Some(slot) => {
                *slot = None;
                debug!(buffer = %buffer.id(), "evicted destroyed buffer");
            }
            None => warn!(buffer = %buffer.id(), "destroy signal with mismatched content buffer"),
        }
        active.take_if(buffer);
        retired.take_if(buffer);
    }

    /// Quiesce every managed buffer for surface teardown.
    ///
    /// User-data slots are disarmed first so that a destroy signal the
    /// allocator fires later finds nothing to act on. Returns the number of
    /// buffers that were drained.
    pub(crate) fn teardown(
        &self,
        active: &AtomicCell<ContentBuffer>,
        retired: &AtomicCell<ContentBuffer>,
    ) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let mut drained = 0;
        for slot in slots.iter_mut() {
            if let Some(buffer) = slot.take() {
                buffer.bo().user_data().clear();
                drained += 1;
            }
        }
        active.take();
        retired.take();
        drained
    }

    #[cfg(test)]
    pub(crate) fn occupied(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, buffer: &Arc<ContentBuffer>) -> bool {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|entry| Arc::ptr_eq(entry, buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::GpuBuffer;
    use crate::testing::{Fixture, TestBuffer};

    use std::sync::Arc;

    #[test]
    fn fast_path_returns_the_installed_wrapper() {
        let fixture = Fixture::new("pool-fast");
        let (surface, client) = fixture.surface("win", None);
        let remote: Arc<dyn RemoteClient> = client;
        let bo: Arc<dyn GpuBuffer> = TestBuffer::new(1);

        let first = surface
            .pool()
            .get_or_create(&surface, &remote, &bo)
            .expect("registration");
        let second = surface
            .pool()
            .get_or_create(&surface, &remote, &bo)
            .expect("fast path");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(surface.pool().occupied(), 1);
    }

    #[test]
    fn user_data_and_table_stay_consistent() {
        let fixture = Fixture::new("pool-consistent");
        let (surface, client) = fixture.surface("win", None);
        let remote: Arc<dyn RemoteClient> = client;

        let mut buffers = Vec::new();
        for id in 1..=SLOT_CAP as u64 {
            let bo: Arc<dyn GpuBuffer> = TestBuffer::new(id);
            let buffer = surface
                .pool()
                .get_or_create(&surface, &remote, &bo)
                .expect("registration");
            // The object's user-data must point back at its slot owner.
            let via_user_data = bo.user_data().get().expect("user data installed");
            assert!(Arc::ptr_eq(&buffer, &via_user_data));
            assert!(surface.pool().contains(&buffer));
            buffers.push((bo, buffer));
        }
        assert_eq!(surface.pool().occupied(), SLOT_CAP);

        let overflow: Arc<dyn GpuBuffer> = TestBuffer::new(99);
        let result = surface.pool().get_or_create(&surface, &remote, &overflow);
        assert!(matches!(result, Err(PoolError::Exhausted)), "got {result:?}");
        assert!(overflow.user_data().get().is_none());
    }

    #[test]
    fn evict_detaches_buffer_and_cells() {
        let fixture = Fixture::new("pool-evict");
        let (surface, client) = fixture.surface("win", None);
        let remote: Arc<dyn RemoteClient> = client;
        let bo: Arc<dyn GpuBuffer> = TestBuffer::new(1);

        let buffer = surface
            .pool()
            .get_or_create(&surface, &remote, &bo)
            .expect("registration");
        surface.buffer_destroyed(&buffer);

        assert_eq!(surface.pool().occupied(), 0);
        assert!(bo.user_data().get().is_none());
        // A duplicate destroy notification only logs.
        surface.buffer_destroyed(&buffer);
    }
}
