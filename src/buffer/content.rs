//! The long-lived wrapper around one GPU buffer object.
//!
//! A [`ContentBuffer`] is created the first time a buffer object surfaces
//! from the allocator. Creation exports every plane to a file descriptor,
//! offers the descriptor set to the compositor exactly once and registers
//! the wrapper with the process-wide resource monitor. From then on the
//! wrapper only changes through its state machine; the exported
//! descriptors are closed when the wrapper goes away.

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

use tracing::{debug, error, trace, warn};

use crate::allocator::{BufferId, ExportedPlane, Fourcc, GpuBuffer, Modifier};
use crate::buffer::state::{BufferState, StateCell};
use crate::connector;
use crate::remote::RemoteClient;
use crate::surface::Surface;
use crate::utils::monitor::{MonitorToken, ResourceMonitor};

/// Errors while registering a buffer object with the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// The buffer uses a multi-plane format.
    #[error("buffer has {planes} planes, only single-plane packed formats are supported")]
    UnsupportedFormat {
        /// Number of planes the buffer reported.
        planes: usize,
    },
    /// A plane could not be exported to a file descriptor.
    #[error("failed to export plane {plane}")]
    Export {
        /// Index of the failing plane.
        plane: usize,
        /// Underlying allocator error.
        #[source]
        source: io::Error,
    },
}

/// One registered GPU buffer object and its exported descriptors.
pub struct ContentBuffer {
    width: u32,
    height: u32,
    format: Fourcc,
    modifier: Modifier,
    planes: Vec<ExportedPlane>,
    bo: Arc<dyn GpuBuffer>,
    weak_self: Weak<ContentBuffer>,
    surface: Weak<Surface>,
    surface_id: u32,
    remote: Arc<dyn RemoteClient>,
    state: StateCell,
    monitor: MonitorToken,
}

impl fmt::Debug for ContentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentBuffer")
            .field("id", &self.bo.id())
            .field("surface", &self.surface_id)
            .field("size", &(self.width, self.height))
            .field("format", &self.format)
            .field("state", &self.state.load())
            .finish()
    }
}

impl ContentBuffer {
    /// Wrap `bo` and register it with the compositor.
    ///
    /// The offer to the compositor may fail without failing the
    /// registration; the compositor simply never learns about the buffer
    /// and frames using it will be dropped on its side.
    #[profiling::function]
    pub(crate) fn new(
        surface: &Surface,
        remote: Arc<dyn RemoteClient>,
        bo: Arc<dyn GpuBuffer>,
    ) -> Result<Arc<ContentBuffer>, RegisterError> {
        let plane_count = bo.plane_count();
        if plane_count != 1 {
            return Err(RegisterError::UnsupportedFormat { planes: plane_count });
        }

        let mut planes = Vec::with_capacity(plane_count);
        for plane in 0..plane_count {
            let exported = bo
                .export_plane(plane)
                .map_err(|source| RegisterError::Export { plane, source })?;
            planes.push(exported);
        }

        let surface_id = remote.id();
        match connector::offer_descriptors(surface_id, &planes) {
            Ok(()) => debug!(buffer = %bo.id(), surface = surface_id, "offered buffer to the compositor"),
            Err(err) => {
                error!(buffer = %bo.id(), surface = surface_id, ?err, "failed to offer buffer to the compositor")
            }
        }

        let monitor = ResourceMonitor::instance().register(
            format!("content-buffer/{}/{}", surface.name(), bo.id()),
            planes.len(),
        );

        Ok(Arc::new_cyclic(|weak_self| ContentBuffer {
            width: bo.width(),
            height: bo.height(),
            format: bo.format(),
            modifier: bo.modifier(),
            planes,
            weak_self: weak_self.clone(),
            surface: surface.weak(),
            surface_id,
            remote,
            bo,
            state: StateCell::new(),
            monitor,
        }))
    }

    /// Identity of the wrapped buffer object.
    pub fn id(&self) -> BufferId {
        self.bo.id()
    }

    /// Width snapshot taken at registration.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height snapshot taken at registration.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Format snapshot taken at registration.
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Modifier snapshot taken at registration.
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// The exported planes, in plane order.
    pub fn planes(&self) -> &[ExportedPlane] {
        &self.planes
    }

    /// Current state of the buffer.
    pub fn state(&self) -> BufferState {
        self.state.load()
    }

    pub(crate) fn bo(&self) -> &Arc<dyn GpuBuffer> {
        &self.bo
    }

    pub(crate) fn surface(&self) -> Option<Arc<Surface>> {
        self.surface.upgrade()
    }

    pub(crate) fn monitor_token(&self) -> MonitorToken {
        self.monitor
    }

    fn transition(&self, target: BufferState) -> bool {
        match self.state.advance(target) {
            Ok(()) => {
                trace!(buffer = %self.bo.id(), %target, "buffer advanced");
                true
            }
            Err(observed) => {
                error!(
                    buffer = %self.bo.id(),
                    expected = %target.predecessor(),
                    %observed,
                    %target,
                    "illegal buffer transition"
                );
                false
            }
        }
    }

    /// FREE → STAGED: the client locked the buffer with finished content.
    pub(crate) fn stage(&self) -> bool {
        self.transition(BufferState::Staged)
    }

    /// STAGED → PENDING, then hand the buffer to the compositor.
    pub(crate) fn submit(&self) -> bool {
        if !self.transition(BufferState::Pending) {
            return false;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return false;
        };
        if let Err(err) = self.remote.submit(&this) {
            error!(buffer = %self.bo.id(), ?err, "failed to submit buffer to the compositor");
            return false;
        }
        true
    }

    /// PENDING → ACTIVE.
    pub(crate) fn activate(&self) -> bool {
        self.transition(BufferState::Active)
    }

    /// ACTIVE → RETIRED.
    pub(crate) fn retire(&self) -> bool {
        self.transition(BufferState::Retired)
    }

    /// RETIRED → FREE.
    pub(crate) fn release(&self) -> bool {
        self.transition(BufferState::Free)
    }

    /// RETIRED → FREE for a buffer whose published signal was lost.
    ///
    /// A failed transition is only logged; the caller returns the buffer
    /// object to the allocator either way.
    pub(crate) fn force_release(&self) {
        if let Err(observed) = self.state.advance(BufferState::Free) {
            warn!(buffer = %self.bo.id(), %observed, "force-releasing buffer outside RETIRED");
        }
    }

    /// The compositor finished using the buffer as a composition source.
    ///
    /// Called by the transport, on its callback thread, once per
    /// submission. Dropped silently when the owning surface is gone.
    pub fn rendered(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        match self.surface.upgrade() {
            Some(surface) => surface.buffer_rendered(&this),
            None => trace!(buffer = %self.bo.id(), "rendered signal after surface teardown"),
        }
    }

    /// The compositor finished scanning out a frame derived from the buffer.
    ///
    /// Called by the transport, on its callback thread, once per
    /// submission. Dropped silently when the owning surface is gone.
    pub fn published(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        match self.surface.upgrade() {
            Some(surface) => surface.buffer_published(&this),
            None => trace!(buffer = %self.bo.id(), "published signal after surface teardown"),
        }
    }
}

impl Drop for ContentBuffer {
    fn drop(&mut self) {
        ResourceMonitor::instance().unregister(self.monitor);
        debug!(buffer = %self.bo.id(), surface = self.surface_id, "content buffer destroyed");
        // The exported plane descriptors close with `self.planes`.
    }
}
