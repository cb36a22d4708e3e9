//! Traits describing the GPU buffer allocator.
//!
//! The pipeline never talks to libgbm (or any other allocator) directly.
//! Instead an integrator provides implementations of [`GpuDevice`],
//! [`GpuWindow`] and [`GpuBuffer`], which mirror the shape of a gbm
//! device / surface / buffer-object family: a device creates fixed-size
//! windows, a window hands out its front buffer after every swap, and a
//! buffer object can export one file descriptor per plane for cross-process
//! sharing.
//!
//! Buffer objects additionally carry a [`UserDataSlot`]. The pipeline uses
//! it to recognise buffers the allocator hands out again after they were
//! released (the recycle fast path) and the allocator adapter uses it to
//! tell the pipeline that the underlying object is gone.

use std::fmt;
use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::buffer::ContentBuffer;

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

/// Maximum amount of planes this implementation supports.
pub const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Usage hints passed to [`GpuDevice::create_window`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct WindowFlags: u32 {
        /// The window's buffers will be rendered to.
        const RENDERING = 1;
    }
}

/// Stable identity of a GPU buffer object.
///
/// The identity must not change while the object is alive and must not be
/// reused for another object handed out by the same window. It is only
/// meaningful within one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo-{}", self.0)
    }
}

/// One exported plane of a buffer object.
///
/// Owning the descriptor here is what makes it close exactly once, when the
/// wrapping [`ContentBuffer`] goes away.
#[derive(Debug)]
pub struct ExportedPlane {
    /// Duplicated file descriptor referring to the plane's memory.
    pub fd: OwnedFd,
    /// Stride of the plane in bytes.
    pub stride: u32,
    /// Offset of the plane from the start of the descriptor in bytes.
    pub offset: u32,
}

/// Errors of the allocator seam.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The allocator device could not be created on the render node.
    #[error("failed to create the allocator device")]
    CreateDevice(#[source] io::Error),
    /// A window with the requested format could not be created.
    #[error("failed to create a {format} window")]
    CreateWindow {
        /// Format that was requested.
        format: Fourcc,
        /// Underlying allocator error.
        #[source]
        source: io::Error,
    },
    /// The front buffer could not be locked after a swap.
    #[error("failed to lock the front buffer")]
    LockFrontBuffer(#[source] io::Error),
}

/// An opaque GPU buffer object, e.g. a `gbm_bo`.
///
/// The allocator owns the object; the handles passed around here only
/// borrow it. In particular the allocator decides when the object dies and
/// announces that through [`UserDataSlot::destroyed`].
pub trait GpuBuffer: Send + Sync {
    /// Stable identity of the underlying object.
    fn id(&self) -> BufferId;
    /// Width of the buffer in pixels.
    fn width(&self) -> u32;
    /// Height of the buffer in pixels.
    fn height(&self) -> u32;
    /// Pixel format of the buffer.
    fn format(&self) -> Fourcc;
    /// Format modifier of the buffer.
    fn modifier(&self) -> Modifier;
    /// Number of planes the buffer consists of.
    fn plane_count(&self) -> usize;
    /// Export one plane as a duplicated file descriptor.
    fn export_plane(&self, plane: usize) -> io::Result<ExportedPlane>;
    /// The buffer object's user-data slot.
    fn user_data(&self) -> &UserDataSlot;
}

/// A window-sized swapchain of buffer objects, e.g. a `gbm_surface`.
pub trait GpuWindow: Send + Sync {
    /// Lock the buffer the producer finished rendering into.
    ///
    /// Expected to return promptly; a failure drops the frame but must not
    /// wedge the window.
    fn lock_front_buffer(&self) -> Result<Arc<dyn GpuBuffer>, AcquireError>;
    /// Return a previously locked buffer to the window for reuse.
    fn release_buffer(&self, buffer: &Arc<dyn GpuBuffer>);
    /// Raw handle suitable as an `EGLNativeWindowType`.
    fn native(&self) -> *mut std::ffi::c_void;
}

/// An allocator device bound to an opened render node, e.g. a `gbm_device`.
pub trait GpuDevice: Send + Sync {
    /// Name of the backend driving this device.
    ///
    /// Used to detect backends that reject usage flags on window creation.
    fn backend_name(&self) -> &str;
    /// Create a window of the given size and format.
    fn create_window(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        flags: WindowFlags,
    ) -> Result<Arc<dyn GpuWindow>, AcquireError>;
    /// Raw handle suitable as an `EGLNativeDisplayType`.
    fn native(&self) -> *mut std::ffi::c_void;
}

/// Per buffer-object slot tying the object to its [`ContentBuffer`].
///
/// This is the analogue of gbm's user-data pointer. The slot is installed
/// and cleared only while the owning surface's pool mutex is held, which
/// keeps it consistent with the pool table; reading it does not involve the
/// pool at all.
#[derive(Debug, Default)]
pub struct UserDataSlot {
    inner: Mutex<Option<Arc<ContentBuffer>>>,
}

impl UserDataSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current occupant, if any.
    pub fn get(&self) -> Option<Arc<ContentBuffer>> {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn install(&self, buffer: Arc<ContentBuffer>) {
        *self.inner.lock().unwrap() = Some(buffer);
    }

    pub(crate) fn clear(&self) -> Option<Arc<ContentBuffer>> {
        self.inner.lock().unwrap().take()
    }

    /// Entry point for the allocator's destroy notification.
    ///
    /// Invoked by the allocator adapter when the underlying buffer object
    /// is destroyed. If a surface teardown already cleared the slot this is
    /// a no-op.
    pub fn destroyed(&self) {
        let Some(buffer) = self.get() else {
            trace!("destroy signal for an unmanaged buffer object");
            return;
        };
        match buffer.surface() {
            Some(surface) => surface.buffer_destroyed(&buffer),
            // The surface is already gone; it has quiesced the buffer.
            None => {
                self.clear();
            }
        }
    }
}
