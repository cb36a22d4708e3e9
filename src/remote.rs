//! Traits describing the compositor's remote-object proxies.
//!
//! The RPC runtime (transport, proxy lifetimes, reference counting) is an
//! external collaborator. The pipeline only needs three narrow views of it,
//! defined here. An integrator implements them on top of the real runtime,
//! connected through [`crate::connector::rpc_endpoint`]; the tests
//! implement them in memory.

use std::path::PathBuf;
use std::sync::Arc;

use crate::allocator::{AcquireError, GpuDevice};
use crate::buffer::ContentBuffer;

/// Errors crossing the remote seam.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The transport to the compositor is closed.
    #[error("the connection to the compositor is closed")]
    Disconnected,
    /// The remote end refused the request.
    #[error("the remote end refused the request")]
    Refused,
    /// Any other transport-defined failure.
    #[error("transport failure")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Factory for the per-display collaborators.
///
/// Used exactly once per display name, when the registry creates the
/// display entry.
pub trait Platform: Send + Sync {
    /// Open the RPC transport and acquire the remote display proxy.
    fn connect(&self, display_name: &str) -> Result<Arc<dyn RemoteDisplay>, RemoteError>;

    /// Create the allocator device on the opened render node.
    fn create_device(
        &self,
        node: std::os::unix::io::BorrowedFd<'_>,
    ) -> Result<Arc<dyn GpuDevice>, AcquireError>;
}

/// Proxy for the compositor-side display object.
pub trait RemoteDisplay: Send + Sync {
    /// Path of the DRM render node the compositor wants clients to use.
    fn render_node(&self) -> Result<PathBuf, RemoteError>;

    /// Create the compositor-side client object for one surface.
    fn create_client(
        &self,
        name: &str,
        width: u32,
        height: u32,
    ) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}

/// Proxy for one compositor-side surface client.
///
/// Dropping the last reference releases the remote object.
pub trait RemoteClient: Send + Sync {
    /// Numeric surface id assigned by the remote display.
    ///
    /// Unique only within its display.
    fn id(&self) -> u32;

    /// Queue `buffer` for composition.
    ///
    /// The transport keeps the handle and must deliver
    /// [`ContentBuffer::rendered`] and [`ContentBuffer::published`] on it
    /// exactly once each, from its own callback thread, once the compositor
    /// has composited respectively scanned out the frame. Routing the
    /// callbacks through the handle is what keeps them free of any pool
    /// locking.
    fn submit(&self, buffer: &Arc<ContentBuffer>) -> Result<(), RemoteError>;
}
