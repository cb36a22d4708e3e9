//! Named display connections and the process-wide registry.
//!
//! A [`Display`] is a reference-counted handle to one named connection to
//! the compositor. [`Display::instance`] is get-or-create over a
//! process-wide registry: the first handle for a name opens the RPC
//! transport, acquires the remote display proxy, opens the render node the
//! compositor points at, creates the allocator device on it and connects
//! the virtual-input socket. Dropping the last handle tears all of that
//! down again and removes the registry entry, so a later `instance` call
//! with the same name starts from scratch.
//!
//! The registry doubles as the root of the input fan-out:
//! [`Display::publish`] runs a closure over every live surface of every
//! live display.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;
use tracing::{debug, error, info};

use crate::allocator::{AcquireError, GpuDevice};
use crate::connector;
use crate::input::VirtualInput;
use crate::remote::{Platform, RemoteDisplay, RemoteError};
use crate::surface::{self, Surface, SurfaceCallback, SurfaceError};

static REGISTRY: Lazy<Mutex<HashMap<String, Weak<DisplayShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Errors opening a display connection.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// The compositor could not be reached or refused us.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The render node the compositor pointed at could not be opened.
    #[error("failed to open render node {path:?}")]
    RenderNode {
        /// Path the remote display reported.
        path: PathBuf,
        /// Underlying open error.
        #[source]
        source: io::Error,
    },
    /// The allocator device could not be created on the render node.
    #[error(transparent)]
    Device(#[from] AcquireError),
}

struct DisplayShared {
    name: String,
    remote: Arc<dyn RemoteDisplay>,
    device: Arc<dyn GpuDevice>,
    node: OwnedFd,
    surfaces: Mutex<Vec<Weak<Surface>>>,
    virtual_input: Mutex<Option<VirtualInput>>,
}

impl fmt::Debug for DisplayShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayShared")
            .field("name", &self.name)
            .field("node", &self.node.as_raw_fd())
            .finish()
    }
}

impl DisplayShared {
    fn initialize(name: &str, platform: &dyn Platform) -> Result<DisplayShared, DisplayError> {
        info!(display = name, "initializing display");

        let remote = platform.connect(name)?;
        let path = remote.render_node()?;
        // std opens every file with close-on-exec set.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DisplayError::RenderNode {
                path: path.clone(),
                source,
            })?;
        let node = OwnedFd::from(file);
        let device = platform.create_device(node.as_fd())?;
        debug!(
            display = name,
            node = ?path,
            backend = device.backend_name(),
            "allocator device ready"
        );

        let input_path = connector::input_endpoint();
        let virtual_input = match VirtualInput::open(name, &input_path) {
            Ok(input) => Some(input),
            Err(err) => {
                error!(display = name, ?err, path = ?input_path, "virtual input unavailable");
                None
            }
        };

        Ok(DisplayShared {
            name: name.to_owned(),
            remote,
            device,
            node,
            surfaces: Mutex::new(Vec::new()),
            virtual_input: Mutex::new(virtual_input),
        })
    }
}

impl Drop for DisplayShared {
    fn drop(&mut self) {
        {
            let mut registry = REGISTRY.lock().unwrap();
            if let Some(entry) = registry.get(&self.name) {
                if std::ptr::eq(entry.as_ptr(), self as *const DisplayShared) {
                    registry.remove(&self.name);
                }
            }
        }

        self.virtual_input.lock().unwrap().take();

        for weak in self.surfaces.lock().unwrap().drain(..) {
            if let Some(leaked) = weak.upgrade() {
                error!(
                    display = %self.name,
                    surface = %leaked.name(),
                    "surface not properly destructed"
                );
            }
        }

        // Remote display proxy and allocator device drop with the fields;
        // the render node closes last.
        info!(display = %self.name, "display destructed");
    }
}

/// Reference-counted handle to a named display connection.
///
/// Cloning is the `AddRef` of the remote-object world; dropping the last
/// clone deinitializes the connection.
#[derive(Clone)]
pub struct Display {
    shared: Arc<DisplayShared>,
}

impl fmt::Debug for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display").field("name", &self.shared.name).finish()
    }
}

impl Display {
    /// Get or create the display registered under `name`.
    ///
    /// `platform` is only consulted when the entry does not exist yet.
    pub fn instance(name: &str, platform: &dyn Platform) -> Result<Display, DisplayError> {
        let mut registry = REGISTRY.lock().unwrap();
        if let Some(shared) = registry.get(name).and_then(Weak::upgrade) {
            return Ok(Display { shared });
        }

        let shared = Arc::new(DisplayShared::initialize(name, platform)?);
        registry.insert(name.to_owned(), Arc::downgrade(&shared));
        Ok(Display { shared })
    }

    /// Name this display is registered under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Raw handle suitable as an `EGLNativeDisplayType`.
    pub fn native(&self) -> *mut c_void {
        self.shared.device.native()
    }

    /// File descriptor of the opened render node.
    pub fn file_descriptor(&self) -> RawFd {
        self.shared.node.as_raw_fd()
    }

    /// Create a surface of `width` x `height` pixels on this display.
    pub fn create(
        &self,
        name: &str,
        width: u32,
        height: u32,
        callback: Option<Arc<dyn SurfaceCallback>>,
    ) -> Result<Arc<Surface>, SurfaceError> {
        let window = surface::create_window(&self.shared.device, width, height)?;
        let remote = self.shared.remote.create_client(name, width, height)?;
        let surface = Surface::new(
            self.clone(),
            name.to_owned(),
            width,
            height,
            window,
            remote,
            callback,
        );
        self.shared.surfaces.lock().unwrap().push(Arc::downgrade(&surface));
        Ok(surface)
    }

    /// Find a live surface of this display by name.
    pub fn surface_by_name(&self, name: &str) -> Option<Arc<Surface>> {
        self.shared
            .surfaces
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|surface| surface.name() == name)
    }

    /// Run the housekeeping hook of every surface of this display.
    pub fn process(&self) {
        let surfaces: Vec<_> = self
            .shared
            .surfaces
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for surface in surfaces {
            surface.process();
        }
    }

    /// Run `f` on every live surface of every live display.
    ///
    /// The registry and surface lists are only locked while the targets are
    /// collected, not while `f` runs; delivery therefore cannot deadlock
    /// against a surface releasing itself or its display.
    pub fn publish<F: Fn(&Arc<Surface>)>(f: F) {
        let mut displays = Vec::new();
        let mut targets = Vec::new();
        {
            let registry = REGISTRY.lock().unwrap();
            displays.extend(registry.values().filter_map(Weak::upgrade));
            for shared in &displays {
                let surfaces = shared.surfaces.lock().unwrap();
                targets.extend(surfaces.iter().filter_map(Weak::upgrade));
            }
        }
        for surface in &targets {
            f(surface);
        }
    }

    pub(crate) fn unregister(&self, surface: *const Surface) {
        self.shared
            .surfaces
            .lock()
            .unwrap()
            .retain(|weak| weak.as_ptr() != surface && weak.strong_count() > 0);
    }

    #[cfg(test)]
    pub(crate) fn shared_ptr(&self) -> *const () {
        Arc::as_ptr(&self.shared) as *const ()
    }
}
