//! One client window and its swap pipeline.
//!
//! A [`Surface`] owns an allocator window the application renders into
//! through EGL, a remote client object representing it inside the
//! compositor, and the per-surface buffer pool. Its pipeline moves every
//! front buffer the allocator releases through the
//! [`BufferState`](crate::buffer::BufferState) cycle:
//! [`request_render`](Surface::request_render) stages and submits the
//! buffer, the compositor's *rendered* signal promotes it to active and
//! retires its predecessor, the *published* signal releases the retired
//! one back to the allocator.
//!
//! Ownership is strict: a buffer is held by exactly one of the GPU, the
//! compositor or the allocator pool at any time. The `active` and
//! `retired` single-slot cells enforce that at most one buffer occupies
//! each of those two states, and they are only touched with atomic
//! exchanges so the compositor callbacks never contend on the pool mutex.

use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::allocator::{AcquireError, Fourcc, GpuBuffer, GpuDevice, GpuWindow, WindowFlags};
use crate::buffer::{BufferPool, ContentBuffer};
use crate::display::Display;
use crate::input::{
    ButtonState, KeyState, KeyboardSink, PointerSink, TouchSink, TouchState, WheelSink,
};
use crate::remote::{RemoteClient, RemoteError};
use crate::utils::AtomicCell;

/// Pixel formats tried for the allocator window, best first.
///
/// Full-alpha 32-bit formats are preferred, opaque ones next, 16-bit as
/// the memory-efficient fallback.
pub const FORMAT_PRIORITY: [Fourcc; 5] = [
    Fourcc::Argb8888,
    Fourcc::Abgr8888,
    Fourcc::Xrgb8888,
    Fourcc::Xbgr8888,
    Fourcc::Rgb565,
];

/// Allocator backend that rejects usage flags on window creation.
const NO_FLAG_BACKEND: &str = "nvidia";

/// Frame notifications fired back to the application.
///
/// Both run on the compositor's callback thread and must return quickly.
pub trait SurfaceCallback: Send + Sync {
    /// A frame of this surface finished compositing.
    ///
    /// Also fired synthetically when a frame is dropped, so a render loop
    /// waiting for it never stalls.
    fn rendered(&self, surface: &Surface);
    /// A frame of this surface finished scan-out.
    fn published(&self, surface: &Surface);
}

/// Errors constructing a surface.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// No candidate format produced an allocator window.
    #[error("no window for any of the {0} candidate formats")]
    NoSupportedFormat(usize),
    /// The remote display did not provide a client object.
    #[error("the remote display did not provide a client")]
    Remote(#[from] RemoteError),
}

/// Walk the format priority list until the device accepts one.
pub(crate) fn create_window(
    device: &Arc<dyn GpuDevice>,
    width: u32,
    height: u32,
) -> Result<Arc<dyn GpuWindow>, SurfaceError> {
    let mut flags = WindowFlags::empty();
    if device.backend_name() != NO_FLAG_BACKEND {
        flags |= WindowFlags::RENDERING;
    }

    for format in FORMAT_PRIORITY {
        match device.create_window(width, height, format, flags) {
            Ok(window) => {
                debug!(%format, ?flags, "created allocator window");
                return Ok(window);
            }
            Err(err @ AcquireError::CreateWindow { .. }) => {
                warn!(%format, ?err, "window creation failed, trying next format")
            }
            Err(err) => warn!(%format, ?err, "window creation failed"),
        }
    }

    Err(SurfaceError::NoSupportedFormat(FORMAT_PRIORITY.len()))
}

/// One client window shared with the remote compositor.
pub struct Surface {
    name: String,
    id: u32,
    width: u32,
    height: u32,
    weak_self: std::sync::Weak<Surface>,
    display: Display,
    window: Mutex<Option<Arc<dyn GpuWindow>>>,
    remote: Mutex<Option<Arc<dyn RemoteClient>>>,
    callback: Option<Arc<dyn SurfaceCallback>>,
    keyboard: Mutex<Option<Arc<dyn KeyboardSink>>>,
    pointer: Mutex<Option<Arc<dyn PointerSink>>>,
    wheel: Mutex<Option<Arc<dyn WheelSink>>>,
    touch_panel: Mutex<Option<Arc<dyn TouchSink>>>,
    pool: BufferPool,
    active: AtomicCell<ContentBuffer>,
    retired: AtomicCell<ContentBuffer>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("size", &(self.width, self.height))
            .finish()
    }
}

impl Surface {
    pub(crate) fn new(
        display: Display,
        name: String,
        width: u32,
        height: u32,
        window: Arc<dyn GpuWindow>,
        remote: Arc<dyn RemoteClient>,
        callback: Option<Arc<dyn SurfaceCallback>>,
    ) -> Arc<Surface> {
        let id = remote.id();
        info!(surface = id, %name, width, height, "constructed surface");
        Arc::new_cyclic(|weak_self| Surface {
            name,
            id,
            width,
            height,
            weak_self: weak_self.clone(),
            display,
            window: Mutex::new(Some(window)),
            remote: Mutex::new(Some(remote)),
            callback,
            keyboard: Mutex::new(None),
            pointer: Mutex::new(None),
            wheel: Mutex::new(None),
            touch_panel: Mutex::new(None),
            pool: BufferPool::new(),
            active: AtomicCell::new(),
            retired: AtomicCell::new(),
        })
    }

    /// Weak handle for back-references out of owned buffers.
    pub(crate) fn weak(&self) -> std::sync::Weak<Surface> {
        self.weak_self.clone()
    }

    /// Raw handle suitable as an `EGLNativeWindowType`.
    ///
    /// Null once the surface is torn down.
    pub fn native(&self) -> *mut c_void {
        self.window
            .lock()
            .unwrap()
            .as_ref()
            .map(|window| window.native())
            .unwrap_or(ptr::null_mut())
    }

    /// Name the surface was created under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric id assigned by the remote display; unique per display only.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Width in real GPU pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in real GPU pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Housekeeping hook for the application's render loop.
    pub fn process(&self) {}

    /// Hand the just-swapped front buffer to the compositor.
    ///
    /// Call after every buffer swap. Whatever happens - a missing front
    /// buffer, an exhausted pool, an illegal state, a dead compositor -
    /// the application receives exactly one rendered notification for this
    /// call, real or synthetic, so its render loop keeps turning.
    #[profiling::function]
    pub fn request_render(&self) {
        let window = self.window.lock().unwrap().clone();
        let remote = self.remote.lock().unwrap().clone();
        let (window, remote) = match (window, remote) {
            (Some(window), Some(remote)) => (window, remote),
            _ => {
                debug!(surface = self.id, "render request on torn-down surface");
                self.notify_rendered();
                return;
            }
        };

        let bo = match window.lock_front_buffer() {
            Ok(bo) => bo,
            Err(err) => {
                warn!(surface = self.id, ?err, "dropping frame: no front buffer");
                self.notify_rendered();
                return;
            }
        };

        let buffer = match self.pool.get_or_create(self, &remote, &bo) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(surface = self.id, buffer = %bo.id(), ?err, "dropping frame: pool refused buffer");
                window.release_buffer(&bo);
                self.notify_rendered();
                return;
            }
        };

        if !buffer.stage() || !buffer.submit() {
            window.release_buffer(&bo);
            self.notify_rendered();
        }
        // On success the compositor owns the buffer until it is published.
    }

    /// Promotion path for the compositor's rendered signal.
    pub(crate) fn buffer_rendered(&self, buffer: &Arc<ContentBuffer>) {
        if !buffer.activate() {
            // Unexpected state; already reported by the state machine.
            return;
        }

        if let Some(previous) = self.active.swap(Some(buffer.clone())) {
            if !Arc::ptr_eq(&previous, buffer) && previous.retire() {
                if let Some(orphan) = self.retired.swap(Some(previous)) {
                    // The published signal that should have released this
                    // buffer was dropped somewhere.
                    error!(
                        surface = self.id,
                        buffer = %orphan.id(),
                        "orphaned retired buffer, forcing release"
                    );
                    orphan.force_release();
                    self.release_to_allocator(&orphan);
                }
            }
        }

        self.notify_rendered();
    }

    /// Release path for the compositor's published signal.
    pub(crate) fn buffer_published(&self, _buffer: &Arc<ContentBuffer>) {
        if let Some(retired) = self.retired.take() {
            if retired.release() {
                self.release_to_allocator(&retired);
            }
        }
        self.notify_published();
    }

    /// The allocator destroyed the object behind `buffer`.
    pub(crate) fn buffer_destroyed(&self, buffer: &Arc<ContentBuffer>) {
        debug!(surface = self.id, buffer = %buffer.id(), "allocator destroyed buffer object");
        self.pool.evict(buffer, &self.active, &self.retired);
    }

    fn release_to_allocator(&self, buffer: &Arc<ContentBuffer>) {
        if let Some(window) = self.window.lock().unwrap().clone() {
            window.release_buffer(buffer.bo());
        }
    }

    fn notify_rendered(&self) {
        if let Some(callback) = &self.callback {
            callback.rendered(self);
        }
    }

    fn notify_published(&self) {
        if let Some(callback) = &self.callback {
            callback.published(self);
        }
    }

    /// Attach or detach the keyboard sink.
    ///
    /// The setter must flip between attached and detached; replacing one
    /// sink with another in a single call is a caller bug. Sinks are only
    /// set from the application thread that owns the surface.
    pub fn set_keyboard(&self, sink: Option<Arc<dyn KeyboardSink>>) {
        let attached = self.keyboard.lock().unwrap().is_some();
        debug_assert!(attached ^ sink.is_some(), "keyboard setter must toggle");
        *self.keyboard.lock().unwrap() = sink;
    }

    /// Attach or detach the pointer sink. Same toggle contract as
    /// [`set_keyboard`](Surface::set_keyboard).
    pub fn set_pointer(&self, sink: Option<Arc<dyn PointerSink>>) {
        let attached = self.pointer.lock().unwrap().is_some();
        debug_assert!(attached ^ sink.is_some(), "pointer setter must toggle");
        *self.pointer.lock().unwrap() = sink;
    }

    /// Attach or detach the wheel sink. Same toggle contract as
    /// [`set_keyboard`](Surface::set_keyboard).
    pub fn set_wheel(&self, sink: Option<Arc<dyn WheelSink>>) {
        let attached = self.wheel.lock().unwrap().is_some();
        debug_assert!(attached ^ sink.is_some(), "wheel setter must toggle");
        *self.wheel.lock().unwrap() = sink;
    }

    /// Attach or detach the touch-panel sink. Same toggle contract as
    /// [`set_keyboard`](Surface::set_keyboard).
    pub fn set_touch_panel(&self, sink: Option<Arc<dyn TouchSink>>) {
        let attached = self.touch_panel.lock().unwrap().is_some();
        debug_assert!(attached ^ sink.is_some(), "touch panel setter must toggle");
        *self.touch_panel.lock().unwrap() = sink;
    }

    /// Deliver one key event to the attached sink, if any.
    pub fn send_key(&self, code: u32, state: KeyState, time: u32) {
        let sink = self.keyboard.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.key(code, state, time);
        }
    }

    /// Deliver one pointer-button event to the attached sink, if any.
    pub fn send_pointer_button(&self, button: u8, state: ButtonState, time: u32) {
        let sink = self.pointer.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.button(button, state, time);
        }
    }

    /// Deliver an absolute pointer position to the attached sink, if any.
    pub fn send_pointer_position(&self, x: i32, y: i32, time: u32) {
        let sink = self.pointer.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.position(x, y, time);
        }
    }

    /// Deliver one scroll step to the attached sink, if any.
    pub fn send_wheel_motion(&self, dx: i16, dy: i16, time: u32) {
        let sink = self.wheel.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.scroll(dx, dy, time);
        }
    }

    /// Deliver one touch event to the attached sink, if any.
    pub fn send_touch(&self, index: u8, state: TouchState, x: u16, y: u16, time: u32) {
        let sink = self.touch_panel.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.touch(index, state, x, y, time);
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        info!(surface = self.id, name = %self.name, "destroying surface");
        self.display.unregister(self as *const Surface);

        *self.keyboard.lock().unwrap() = None;
        *self.pointer.lock().unwrap() = None;
        *self.wheel.lock().unwrap() = None;
        *self.touch_panel.lock().unwrap() = None;

        // From here on any concurrent render request takes the synthetic
        // rendered path.
        let window = self.window.lock().unwrap().take();

        let drained = self.pool.teardown(&self.active, &self.retired);
        if drained > 0 {
            debug!(surface = self.id, drained, "drained buffer pool");
        }

        // Release the remote client, then the allocator window; the display
        // reference goes last, with the struct.
        *self.remote.lock().unwrap() = None;
        drop(window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferId;
    use crate::buffer::BufferState;
    use crate::input::KeyState;
    use crate::testing::{
        CountingCallback, Fixture, RecordingSinks, TestBuffer, TestDevice, TestPlatform,
        TestRemoteClient,
    };
    use crate::utils::monitor::ResourceMonitor;

    use std::sync::Arc;

    fn pipeline(prefix: &str) -> (Fixture, Arc<Surface>, Arc<TestRemoteClient>, Arc<CountingCallback>) {
        let fixture = Fixture::new(prefix);
        let callback = Arc::new(CountingCallback::default());
        let (surface, client) = fixture.surface("win", Some(callback.clone()));
        (fixture, surface, client, callback)
    }

    #[test]
    fn happy_path_frame() {
        let (fixture, surface, client, callback) = pipeline("surface-happy");
        let b1 = TestBuffer::new(1);
        fixture.window().push_front_buffer(&b1);

        surface.request_render();
        assert_eq!(surface.pool().occupied(), 1);
        let submitted = client.pop_submitted().expect("frame must be submitted");
        assert_eq!(submitted.state(), BufferState::Pending);
        assert_eq!(callback.rendered_count(), 0, "no notification before the compositor answers");
        assert_eq!(callback.published_count(), 0);

        submitted.rendered();
        assert_eq!(submitted.state(), BufferState::Active);
        assert_eq!(callback.rendered_count(), 1);

        submitted.published();
        assert_eq!(callback.published_count(), 1);
        assert_eq!(submitted.state(), BufferState::Active, "nothing was retired yet");
        assert!(fixture.window().released().is_empty());
    }

    #[test]
    fn two_frame_rotation_releases_the_displaced_buffer() {
        let (fixture, surface, client, _callback) = pipeline("surface-rotate");
        let b1 = TestBuffer::new(1);
        let b2 = TestBuffer::new(2);

        fixture.window().push_front_buffer(&b1);
        surface.request_render();
        let first = client.pop_submitted().expect("first frame");
        first.rendered();
        first.published();

        fixture.window().push_front_buffer(&b2);
        surface.request_render();
        assert_eq!(surface.pool().occupied(), 2);
        let second = client.pop_submitted().expect("second frame");

        second.rendered();
        assert_eq!(second.state(), BufferState::Active);
        assert_eq!(first.state(), BufferState::Retired);

        second.published();
        assert_eq!(first.state(), BufferState::Free);
        assert_eq!(fixture.window().released(), vec![BufferId(1)]);
    }

    #[test]
    fn recycled_buffer_reuses_its_wrapper() {
        let (fixture, surface, client, _callback) = pipeline("surface-recycle");
        let b1 = TestBuffer::new(1);
        let b2 = TestBuffer::new(2);

        // Rotate b1 out so it is FREE again.
        fixture.window().push_front_buffer(&b1);
        surface.request_render();
        let first = client.pop_submitted().expect("first frame");
        first.rendered();
        fixture.window().push_front_buffer(&b2);
        surface.request_render();
        let second = client.pop_submitted().expect("second frame");
        second.rendered();
        second.published();
        assert_eq!(first.state(), BufferState::Free);

        // The allocator hands b1 out again.
        fixture.window().push_front_buffer(&b1);
        surface.request_render();
        let recycled = client.pop_submitted().expect("recycled frame");
        assert!(Arc::ptr_eq(&recycled, &first), "recycle must hit the existing wrapper");
        assert_eq!(surface.pool().occupied(), 2, "no new slot for a recycled buffer");
        assert_eq!(recycled.state(), BufferState::Pending);
    }

    #[test]
    fn pool_exhaustion_drops_the_fifth_buffer() {
        let (fixture, surface, client, callback) = pipeline("surface-exhaust");

        for id in 1..=4 {
            fixture.window().push_front_buffer(&TestBuffer::new(id));
            surface.request_render();
        }
        assert_eq!(client.submitted_count(), 4);
        assert_eq!(callback.rendered_count(), 0);

        let b5 = TestBuffer::new(5);
        fixture.window().push_front_buffer(&b5);
        surface.request_render();

        assert_eq!(callback.rendered_count(), 1, "the dropped frame still notifies");
        assert_eq!(client.submitted_count(), 4);
        assert_eq!(fixture.window().released(), vec![BufferId(5)]);
        assert_eq!(surface.pool().occupied(), 4);
        assert!(b5.user_data().get().is_none());
    }

    #[test]
    fn orphaned_retired_buffer_is_force_released() {
        let (fixture, surface, client, callback) = pipeline("surface-orphan");

        // First b, then a, without any published signals: a is ACTIVE and
        // b is RETIRED.
        fixture.window().push_front_buffer(&TestBuffer::new(1));
        surface.request_render();
        let b = client.pop_submitted().expect("frame b");
        b.rendered();

        fixture.window().push_front_buffer(&TestBuffer::new(2));
        surface.request_render();
        let a = client.pop_submitted().expect("frame a");
        a.rendered();
        assert_eq!(a.state(), BufferState::Active);
        assert_eq!(b.state(), BufferState::Retired);

        fixture.window().push_front_buffer(&TestBuffer::new(3));
        surface.request_render();
        let c = client.pop_submitted().expect("frame c");
        c.rendered();

        assert_eq!(c.state(), BufferState::Active);
        assert_eq!(a.state(), BufferState::Retired);
        assert_eq!(b.state(), BufferState::Free, "the orphan must be force-released");
        assert_eq!(fixture.window().released(), vec![BufferId(1)]);
        assert_eq!(callback.rendered_count(), 3);
    }

    #[test]
    fn teardown_with_inflight_buffer() {
        let (fixture, surface, client, callback) = pipeline("surface-teardown");
        let a = TestBuffer::new(1);
        fixture.window().push_front_buffer(&a);
        surface.request_render();

        let inflight = client.pop_submitted().expect("in-flight frame");
        assert_eq!(inflight.state(), BufferState::Pending);
        let token = inflight.monitor_token();
        assert!(ResourceMonitor::instance().contains(token));

        drop(surface);

        assert!(a.user_data().get().is_none(), "teardown must disarm the destroy callback");

        // Late compositor signals hit a dead surface and vanish.
        inflight.rendered();
        assert_eq!(callback.rendered_count(), 0);

        // The transport's reference was the last one keeping the wrapper.
        drop(inflight);
        assert!(!ResourceMonitor::instance().contains(token), "descriptors must be closed");

        // A late destroy signal from the allocator is a no-op.
        a.user_data().destroyed();
    }

    #[test]
    fn allocator_destroy_signal_evicts_the_buffer() {
        let (fixture, surface, client, _callback) = pipeline("surface-evict");
        let b1 = TestBuffer::new(1);
        fixture.window().push_front_buffer(&b1);
        surface.request_render();
        let submitted = client.pop_submitted().expect("frame");
        submitted.rendered();
        assert_eq!(surface.pool().occupied(), 1);

        b1.user_data().destroyed();
        assert_eq!(surface.pool().occupied(), 0);
        assert!(b1.user_data().get().is_none());
    }

    #[test]
    fn lock_failure_synthesizes_rendered() {
        let (_fixture, surface, client, callback) = pipeline("surface-lock");
        // Nothing queued in the window: the front-buffer lock fails.
        surface.request_render();
        assert_eq!(callback.rendered_count(), 1);
        assert_eq!(client.submitted_count(), 0);
    }

    #[test]
    fn submit_failure_drops_the_frame() {
        let (fixture, surface, client, callback) = pipeline("surface-disconnect");
        client.fail_submits();

        let b1 = TestBuffer::new(1);
        fixture.window().push_front_buffer(&b1);
        surface.request_render();

        assert_eq!(callback.rendered_count(), 1);
        assert_eq!(fixture.window().released(), vec![BufferId(1)]);
    }

    #[test]
    fn multi_plane_buffer_is_rejected() {
        let (fixture, surface, _client, callback) = pipeline("surface-planes");
        let nv12ish = TestBuffer::with_planes(1, 2);
        fixture.window().push_front_buffer(&nv12ish);
        surface.request_render();

        assert_eq!(callback.rendered_count(), 1);
        assert_eq!(fixture.window().released(), vec![BufferId(1)]);
        assert_eq!(surface.pool().occupied(), 0);
    }

    #[test]
    fn export_failure_drops_the_frame() {
        let (fixture, surface, _client, callback) = pipeline("surface-export");
        let b1 = TestBuffer::new(1);
        b1.fail_exports();
        fixture.window().push_front_buffer(&b1);
        surface.request_render();

        assert_eq!(callback.rendered_count(), 1);
        assert_eq!(fixture.window().released(), vec![BufferId(1)]);
    }

    #[test]
    fn resubmission_before_any_signal_is_rejected() {
        let (fixture, surface, client, callback) = pipeline("surface-resubmit");
        let b1 = TestBuffer::new(1);
        fixture.window().push_front_buffer(&b1);
        surface.request_render();
        let submitted = client.pop_submitted().expect("frame");

        // The allocator hands the same object out again while it is still
        // PENDING; staging must fail and the frame drop.
        fixture.window().push_front_buffer(&b1);
        surface.request_render();

        assert_eq!(callback.rendered_count(), 1);
        assert_eq!(submitted.state(), BufferState::Pending);
        assert_eq!(fixture.window().released(), vec![BufferId(1)]);
    }

    #[test]
    fn window_creation_walks_the_priority_list() {
        let mut device = TestDevice::new("drm");
        device.supported = Some(vec![Fourcc::Rgb565]);
        let fixture = Fixture::with_platform("surface-formats", TestPlatform::with_device(device));
        let (_surface, _client) = fixture.surface("win", None);

        let requests = fixture.platform.device.requests.lock().unwrap().clone();
        let formats: Vec<Fourcc> = requests.iter().map(|(format, _)| *format).collect();
        assert_eq!(formats, FORMAT_PRIORITY.to_vec());
        assert!(requests
            .iter()
            .all(|(_, flags)| flags.contains(WindowFlags::RENDERING)));
    }

    #[test]
    fn no_flag_backend_omits_usage_flags() {
        let device = TestDevice::new("nvidia");
        let fixture = Fixture::with_platform("surface-noflag", TestPlatform::with_device(device));
        let (_surface, _client) = fixture.surface("win", None);

        let requests = fixture.platform.device.requests.lock().unwrap().clone();
        assert!(!requests.is_empty());
        assert!(requests.iter().all(|(_, flags)| flags.is_empty()));
    }

    #[test]
    fn construction_fails_without_a_usable_format() {
        let mut device = TestDevice::new("drm");
        device.supported = Some(Vec::new());
        let fixture = Fixture::with_platform("surface-nofmt", TestPlatform::with_device(device));

        let result = fixture.display.create("win", 64, 64, None);
        assert!(
            matches!(result, Err(SurfaceError::NoSupportedFormat(5))),
            "got {result:?}"
        );
    }

    #[test]
    fn sink_attach_detach_restores_refcount() {
        let (_fixture, surface, _client, _callback) = pipeline("surface-sink");
        let sinks = Arc::new(RecordingSinks::default());
        assert_eq!(Arc::strong_count(&sinks), 1);

        surface.set_keyboard(Some(sinks.clone()));
        assert_eq!(Arc::strong_count(&sinks), 2);

        surface.set_keyboard(None);
        assert_eq!(Arc::strong_count(&sinks), 1);
    }

    #[test]
    #[should_panic(expected = "keyboard setter must toggle")]
    fn replacing_an_attached_sink_panics() {
        let (_fixture, surface, _client, _callback) = pipeline("surface-xor");
        let sinks = Arc::new(RecordingSinks::default());
        surface.set_keyboard(Some(sinks.clone()));
        surface.set_keyboard(Some(sinks));
    }

    #[test]
    fn events_reach_attached_sinks_only() {
        let (_fixture, surface, _client, _callback) = pipeline("surface-send");

        // No sink: silently dropped.
        surface.send_key(30, KeyState::Pressed, 0);

        let sinks = Arc::new(RecordingSinks::default());
        surface.set_keyboard(Some(sinks.clone()));
        surface.send_key(31, KeyState::Pressed, 1);
        surface.send_key(31, KeyState::Released, 2);

        assert_eq!(
            sinks.keys.lock().unwrap().as_slice(),
            &[(31, KeyState::Pressed), (31, KeyState::Released)]
        );
    }

    #[test]
    fn accessors_report_construction_values() {
        let (_fixture, surface, client, _callback) = pipeline("surface-accessors");
        assert!(!surface.native().is_null());
        assert_eq!(surface.id(), client.id());
        assert_eq!(surface.width(), 64);
        assert_eq!(surface.height(), 64);
        assert_eq!(surface.name(), "win");
    }
}
