//! In-memory collaborators for the unit tests.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::allocator::{
    AcquireError, BufferId, ExportedPlane, Fourcc, GpuBuffer, GpuDevice, GpuWindow, Modifier,
    UserDataSlot, WindowFlags,
};
use crate::buffer::ContentBuffer;
use crate::display::Display;
use crate::remote::{Platform, RemoteClient, RemoteDisplay, RemoteError};
use crate::surface::{Surface, SurfaceCallback};

/// Unique display name so parallel tests do not share registry entries.
pub(crate) fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!("{prefix}-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub(crate) struct TestBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    format: Fourcc,
    modifier: Modifier,
    planes: usize,
    export_failure: AtomicBool,
    user_data: UserDataSlot,
}

impl TestBuffer {
    pub(crate) fn new(id: u64) -> Arc<TestBuffer> {
        Self::with_planes(id, 1)
    }

    pub(crate) fn with_planes(id: u64, planes: usize) -> Arc<TestBuffer> {
        Arc::new(TestBuffer {
            id: BufferId(id),
            width: 64,
            height: 64,
            format: Fourcc::Argb8888,
            modifier: Modifier::Linear,
            planes,
            export_failure: AtomicBool::new(false),
            user_data: UserDataSlot::new(),
        })
    }

    pub(crate) fn fail_exports(&self) {
        self.export_failure.store(true, Ordering::Relaxed);
    }
}

impl GpuBuffer for TestBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Modifier {
        self.modifier
    }

    fn plane_count(&self) -> usize {
        self.planes
    }

    fn export_plane(&self, _plane: usize) -> io::Result<ExportedPlane> {
        if self.export_failure.load(Ordering::Relaxed) {
            return Err(io::ErrorKind::Other.into());
        }
        let file = File::open("/dev/null")?;
        Ok(ExportedPlane {
            fd: OwnedFd::from(file),
            stride: self.width * 4,
            offset: 0,
        })
    }

    fn user_data(&self) -> &UserDataSlot {
        &self.user_data
    }
}

#[derive(Default)]
pub(crate) struct TestWindow {
    queue: Mutex<VecDeque<Arc<dyn GpuBuffer>>>,
    released: Mutex<Vec<BufferId>>,
}

impl TestWindow {
    pub(crate) fn push_front_buffer(&self, buffer: &Arc<TestBuffer>) {
        let buffer: Arc<dyn GpuBuffer> = buffer.clone();
        self.queue.lock().unwrap().push_back(buffer);
    }

    pub(crate) fn released(&self) -> Vec<BufferId> {
        self.released.lock().unwrap().clone()
    }
}

impl GpuWindow for TestWindow {
    fn lock_front_buffer(&self) -> Result<Arc<dyn GpuBuffer>, AcquireError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AcquireError::LockFrontBuffer(io::ErrorKind::WouldBlock.into()))
    }

    fn release_buffer(&self, buffer: &Arc<dyn GpuBuffer>) {
        self.released.lock().unwrap().push(buffer.id());
    }

    fn native(&self) -> *mut c_void {
        self as *const TestWindow as *mut c_void
    }
}

pub(crate) struct TestDevice {
    backend: String,
    pub(crate) window: Arc<TestWindow>,
    /// Formats `create_window` accepts; `None` accepts everything.
    pub(crate) supported: Option<Vec<Fourcc>>,
    pub(crate) requests: Mutex<Vec<(Fourcc, WindowFlags)>>,
}

impl TestDevice {
    pub(crate) fn new(backend: &str) -> TestDevice {
        TestDevice {
            backend: backend.to_owned(),
            window: Arc::new(TestWindow::default()),
            supported: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl GpuDevice for TestDevice {
    fn backend_name(&self) -> &str {
        &self.backend
    }

    fn create_window(
        &self,
        _width: u32,
        _height: u32,
        format: Fourcc,
        flags: WindowFlags,
    ) -> Result<Arc<dyn GpuWindow>, AcquireError> {
        self.requests.lock().unwrap().push((format, flags));
        let accepted = self
            .supported
            .as_ref()
            .map_or(true, |supported| supported.contains(&format));
        if accepted {
            Ok(self.window.clone())
        } else {
            Err(AcquireError::CreateWindow {
                format,
                source: io::ErrorKind::Unsupported.into(),
            })
        }
    }

    fn native(&self) -> *mut c_void {
        self as *const TestDevice as *mut c_void
    }
}

pub(crate) struct TestRemoteClient {
    id: u32,
    submitted: Mutex<VecDeque<Arc<ContentBuffer>>>,
    fail_submit: AtomicBool,
}

impl TestRemoteClient {
    pub(crate) fn fail_submits(&self) {
        self.fail_submit.store(true, Ordering::Relaxed);
    }

    /// Oldest submission not yet taken by the test.
    pub(crate) fn pop_submitted(&self) -> Option<Arc<ContentBuffer>> {
        self.submitted.lock().unwrap().pop_front()
    }

    pub(crate) fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

impl RemoteClient for TestRemoteClient {
    fn id(&self) -> u32 {
        self.id
    }

    fn submit(&self, buffer: &Arc<ContentBuffer>) -> Result<(), RemoteError> {
        if self.fail_submit.load(Ordering::Relaxed) {
            return Err(RemoteError::Disconnected);
        }
        self.submitted.lock().unwrap().push_back(buffer.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct TestRemoteDisplay {
    next_id: AtomicU32,
    clients: Mutex<Vec<Arc<TestRemoteClient>>>,
}

impl TestRemoteDisplay {
    pub(crate) fn last_client(&self) -> Arc<TestRemoteClient> {
        self.clients.lock().unwrap().last().expect("no client created yet").clone()
    }
}

impl RemoteDisplay for TestRemoteDisplay {
    fn render_node(&self) -> Result<PathBuf, RemoteError> {
        Ok(PathBuf::from("/dev/null"))
    }

    fn create_client(
        &self,
        _name: &str,
        _width: u32,
        _height: u32,
    ) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        let client = Arc::new(TestRemoteClient {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            submitted: Mutex::new(VecDeque::new()),
            fail_submit: AtomicBool::new(false),
        });
        self.clients.lock().unwrap().push(client.clone());
        Ok(client)
    }
}

pub(crate) struct TestPlatform {
    pub(crate) remote: Arc<TestRemoteDisplay>,
    pub(crate) device: Arc<TestDevice>,
    pub(crate) connects: AtomicUsize,
}

impl TestPlatform {
    pub(crate) fn new() -> TestPlatform {
        Self::with_device(TestDevice::new("drm"))
    }

    pub(crate) fn with_device(device: TestDevice) -> TestPlatform {
        TestPlatform {
            remote: Arc::new(TestRemoteDisplay::default()),
            device: Arc::new(device),
            connects: AtomicUsize::new(0),
        }
    }
}

impl Platform for TestPlatform {
    fn connect(&self, _display_name: &str) -> Result<Arc<dyn RemoteDisplay>, RemoteError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(self.remote.clone())
    }

    fn create_device(&self, _node: BorrowedFd<'_>) -> Result<Arc<dyn GpuDevice>, AcquireError> {
        Ok(self.device.clone())
    }
}

#[derive(Default)]
pub(crate) struct CountingCallback {
    rendered: AtomicUsize,
    published: AtomicUsize,
}

impl CountingCallback {
    pub(crate) fn rendered_count(&self) -> usize {
        self.rendered.load(Ordering::Relaxed)
    }

    pub(crate) fn published_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl SurfaceCallback for CountingCallback {
    fn rendered(&self, _surface: &Surface) {
        self.rendered.fetch_add(1, Ordering::Relaxed);
    }

    fn published(&self, _surface: &Surface) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

/// Recording sinks for the input tests.
#[derive(Default)]
pub(crate) struct RecordingSinks {
    pub(crate) keys: Mutex<Vec<(u32, crate::input::KeyState)>>,
    pub(crate) positions: Mutex<Vec<(i32, i32)>>,
    pub(crate) buttons: Mutex<Vec<(u8, crate::input::ButtonState)>>,
    pub(crate) scrolls: Mutex<Vec<(i16, i16)>>,
    pub(crate) touches: Mutex<Vec<(u8, crate::input::TouchState, u16, u16)>>,
}

impl crate::input::KeyboardSink for RecordingSinks {
    fn key(&self, code: u32, state: crate::input::KeyState, _time: u32) {
        self.keys.lock().unwrap().push((code, state));
    }
}

impl crate::input::PointerSink for RecordingSinks {
    fn button(&self, button: u8, state: crate::input::ButtonState, _time: u32) {
        self.buttons.lock().unwrap().push((button, state));
    }

    fn position(&self, x: i32, y: i32, _time: u32) {
        self.positions.lock().unwrap().push((x, y));
    }
}

impl crate::input::WheelSink for RecordingSinks {
    fn scroll(&self, dx: i16, dy: i16, _time: u32) {
        self.scrolls.lock().unwrap().push((dx, dy));
    }
}

impl crate::input::TouchSink for RecordingSinks {
    fn touch(&self, index: u8, state: crate::input::TouchState, x: u16, y: u16, _time: u32) {
        self.touches.lock().unwrap().push((index, state, x, y));
    }
}

/// A display backed by default mocks, plus handles to the mocks.
pub(crate) struct Fixture {
    pub(crate) display: Display,
    pub(crate) platform: Arc<TestPlatform>,
}

impl Fixture {
    pub(crate) fn new(prefix: &str) -> Fixture {
        Self::with_platform(prefix, TestPlatform::new())
    }

    pub(crate) fn with_platform(prefix: &str, platform: TestPlatform) -> Fixture {
        let platform = Arc::new(platform);
        let display = Display::instance(&unique_name(prefix), &*platform)
            .expect("mock display must initialize");
        Fixture { display, platform }
    }

    pub(crate) fn window(&self) -> &Arc<TestWindow> {
        &self.platform.device.window
    }

    /// Create a surface plus the remote client the compositor side sees.
    pub(crate) fn surface(
        &self,
        name: &str,
        callback: Option<Arc<CountingCallback>>,
    ) -> (Arc<Surface>, Arc<TestRemoteClient>) {
        let callback = callback.map(|cb| cb as Arc<dyn SurfaceCallback>);
        let surface = self
            .display
            .create(name, 64, 64, callback)
            .expect("mock surface must construct");
        (surface, self.platform.remote.last_client())
    }
}
