//! Virtual-input plumbing.
//!
//! An external event source publishes keyboard, mouse and touch events on
//! a Unix-domain socket (see [`crate::connector::input_endpoint`]). This
//! module decodes that stream on a dedicated thread and fans every event
//! out to all live surfaces of all displays; a surface forwards it to
//! whichever input sink the application attached.
//!
//! Mouse motion arrives as relative deltas and is integrated here, then
//! clamped per surface. Touch coordinates arrive 16.16 fixed-point and are
//! scaled per surface; consecutive identical touch events are suppressed
//! to cut IPC traffic.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::display::Display;
use crate::surface::Surface;

/// State of a key reported to a [`KeyboardSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Key was released.
    Released,
    /// Key was pressed.
    Pressed,
    /// Key is held and auto-repeating.
    Repeated,
}

/// State of a pointer button reported to a [`PointerSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    /// Button was released.
    Released,
    /// Button was pressed.
    Pressed,
}

/// State of a touch contact reported to a [`TouchSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    /// Contact lifted.
    Released,
    /// Contact started.
    Pressed,
    /// Contact moved.
    Motion,
}

/// Receiver for keyboard events attached to a surface.
pub trait KeyboardSink: Send + Sync {
    /// Deliver one key event.
    fn key(&self, code: u32, state: KeyState, time: u32);
}

/// Receiver for pointer events attached to a surface.
pub trait PointerSink: Send + Sync {
    /// Deliver one button event.
    fn button(&self, button: u8, state: ButtonState, time: u32);
    /// Deliver an absolute, surface-clamped pointer position.
    fn position(&self, x: i32, y: i32, time: u32);
}

/// Receiver for scroll-wheel events attached to a surface.
pub trait WheelSink: Send + Sync {
    /// Deliver one scroll step.
    fn scroll(&self, dx: i16, dy: i16, time: u32);
}

/// Receiver for touch events attached to a surface.
pub trait TouchSink: Send + Sync {
    /// Deliver one touch event in surface coordinates.
    fn touch(&self, index: u8, state: TouchState, x: u16, y: u16, time: u32);
}

/// Wire action of a keyboard frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAction {
    Released,
    Pressed,
    Repeated,
    /// Key sequence finished; not forwarded to surfaces.
    Completed,
}

/// Wire action of a mouse frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MouseAction {
    Released,
    Pressed,
    Motion,
    Scroll,
}

/// Wire action of a touch frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TouchAction {
    Released,
    Pressed,
    Motion,
}

/// One decoded frame of the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputEvent {
    Keyboard { action: KeyAction, code: u32 },
    Mouse { action: MouseAction, button: u16, dx: i16, dy: i16 },
    Touch { action: TouchAction, index: u16, x: u16, y: u16 },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("unknown input kind {0}")]
    UnknownKind(u8),
    #[error("unknown action {action} for input kind {kind}")]
    UnknownAction { kind: u8, action: u8 },
}

/// Frames are fixed-size: kind, action, and three little-endian u16 args.
pub(crate) const FRAME_LEN: usize = 8;

pub(crate) fn decode_frame(frame: &[u8; FRAME_LEN]) -> Result<InputEvent, DecodeError> {
    let kind = frame[0];
    let action = frame[1];
    let a0 = u16::from_le_bytes([frame[2], frame[3]]);
    let a1 = u16::from_le_bytes([frame[4], frame[5]]);
    let a2 = u16::from_le_bytes([frame[6], frame[7]]);

    match kind {
        0 => {
            let action = match action {
                0 => KeyAction::Released,
                1 => KeyAction::Pressed,
                2 => KeyAction::Repeated,
                3 => KeyAction::Completed,
                _ => return Err(DecodeError::UnknownAction { kind, action }),
            };
            Ok(InputEvent::Keyboard {
                action,
                code: a0 as u32 | (a1 as u32) << 16,
            })
        }
        1 => {
            let action = match action {
                0 => MouseAction::Released,
                1 => MouseAction::Pressed,
                2 => MouseAction::Motion,
                3 => MouseAction::Scroll,
                _ => return Err(DecodeError::UnknownAction { kind, action }),
            };
            Ok(InputEvent::Mouse {
                action,
                button: a0,
                dx: a1 as i16,
                dy: a2 as i16,
            })
        }
        2 => {
            let action = match action {
                0 => TouchAction::Released,
                1 => TouchAction::Pressed,
                2 => TouchAction::Motion,
                _ => return Err(DecodeError::UnknownAction { kind, action }),
            };
            Ok(InputEvent::Touch {
                action,
                index: a0,
                x: a1,
                y: a2,
            })
        }
        _ => Err(DecodeError::UnknownKind(kind)),
    }
}

/// One event readied for fan-out, with stream-level state already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Key { code: u32, state: KeyState, time: u32 },
    /// Integrated absolute position; clamped per surface at delivery.
    PointerPosition { x: i32, y: i32, time: u32 },
    PointerButton { button: u8, state: ButtonState, time: u32 },
    Wheel { dx: i16, dy: i16, time: u32 },
    /// Raw 16.16 coordinates; scaled per surface at delivery.
    Touch { index: u8, state: TouchState, x: u16, y: u16, time: u32 },
}

/// Stream-level input state: pointer integration and touch suppression.
#[derive(Debug)]
pub(crate) struct InputFanout {
    pointer_x: i32,
    pointer_y: i32,
    last_touch: (u16, u16, TouchAction),
}

impl InputFanout {
    pub(crate) fn new() -> Self {
        InputFanout {
            pointer_x: 0,
            pointer_y: 0,
            last_touch: (u16::MAX, u16::MAX, TouchAction::Released),
        }
    }

    /// Turn a decoded event into a delivery, or swallow it.
    pub(crate) fn route(&mut self, event: InputEvent, time: u32) -> Option<Delivery> {
        match event {
            InputEvent::Keyboard { action, code } => {
                let state = match action {
                    KeyAction::Released => KeyState::Released,
                    KeyAction::Pressed => KeyState::Pressed,
                    KeyAction::Repeated => KeyState::Repeated,
                    KeyAction::Completed => return None,
                };
                Some(Delivery::Key { code, state, time })
            }
            InputEvent::Mouse { action, button, dx, dy } => match action {
                MouseAction::Motion => {
                    self.pointer_x += dx as i32;
                    self.pointer_y += dy as i32;
                    Some(Delivery::PointerPosition {
                        x: self.pointer_x,
                        y: self.pointer_y,
                        time,
                    })
                }
                MouseAction::Scroll => Some(Delivery::Wheel { dx, dy, time }),
                MouseAction::Pressed | MouseAction::Released => Some(Delivery::PointerButton {
                    button: button as u8,
                    state: if action == MouseAction::Pressed {
                        ButtonState::Pressed
                    } else {
                        ButtonState::Released
                    },
                    time,
                }),
            },
            InputEvent::Touch { action, index, x, y } => {
                // The physical coordinates may differ while the on-screen
                // position does not; identical consecutive events carry no
                // information and are not worth the IPC.
                if self.last_touch == (x, y, action) {
                    return None;
                }
                self.last_touch = (x, y, action);
                let state = match action {
                    TouchAction::Released => TouchState::Released,
                    TouchAction::Pressed => TouchState::Pressed,
                    TouchAction::Motion => TouchState::Motion,
                };
                Some(Delivery::Touch {
                    index: index as u8,
                    state,
                    x,
                    y,
                    time,
                })
            }
        }
    }
}

/// Hand one delivery to a surface, applying its geometry.
pub(crate) fn deliver(surface: &Arc<Surface>, delivery: &Delivery) {
    match *delivery {
        Delivery::Key { code, state, time } => surface.send_key(code, state, time),
        Delivery::PointerPosition { x, y, time } => {
            let x = x.clamp(0, surface.width() as i32);
            let y = y.clamp(0, surface.height() as i32);
            surface.send_pointer_position(x, y, time);
        }
        Delivery::PointerButton { button, state, time } => {
            surface.send_pointer_button(button, state, time)
        }
        Delivery::Wheel { dx, dy, time } => surface.send_wheel_motion(dx, dy, time),
        Delivery::Touch { index, state, x, y, time } => {
            let mapped_x = ((surface.width() as u64 * x as u64) >> 16) as u16;
            let mapped_y = ((surface.height() as u64 * y as u64) >> 16) as u16;
            surface.send_touch(index, state, mapped_x, mapped_y, time);
        }
    }
}

fn timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

/// Connection to the virtual-input socket.
///
/// Owns the reader thread; dropping the handle shuts the socket down and
/// joins the thread.
#[derive(Debug)]
pub(crate) struct VirtualInput {
    stream: UnixStream,
    reader: Option<JoinHandle<()>>,
}

impl VirtualInput {
    /// Connect to the event source at `path` on behalf of `display_name`.
    pub(crate) fn open(display_name: &str, path: &Path) -> io::Result<VirtualInput> {
        let mut stream = UnixStream::connect(path)?;

        // Announce ourselves: length-prefixed display name.
        let name = display_name.as_bytes();
        let len = name.len().min(u8::MAX as usize);
        stream.write_all(&[len as u8])?;
        stream.write_all(&name[..len])?;

        let mut socket = stream.try_clone()?;
        let reader = std::thread::Builder::new()
            .name("virtual-input".into())
            .spawn(move || {
                let mut fanout = InputFanout::new();
                let mut frame = [0u8; FRAME_LEN];
                loop {
                    if let Err(err) = socket.read_exact(&mut frame) {
                        if err.kind() != io::ErrorKind::UnexpectedEof {
                            info!(?err, "input stream closed");
                        }
                        break;
                    }
                    match decode_frame(&frame) {
                        Ok(event) => {
                            if let Some(delivery) = fanout.route(event, timestamp()) {
                                Display::publish(|surface| deliver(surface, &delivery));
                            }
                        }
                        Err(err) => warn!(?err, "dropping undecodable input frame"),
                    }
                }
            })?;

        debug!(display = display_name, ?path, "virtual input connected");
        Ok(VirtualInput {
            stream,
            reader: Some(reader),
        })
    }
}

impl Drop for VirtualInput {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}
