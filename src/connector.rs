//! Connector sockets shared with the compositor.
//!
//! The compositor listens on a small set of Unix-domain sockets below a
//! common base directory (`$XDG_RUNTIME_DIR`, falling back to
//! `/tmp/Compositor`). This module resolves those endpoints and implements
//! the one-shot *descriptor offer*: handing the exported file descriptors
//! of a buffer to the compositor as `SCM_RIGHTS` ancillary data, tagged
//! with the id of the surface the buffer belongs to.
//!
//! An offer is answered by a single status byte. Send and acknowledgement
//! together must finish within [`OFFER_TIMEOUT`]; a compositor that does
//! not answer in time rejects the registration.

use std::env;
use std::io::{self, IoSlice, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tracing::debug;

use crate::allocator::{ExportedPlane, MAX_PLANES};

/// Budget for one descriptor offer, send and acknowledgement combined.
pub const OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum number of descriptors a single offer may carry.
pub const MAX_DESCRIPTORS: usize = MAX_PLANES;

/// Status byte the compositor answers an accepted offer with.
const ACCEPTED: u8 = 0;

/// Base directory of the compositor's connector sockets.
pub fn connector_dir() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("/tmp/Compositor"),
    }
}

/// Socket receiving descriptor offers.
pub fn descriptor_endpoint() -> PathBuf {
    connector_dir().join("descriptors")
}

/// Socket carrying the RPC transport to the remote display.
pub fn rpc_endpoint() -> PathBuf {
    connector_dir().join("comrpc")
}

/// Socket of the virtual-input event source.
pub fn input_endpoint() -> PathBuf {
    match env::var_os("VIRTUAL_INPUT") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("/tmp/keyhandler"),
    }
}

/// Reasons a descriptor offer did not take.
#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    /// The descriptor socket could not be reached.
    #[error("the descriptor socket is unreachable")]
    Unreachable(#[source] io::Error),
    /// More descriptors than one request may carry.
    #[error("{count} descriptors exceed the per-request maximum of {MAX_DESCRIPTORS}")]
    TooManyDescriptors {
        /// Number of descriptors in the rejected offer.
        count: usize,
    },
    /// The compositor did not answer within the budget.
    #[error("the compositor did not accept the offer within {OFFER_TIMEOUT:?}")]
    Timeout,
    /// The compositor hung up before answering.
    #[error("the compositor closed the connection during the offer")]
    Disconnected,
    /// The compositor answered with a non-zero status.
    #[error("the compositor refused the offer (status {status})")]
    Refused {
        /// Status byte received instead of an acceptance.
        status: u8,
    },
    /// The connection failed mid-request.
    #[error("i/o error during the offer")]
    Transport(#[source] io::Error),
}

/// Offer the exported planes of one buffer to the compositor.
///
/// On success the compositor holds its own duplicates of the descriptors;
/// the caller keeps the local copies in `planes`.
#[profiling::function]
pub fn offer_descriptors(surface_id: u32, planes: &[ExportedPlane]) -> Result<(), OfferError> {
    offer_descriptors_at(&descriptor_endpoint(), surface_id, planes, OFFER_TIMEOUT)
}

pub(crate) fn offer_descriptors_at(
    endpoint: &std::path::Path,
    surface_id: u32,
    planes: &[ExportedPlane],
    timeout: Duration,
) -> Result<(), OfferError> {
    if planes.len() > MAX_DESCRIPTORS {
        return Err(OfferError::TooManyDescriptors { count: planes.len() });
    }

    let deadline = Instant::now() + timeout;

    let mut stream = UnixStream::connect(endpoint).map_err(OfferError::Unreachable)?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(OfferError::Transport)?;

    let mut payload = [0u8; 5];
    payload[..4].copy_from_slice(&surface_id.to_le_bytes());
    payload[4] = planes.len() as u8;

    let fds: Vec<_> = planes.iter().map(|plane| plane.fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(&payload)];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = loop {
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(sent) => break sent,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Err(OfferError::Timeout),
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(OfferError::Disconnected),
            Err(errno) => return Err(OfferError::Transport(io::Error::from(errno))),
        }
    };
    if sent != payload.len() {
        return Err(OfferError::Transport(io::ErrorKind::WriteZero.into()));
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(OfferError::Timeout);
    }
    stream
        .set_read_timeout(Some(remaining))
        .map_err(OfferError::Transport)?;

    let mut ack = [0u8; 1];
    match stream.read(&mut ack) {
        Ok(0) => Err(OfferError::Disconnected),
        Ok(_) if ack[0] == ACCEPTED => {
            debug!(surface = surface_id, descriptors = fds.len(), "offer accepted");
            Ok(())
        }
        Ok(_) => Err(OfferError::Refused { status: ack[0] }),
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Err(OfferError::Timeout)
        }
        Err(err) => Err(OfferError::Transport(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ExportedPlane;

    use std::fs::File;
    use std::io::{IoSliceMut, Write};
    use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};

    fn socket_path() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "compositor-client-offer-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn plane() -> ExportedPlane {
        let file = File::open("/dev/null").expect("/dev/null must open");
        ExportedPlane {
            fd: OwnedFd::from(file),
            stride: 256,
            offset: 0,
        }
    }

    #[test]
    fn offer_delivers_id_and_descriptors() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).expect("bind listener");

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept offer");
            let mut buf = [0u8; 16];
            let (bytes, fds) = {
                let mut iovs = [IoSliceMut::new(&mut buf)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_DESCRIPTORS]);
                let msg = recvmsg::<UnixAddr>(
                    stream.as_raw_fd(),
                    &mut iovs,
                    Some(&mut cmsg_space),
                    MsgFlags::empty(),
                )
                .expect("recvmsg");
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().expect("control messages") {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                (msg.bytes, fds)
            };
            // Adopt the descriptors so they close with this thread.
            let owned: Vec<OwnedFd> =
                fds.iter().map(|&fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();
            stream.write_all(&[ACCEPTED]).expect("ack");
            (bytes, buf, owned.len())
        });

        let planes = [plane(), plane()];
        // Generous budget; the default one is exercised by the timeout test.
        offer_descriptors_at(&path, 0x1234, &planes, Duration::from_secs(5))
            .expect("offer must succeed");

        let (bytes, buf, fd_count) = server.join().expect("server thread");
        assert_eq!(bytes, 5);
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), 0x1234);
        assert_eq!(buf[4], 2);
        assert_eq!(fd_count, 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unanswered_offer_times_out() {
        let path = socket_path();
        // Bound but never accepted: the connection sits in the backlog and
        // the acknowledgement never arrives.
        let _listener = UnixListener::bind(&path).expect("bind listener");

        let planes = [plane()];
        let result = offer_descriptors_at(&path, 7, &planes, Duration::from_millis(50));
        assert!(matches!(result, Err(OfferError::Timeout)), "got {result:?}");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn non_zero_status_is_refusal() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).expect("bind listener");

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept offer");
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).expect("payload");
            stream.write_all(&[9]).expect("refusal");
        });

        let planes = [plane()];
        let result = offer_descriptors_at(&path, 7, &planes, Duration::from_secs(5));
        assert!(matches!(result, Err(OfferError::Refused { status: 9 })), "got {result:?}");

        server.join().expect("server thread");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_socket_is_unreachable() {
        let planes = [plane()];
        let result = offer_descriptors_at(
            &socket_path(),
            7,
            &planes,
            OFFER_TIMEOUT,
        );
        assert!(matches!(result, Err(OfferError::Unreachable(_))), "got {result:?}");
    }

    #[test]
    fn oversized_offer_is_rejected_locally() {
        let planes: Vec<_> = (0..MAX_DESCRIPTORS + 1).map(|_| plane()).collect();
        let result = offer_descriptors_at(&socket_path(), 7, &planes, OFFER_TIMEOUT);
        assert!(
            matches!(result, Err(OfferError::TooManyDescriptors { count }) if count == MAX_DESCRIPTORS + 1),
            "got {result:?}"
        );
    }

    #[test]
    fn endpoint_resolution_falls_back() {
        // Only exercises the fallback arms; the env-var arms depend on the
        // ambient environment and are covered implicitly everywhere else.
        assert!(descriptor_endpoint().ends_with("descriptors"));
        assert!(rpc_endpoint().ends_with("comrpc"));
    }
}
