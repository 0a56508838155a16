//! Descriptor lifecycle service
//!
//! Every raw OS socket is wrapped in an [`FdHandle`] allocated by the
//! [`FdManager`]. The handle carries a monotonically assigned identifier
//! (used in diagnostic messages) and the transport attached to the
//! descriptor, which is either a plain TCP stream or a TLS session. The
//! socket engine never closes a raw descriptor directly; teardown always
//! goes through [`FdManager::shutdown`] or [`FdManager::close`], both of
//! which are idempotent.

use super::{Result, SocketError};
use openssl::ssl::SslStream;
use socket2::{Socket, TcpKeepalive};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Readiness events for [`poll_fd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// The transport attached to a descriptor: raw TCP or a TLS session.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
}

impl Transport {
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Plain(stream) => stream.as_raw_fd(),
            Transport::Tls(stream) => stream.get_ref().as_raw_fd(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Buffered plaintext already decrypted by the TLS layer
    pub fn tls_pending(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(stream) => stream.ssl().pending() > 0,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn shutdown_abortive(&mut self) {
        let _ = match self {
            Transport::Plain(stream) => stream.shutdown(Shutdown::Both),
            Transport::Tls(stream) => stream.get_ref().shutdown(Shutdown::Both),
        };
    }

    fn shutdown_graceful(&mut self) {
        if let Transport::Tls(stream) = self {
            let _ = stream.shutdown();
        }
        self.shutdown_abortive();
    }
}

/// A tracked socket descriptor.
///
/// The transport is taken out exactly once on teardown; every accessor
/// afterwards reports [`SocketError::Closed`].
pub struct FdHandle {
    id: u64,
    transport: Mutex<Option<Transport>>,
}

impl FdHandle {
    fn new(id: u64, transport: Option<Transport>) -> Self {
        FdHandle {
            id,
            transport: Mutex::new(transport),
        }
    }

    /// Identifier used in diagnostic messages
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True while the descriptor has not been shut down
    pub fn valid(&self) -> bool {
        self.transport.lock().unwrap().is_some()
    }

    /// Raw descriptor, if still valid
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.lock().unwrap().as_ref().map(|t| t.as_raw_fd())
    }

    /// True if a TLS session is attached and has buffered plaintext pending
    pub fn tls_pending(&self) -> bool {
        self.transport
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.tls_pending())
            .unwrap_or(false)
    }

    /// Runs `f` against the live transport.
    ///
    /// The transport lock is held only for the duration of the call, which
    /// must be non-blocking; readiness waits happen outside of it so that a
    /// read and a write on the same connection can make progress
    /// concurrently.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut Transport) -> R) -> Result<R> {
        let mut guard = self.transport.lock().unwrap();
        match guard.as_mut() {
            Some(transport) => Ok(f(transport)),
            None => Err(SocketError::Closed(format!(
                "descriptor {} is no longer valid",
                self.id
            ))),
        }
    }

    /// Non-blocking liveness peek (`MSG_PEEK | MSG_DONTWAIT`).
    ///
    /// An orderly shutdown by the peer (zero-byte peek) counts as
    /// disconnected.
    pub fn peer_alive(&self) -> bool {
        let guard = self.transport.lock().unwrap();
        let fd = match guard.as_ref() {
            Some(transport) => transport.as_raw_fd(),
            None => return false,
        };
        let mut buf = [0u8; 1];
        let result = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if result == 0 {
            return false;
        }
        if result < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EINTR;
        }
        true
    }

    fn take_transport(&self) -> Option<Transport> {
        self.transport.lock().unwrap().take()
    }
}

/// Allocates and tears down descriptor handles.
pub struct FdManager {
    next_id: AtomicU64,
    set_lock: Mutex<()>,
}

impl FdManager {
    pub fn new() -> Self {
        FdManager {
            next_id: AtomicU64::new(1),
            set_lock: Mutex::new(()),
        }
    }

    /// Wraps a transport in a new tracked handle
    pub fn add(&self, transport: Transport) -> std::sync::Arc<FdHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        std::sync::Arc::new(FdHandle::new(id, Some(transport)))
    }

    /// A placeholder handle with no descriptor attached
    pub fn invalid(&self) -> std::sync::Arc<FdHandle> {
        std::sync::Arc::new(FdHandle::new(0, None))
    }

    /// Abortive teardown: TCP shutdown without TLS close-notify. Idempotent.
    /// Serialized against readiness-set construction so a descriptor cannot
    /// be invalidated (and its number reused) while a poll set is built.
    pub fn shutdown(&self, handle: &FdHandle) {
        let _set = self.set_lock.lock().unwrap();
        if let Some(mut transport) = handle.take_transport() {
            transport.shutdown_abortive();
            tracing::debug!(id = handle.id, "descriptor shut down");
        }
    }

    /// Graceful teardown: sends TLS close-notify first when a session is
    /// attached. Idempotent and serialized like [`FdManager::shutdown`].
    pub fn close(&self, handle: &FdHandle) {
        let _set = self.set_lock.lock().unwrap();
        if let Some(mut transport) = handle.take_transport() {
            transport.shutdown_graceful();
            tracing::debug!(id = handle.id, "descriptor closed");
        }
    }

    /// Lock protecting the live descriptor set while a readiness set is
    /// built; teardown acquires the same lock. Must never be held across a
    /// blocking wait.
    pub fn set_guard(&self) -> MutexGuard<'_, ()> {
        self.set_lock.lock().unwrap()
    }
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Socket-option ceremony applied to every newly created client descriptor:
/// keep-alive tuning and non-blocking mode. Kept separate from the
/// connection logic so it can be substituted per target platform.
pub(crate) fn configure_stream(socket: &Socket) -> io::Result<()> {
    socket.set_keepalive(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(15))
        .with_retries(4);
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_nonblocking(true)?;
    Ok(())
}

/// Bounded readiness wait on a single descriptor.
///
/// Returns `Ok(true)` when the descriptor is ready, `Ok(false)` on timeout.
/// Interrupted waits are retried with the remaining time.
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Duration) -> io::Result<bool> {
    use libc::{pollfd, POLLERR, POLLIN, POLLOUT};

    let deadline = std::time::Instant::now() + timeout;
    loop {
        let mut pfd = pollfd {
            fd,
            events: match events {
                PollEvents::Read => POLLIN,
                PollEvents::Write => POLLOUT,
                PollEvents::Both => POLLIN | POLLOUT,
            },
            revents: 0,
        };

        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;

        let result = unsafe { libc::poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            return Ok(false);
        }
        if pfd.revents & POLLERR != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "poll reported a descriptor error",
            ));
        }
        return Ok(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_handle_ids_are_monotonic() {
        let manager = FdManager::new();
        let (a, b) = stream_pair();
        let h1 = manager.add(Transport::Plain(a));
        let h2 = manager.add(Transport::Plain(b));
        assert!(h2.id() > h1.id());
    }

    #[test]
    fn test_close_is_idempotent() {
        let manager = FdManager::new();
        let (client, _server) = stream_pair();
        let handle = manager.add(Transport::Plain(client));

        assert!(handle.valid());
        manager.close(&handle);
        assert!(!handle.valid());
        assert!(handle.raw_fd().is_none());

        // Second close must be a no-op
        manager.close(&handle);
        manager.shutdown(&handle);
        assert!(!handle.valid());
    }

    #[test]
    fn test_with_transport_after_close() {
        let manager = FdManager::new();
        let (client, _server) = stream_pair();
        let handle = manager.add(Transport::Plain(client));
        manager.shutdown(&handle);

        let result = handle.with_transport(|_| ());
        assert!(matches!(result, Err(SocketError::Closed(_))));
    }

    #[test]
    fn test_invalid_handle() {
        let manager = FdManager::new();
        let handle = manager.invalid();
        assert!(!handle.valid());
        assert!(!handle.peer_alive());
    }

    #[test]
    fn test_peer_alive_detects_orderly_shutdown() {
        let manager = FdManager::new();
        let (client, server) = stream_pair();
        let handle = manager.add(Transport::Plain(client));

        assert!(handle.peer_alive());

        drop(server);
        // Wait for the FIN to arrive
        let fd = handle.raw_fd().unwrap();
        poll_fd(fd, PollEvents::Read, Duration::from_secs(2)).unwrap();
        assert!(!handle.peer_alive());
    }

    #[test]
    fn test_teardown_waits_for_set_guard() {
        use std::sync::Arc;

        let manager = Arc::new(FdManager::new());
        let (client, _server) = stream_pair();
        let handle = manager.add(Transport::Plain(client));

        let guard = manager.set_guard();
        let closer = {
            let manager = Arc::clone(&manager);
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || manager.close(&handle))
        };

        // The close must not invalidate the handle while the set is locked.
        std::thread::sleep(Duration::from_millis(100));
        assert!(handle.valid());

        drop(guard);
        closer.join().unwrap();
        assert!(!handle.valid());
    }

    #[test]
    fn test_poll_fd_timeout() {
        let (client, _server) = stream_pair();
        let ready = poll_fd(
            client.as_raw_fd(),
            PollEvents::Read,
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(!ready);
    }
}
