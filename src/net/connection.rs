//! Connection core
//!
//! [`TcpConnection`] represents one TCP endpoint: an outbound client built
//! through [`TcpConnection::builder`], or an accepted peer wrapped around
//! an existing descriptor. Read and write operations are guarded by
//! independent locks, block only inside bounded readiness waits, and retry
//! only on interrupted/would-block conditions.

use super::fd::{configure_stream, poll_fd, FdHandle, FdManager, PollEvents, Transport};
use super::tls::{CertificateBundle, PemSource, TlsContext, TlsRole, TlsSetup};
use super::{Result, SocketError, CONNECT_BACKOFF, DEFAULT_TIMEOUT, MAX_PAYLOAD_BYTES};
use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builder for an outbound [`TcpConnection`].
///
/// Supplying CA/certificate/key material here is equivalent to configuring
/// a single default (`*`) certificate bundle.
pub struct TcpConnectionBuilder {
    hostname: Option<String>,
    port: Option<u16>,
    use_tls: bool,
    verify_certificate: bool,
    verify_hostname: bool,
    ca: Option<PemSource>,
    cert: Option<PemSource>,
    key: Option<PemSource>,
    read_timeout: Duration,
    write_timeout: Duration,
    auto_connect: bool,
    connect_retries: u32,
}

impl TcpConnectionBuilder {
    fn new() -> Self {
        TcpConnectionBuilder {
            hostname: None,
            port: None,
            use_tls: false,
            verify_certificate: true,
            verify_hostname: true,
            ca: None,
            cert: None,
            key: None,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            auto_connect: true,
            connect_retries: 1,
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = verify;
        self
    }

    pub fn verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }

    pub fn ca(mut self, source: PemSource) -> Self {
        self.ca = Some(source);
        self
    }

    pub fn client_cert(mut self, cert: PemSource, key: PemSource) -> Self {
        self.cert = Some(cert);
        self.key = Some(key);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Connect attempts; clamped to 1..=10 at connect time
    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Builds the connection. TLS credential material is parsed here, so
    /// bad certificate data fails construction rather than the first I/O.
    pub fn build(self) -> Result<TcpConnection> {
        let tls = if self.use_tls {
            let mut bundles = Vec::new();
            let bundle = CertificateBundle {
                ca: self.ca,
                cert: self.cert,
                key: self.key,
            };
            if !bundle.is_empty() {
                bundles.push(("*".to_string(), bundle));
            }
            Some(TlsContext::new(TlsSetup {
                role: TlsRole::Client,
                bundles,
                dh_params: None,
                require_client_cert: false,
                verify_certificate: self.verify_certificate,
                verify_hostname: self.verify_hostname,
            })?)
        } else {
            None
        };

        let fd_manager = Arc::new(FdManager::new());
        let descriptor = fd_manager.invalid();
        let verification_hostname = self.hostname.clone().unwrap_or_default();
        Ok(TcpConnection {
            fd_manager,
            descriptor: Mutex::new(descriptor),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            connecting: AtomicBool::new(false),
            hostname: self.hostname.unwrap_or_default(),
            port: self.port,
            verification_hostname,
            ip_address: Mutex::new(String::new()),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            auto_connect: self.auto_connect,
            connect_retries: self.connect_retries,
            tls,
        })
    }
}

/// One TCP endpoint with timeout-governed, lock-protected I/O.
pub struct TcpConnection {
    fd_manager: Arc<FdManager>,
    descriptor: Mutex<Arc<FdHandle>>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    connecting: AtomicBool,
    hostname: String,
    port: Option<u16>,
    verification_hostname: String,
    ip_address: Mutex<String>,
    read_timeout: Duration,
    write_timeout: Duration,
    auto_connect: bool,
    connect_retries: u32,
    tls: Option<TlsContext>,
}

impl TcpConnection {
    pub fn builder() -> TcpConnectionBuilder {
        TcpConnectionBuilder::new()
    }

    /// Wraps an already-established descriptor (an accepted server peer).
    pub(crate) fn from_descriptor(
        fd_manager: Arc<FdManager>,
        descriptor: Arc<FdHandle>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        TcpConnection {
            fd_manager,
            descriptor: Mutex::new(descriptor),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            connecting: AtomicBool::new(false),
            hostname: String::new(),
            port: None,
            verification_hostname: String::new(),
            ip_address: Mutex::new(String::new()),
            read_timeout,
            write_timeout,
            auto_connect: false,
            connect_retries: 1,
            tls: None,
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn set_auto_connect(&mut self, auto_connect: bool) {
        self.auto_connect = auto_connect;
    }

    /// Changes the target hostname; closes any live connection first.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.close();
        self.hostname = hostname.into();
        self.verification_hostname = self.hostname.clone();
    }

    /// Changes the target port; closes any live connection first.
    pub fn set_port(&mut self, port: u16) {
        self.close();
        self.port = Some(port);
    }

    /// Hostname used for certificate subject verification; defaults to the
    /// target hostname.
    pub fn set_verification_hostname(&mut self, hostname: impl Into<String>) {
        self.verification_hostname = hostname.into();
    }

    /// IP address the last connect resolved to
    pub fn ip_address(&self) -> String {
        self.ip_address.lock().unwrap().clone()
    }

    /// Non-blocking liveness check. Returns false while a connect is in
    /// progress so a caller cannot observe a half-initialized socket as
    /// alive.
    pub fn connected(&self) -> bool {
        if self.connecting.load(Ordering::Acquire) {
            return false;
        }
        let descriptor = self.descriptor.lock().unwrap().clone();
        descriptor.peer_alive()
    }

    /// Establishes the connection, replacing any existing descriptor.
    pub fn connect(&self) -> Result<()> {
        self.connecting.store(true, Ordering::Release);
        let result = self.connect_locked();
        self.connecting.store(false, Ordering::Release);
        result
    }

    fn connect_locked(&self) -> Result<()> {
        let _read = self.read_lock.lock().unwrap();
        let _write = self.write_lock.lock().unwrap();

        let old = self.descriptor.lock().unwrap().clone();
        self.fd_manager.shutdown(&old);

        let stream = self.establish_tcp()?;
        let transport = match &self.tls {
            Some(tls) => {
                let verification = if self.verification_hostname.is_empty() {
                    &self.hostname
                } else {
                    &self.verification_hostname
                };
                let stream = tls.connect(&self.hostname, verification, stream, self.read_timeout)?;
                Transport::Tls(Box::new(stream))
            }
            None => Transport::Plain(stream),
        };

        let handle = self.fd_manager.add(transport);
        tracing::debug!(
            hostname = %self.hostname,
            id = handle.id(),
            tls = self.tls.is_some(),
            "connected"
        );
        *self.descriptor.lock().unwrap() = handle;
        Ok(())
    }

    /// Resolves the target and retries the TCP connect with a short backoff
    /// between attempts. A pending non-blocking connect counts as success
    /// only once a bounded poll confirms writability without error.
    fn establish_tcp(&self) -> Result<TcpStream> {
        if self.hostname.is_empty() {
            return Err(SocketError::InvalidParameters("hostname is empty".to_string()));
        }
        let port = self
            .port
            .ok_or_else(|| SocketError::InvalidParameters("port is not set".to_string()))?;

        let retries = self.connect_retries.clamp(1, 10);
        for attempt in 0..retries {
            let last_attempt = attempt + 1 == retries;
            let addr = (self.hostname.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| {
                    SocketError::Operation(format!("could not get address information: {}", e))
                })?
                .next()
                .ok_or_else(|| {
                    SocketError::Operation(format!(
                        "could not resolve host \"{}\"",
                        self.hostname
                    ))
                })?;
            *self.ip_address.lock().unwrap() = addr.ip().to_string();

            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
                .map_err(|e| SocketError::Operation(format!("could not create socket: {}", e)))?;
            configure_stream(&socket).map_err(|e| {
                SocketError::Operation(format!(
                    "could not set socket options for server {} on port {}: {}",
                    addr.ip(),
                    port,
                    e
                ))
            })?;

            let pending = match socket.connect(&SockAddr::from(addr)) {
                Ok(()) => false,
                Err(e)
                    if e.raw_os_error() == Some(libc::EINPROGRESS)
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    true
                }
                Err(e) => {
                    if last_attempt {
                        return Err(SocketError::wait_timeout(format!(
                            "connecting to server {} on port {} timed out: {}",
                            addr.ip(),
                            port,
                            e
                        )));
                    }
                    std::thread::sleep(CONNECT_BACKOFF);
                    continue;
                }
            };

            if pending {
                match poll_fd(socket.as_raw_fd(), PollEvents::Both, self.read_timeout) {
                    Ok(true) => {
                        let pending_error = match socket.take_error() {
                            Ok(None) => None,
                            Ok(Some(e)) => Some(e),
                            Err(e) => Some(e),
                        };
                        if let Some(e) = pending_error {
                            if last_attempt {
                                return Err(SocketError::Operation(format!(
                                    "could not connect to server {} on port {}: {}",
                                    addr.ip(),
                                    port,
                                    e
                                )));
                            }
                            std::thread::sleep(CONNECT_BACKOFF);
                            continue;
                        }
                    }
                    Ok(false) => {
                        if last_attempt {
                            return Err(SocketError::wait_timeout(format!(
                                "connecting to server {} on port {} timed out",
                                addr.ip(),
                                port
                            )));
                        }
                        continue;
                    }
                    Err(e) => {
                        if last_attempt {
                            return Err(SocketError::wait_timeout(format!(
                                "could not connect to server {} on port {}: {}",
                                addr.ip(),
                                port,
                                e
                            )));
                        }
                        std::thread::sleep(CONNECT_BACKOFF);
                        continue;
                    }
                }
            }

            return Ok(socket.into());
        }
        unreachable!("connect retry loop always returns")
    }

    fn reconnect_if_needed(&self) -> Result<()> {
        if self.auto_connect && !self.connected() {
            self.connect()?;
        }
        Ok(())
    }

    /// Reads into `buf`, discarding the more-data indication.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_with_pending(buf).map(|(n, _)| n)
    }

    /// Reads into `buf`. The second element reports whether the TLS layer
    /// still holds buffered plaintext, so the caller can read again without
    /// waiting on the network.
    pub fn read_with_pending(&self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut guard = self.read_lock.lock().unwrap();
        if self.auto_connect && !self.connected() {
            drop(guard);
            self.reconnect_if_needed()?;
            guard = self.read_lock.lock().unwrap();
        }
        let _guard = guard;

        let descriptor = self.descriptor.lock().unwrap().clone();

        // Drain plaintext the TLS layer already decrypted before waiting on
        // the network.
        if descriptor.tls_pending() {
            let n = self.read_once(&descriptor, buf)?;
            if n > 0 {
                let more = descriptor.tls_pending();
                return Ok((n.min(buf.len()), more));
            }
        }

        let fd = descriptor.raw_fd().ok_or_else(|| {
            SocketError::Closed(format!("connection to peer {} closed", descriptor.id()))
        })?;
        match poll_fd(fd, PollEvents::Read, self.read_timeout) {
            Ok(true) => {}
            Ok(false) => {
                return Err(SocketError::wait_timeout("reading from socket timed out"))
            }
            Err(e) => {
                return Err(SocketError::Closed(format!(
                    "connection to peer {} closed: {}",
                    descriptor.id(),
                    e
                )))
            }
        }

        match self.read_once(&descriptor, buf) {
            Ok(0) => Err(SocketError::Closed(format!(
                "connection to peer {} closed",
                descriptor.id()
            ))),
            Ok(n) => {
                let more = descriptor.tls_pending();
                Ok((n.min(buf.len()), more))
            }
            Err(e) => Err(e),
        }
    }

    /// One read call, retried only on interrupt/would-block.
    fn read_once(&self, descriptor: &FdHandle, buf: &mut [u8]) -> Result<usize> {
        loop {
            let result = descriptor.with_transport(|t| t.read(buf))?;
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let fd = descriptor.raw_fd().ok_or_else(|| {
                        SocketError::Closed(format!(
                            "connection to peer {} closed",
                            descriptor.id()
                        ))
                    })?;
                    match poll_fd(fd, PollEvents::Read, self.read_timeout) {
                        Ok(true) => continue,
                        Ok(false) => {
                            return Err(SocketError::wait_timeout(
                                "reading from socket timed out",
                            ))
                        }
                        Err(e) => {
                            return Err(SocketError::Closed(format!(
                                "connection to peer {} closed: {}",
                                descriptor.id(),
                                e
                            )))
                        }
                    }
                }
                Err(e) => return Err(map_read_error(descriptor.id(), e)),
            }
        }
    }

    /// Writes the whole payload, waiting for writability before each send
    /// attempt. Payloads above 100 MiB are rejected outright; any failure
    /// other than interrupt/would-block closes the connection.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut guard = self.write_lock.lock().unwrap();
        if self.auto_connect && !self.connected() {
            drop(guard);
            self.reconnect_if_needed()?;
            guard = self.write_lock.lock().unwrap();
        }

        if data.is_empty() {
            return Ok(0);
        }
        if data.len() > MAX_PAYLOAD_BYTES {
            return Err(SocketError::DataLimit(
                "data size is larger than 100 MiB".to_string(),
            ));
        }

        let descriptor = self.descriptor.lock().unwrap().clone();
        let mut written = 0;
        while written < data.len() {
            let fd = descriptor.raw_fd().ok_or_else(|| {
                SocketError::Closed(format!("connection to peer {} closed", descriptor.id()))
            })?;
            match poll_fd(fd, PollEvents::Write, self.write_timeout) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(SocketError::wait_timeout("writing to socket timed out"))
                }
                Err(e) => {
                    return Err(SocketError::Closed(format!(
                        "connection to peer {} closed: {}",
                        descriptor.id(),
                        e
                    )))
                }
            }

            let result = descriptor.with_transport(|t| t.write(&data[written..]))?;
            match result {
                Ok(n) if n > 0 => written += n,
                Ok(_) => {
                    drop(guard);
                    self.close();
                    return Err(SocketError::Operation(
                        "send returned zero bytes".to_string(),
                    ));
                }
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) => {
                    drop(guard);
                    self.close();
                    return Err(SocketError::Operation(e.to_string()));
                }
            }
        }
        Ok(written)
    }

    pub fn write_vec(&self, data: &Vec<u8>) -> Result<usize> {
        self.write(data.as_slice())
    }

    pub fn write_str(&self, data: &str) -> Result<usize> {
        self.write(data.as_bytes())
    }

    /// Releases the descriptor through the lifecycle service. Safe to call
    /// multiple times.
    pub fn close(&self) {
        let _read = self.read_lock.lock().unwrap();
        let _write = self.write_lock.lock().unwrap();
        let descriptor = self.descriptor.lock().unwrap().clone();
        self.fd_manager.close(&descriptor);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Maps a fatal read error: a timeout reported by the read call itself is a
/// distinct timeout kind, everything else means the connection is gone.
fn map_read_error(id: u64, e: io::Error) -> SocketError {
    if e.raw_os_error() == Some(libc::ETIMEDOUT) {
        SocketError::io_timeout("reading from socket timed out")
    } else {
        SocketError::Closed(format!("connection to peer {} closed: {}", id, e))
    }
}
