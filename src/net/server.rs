//! Multi-threaded listening server
//!
//! [`TcpServer`] binds one listening socket and services accepted peers on
//! a configurable number of worker threads. Every worker polls the shared
//! listener together with the peers it has accepted; whichever worker wakes
//! first wins the non-blocking accept race. Inbound data, new peers and
//! closed peers are reported through callbacks registered on the builder.
//!
//! Worker wakeups are bounded by the select interval, so a stop request is
//! observed within one interval. Dead peers are swept from the registries
//! when the sweep interval elapses or the registry reaches the connection
//! limit.

use super::connection::TcpConnection;
use super::fd::{configure_stream, FdHandle, FdManager, Transport};
use super::tls::{CertificateBundle, PemSource, TlsContext, TlsRole, TlsSetup};
use super::{Result, SocketError, DEFAULT_TIMEOUT, LISTEN_BACKLOG};
use bytes::Bytes;
use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Identifier assigned to an accepted peer; positive and unique among the
/// currently connected peers.
pub type ConnectionId = i32;

type NewConnectionCallback = Box<dyn Fn(ConnectionId, &str, u16) + Send + Sync>;
type ConnectionClosedCallback = Box<dyn Fn(ConnectionId) + Send + Sync>;
type PacketReceivedCallback = Box<dyn Fn(ConnectionId, Bytes) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    new_connection: Option<NewConnectionCallback>,
    connection_closed: Option<ConnectionClosedCallback>,
    packet_received: Option<PacketReceivedCallback>,
}

/// Builder for a [`TcpServer`].
pub struct TcpServerBuilder {
    use_tls: bool,
    max_connections: usize,
    worker_threads: usize,
    dh_params: Option<PemSource>,
    require_client_cert: bool,
    bundles: Vec<(String, CertificateBundle)>,
    select_interval: Duration,
    sweep_interval: Duration,
    callbacks: Callbacks,
}

impl TcpServerBuilder {
    fn new() -> Self {
        TcpServerBuilder {
            use_tls: false,
            max_connections: 100,
            worker_threads: 1,
            dh_params: None,
            require_client_cert: false,
            bundles: Vec::new(),
            select_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(60),
            callbacks: Callbacks::default(),
        }
    }

    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    pub fn dh_params(mut self, source: PemSource) -> Self {
        self.dh_params = Some(source);
        self
    }

    pub fn require_client_cert(mut self, require: bool) -> Self {
        self.require_client_cert = require;
        self
    }

    /// Registers a certificate bundle for one hostname pattern. The first
    /// registered bundle is the fallback when a client sends no server name
    /// or an unknown one.
    pub fn certificate_bundle(mut self, pattern: impl Into<String>, bundle: CertificateBundle) -> Self {
        self.bundles.push((pattern.into(), bundle));
        self
    }

    /// Upper bound on how long a worker sleeps in one readiness wait
    pub fn select_interval(mut self, interval: Duration) -> Self {
        self.select_interval = interval;
        self
    }

    /// How often dead peers are swept from the registries
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn on_new_connection<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionId, &str, u16) + Send + Sync + 'static,
    {
        self.callbacks.new_connection = Some(Box::new(callback));
        self
    }

    pub fn on_connection_closed<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        self.callbacks.connection_closed = Some(Box::new(callback));
        self
    }

    pub fn on_packet_received<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionId, Bytes) + Send + Sync + 'static,
    {
        self.callbacks.packet_received = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> TcpServer {
        TcpServer {
            shared: Arc::new(ServerShared {
                fd_manager: Arc::new(FdManager::new()),
                stop: AtomicBool::new(false),
                listener: Mutex::new(None),
                listen_info: Mutex::new(None),
                clients: Mutex::new(ClientRegistry {
                    next_id: 1,
                    map: HashMap::new(),
                }),
                tls: Mutex::new(None),
                callbacks: self.callbacks,
                last_sweep: Mutex::new(Instant::now()),
                use_tls: self.use_tls,
                max_connections: self.max_connections,
                dh_params: self.dh_params,
                require_client_cert: self.require_client_cert,
                bundles: self.bundles,
                select_interval: self.select_interval,
                sweep_interval: self.sweep_interval,
            }),
            worker_threads: self.worker_threads,
            workers: Mutex::new(Vec::new()),
        }
    }
}

struct ClientRecord {
    id: ConnectionId,
    descriptor: Arc<FdHandle>,
    connection: TcpConnection,
    address: String,
    port: u16,
    closed_signaled: AtomicBool,
}

struct ClientRegistry {
    next_id: ConnectionId,
    map: HashMap<ConnectionId, Arc<ClientRecord>>,
}

struct ServerShared {
    fd_manager: Arc<FdManager>,
    stop: AtomicBool,
    listener: Mutex<Option<Socket>>,
    listen_info: Mutex<Option<(String, u16)>>,
    clients: Mutex<ClientRegistry>,
    tls: Mutex<Option<TlsContext>>,
    callbacks: Callbacks,
    last_sweep: Mutex<Instant>,
    use_tls: bool,
    max_connections: usize,
    dh_params: Option<PemSource>,
    require_client_cert: bool,
    bundles: Vec<(String, CertificateBundle)>,
    select_interval: Duration,
    sweep_interval: Duration,
}

/// Listening server that delivers peer events through callbacks.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    worker_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn builder() -> TcpServerBuilder {
        TcpServerBuilder::new()
    }

    /// Binds `address:port` and starts the worker threads. A server that is
    /// already running is stopped first. Credentials are rebuilt on every
    /// start, so certificate changes take effect on restart.
    pub fn start(&self, address: &str, port: u16) -> Result<()> {
        self.wait_until_stopped();
        self.shared.stop.store(false, Ordering::Release);

        if self.shared.use_tls {
            let mut tls = self.shared.tls.lock().unwrap();
            // Drop the previous credential set before building the new one.
            *tls = None;
            *tls = Some(TlsContext::new(TlsSetup {
                role: TlsRole::Server,
                bundles: self.shared.bundles.clone(),
                dh_params: self.shared.dh_params.clone(),
                require_client_cert: self.shared.require_client_cert,
                verify_certificate: false,
                verify_hostname: false,
            })?);
        }

        let (listener, bound) = bind_socket(address, port)?;
        let listen_address = if bound.ip().is_unspecified() {
            detect_local_address(&bound)
        } else {
            bound.ip().to_string()
        };
        tracing::info!(address = %listen_address, port = bound.port(), "server listening");

        *self.shared.listener.lock().unwrap() = Some(listener);
        *self.shared.listen_info.lock().unwrap() = Some((listen_address, bound.port()));
        *self.shared.last_sweep.lock().unwrap() = Instant::now();

        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.worker_threads {
            let shared = Arc::clone(&self.shared);
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }
        Ok(())
    }

    /// Starts on an ephemeral port and reports the bound address and port.
    pub fn start_dynamic_port(&self, address: &str) -> Result<(String, u16)> {
        self.start(address, 0)?;
        let info = self.shared.listen_info.lock().unwrap();
        let (address, port) = info.as_ref().cloned().unwrap_or_default();
        Ok((address, port))
    }

    /// Address the server reports itself as listening on
    pub fn listen_address(&self) -> Option<String> {
        self.shared
            .listen_info
            .lock()
            .unwrap()
            .as_ref()
            .map(|(address, _)| address.clone())
    }

    /// Port the listener is bound to
    pub fn bound_port(&self) -> Option<u16> {
        self.shared
            .listen_info
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, port)| *port)
    }

    /// Requests the workers to stop; returns without waiting.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Stops the workers and waits for them to exit, then closes all peer
    /// connections and the listener.
    pub fn wait_until_stopped(&self) {
        self.stop();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }

        let records: Vec<_> = {
            let mut registry = self.shared.clients.lock().unwrap();
            registry.map.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            self.shared.fd_manager.close(&record.descriptor);
            self.shared.signal_closed(&record);
        }

        *self.shared.listener.lock().unwrap() = None;
        *self.shared.tls.lock().unwrap() = None;
    }

    /// Number of currently registered peers
    pub fn connection_count(&self) -> usize {
        self.shared.clients.lock().unwrap().map.len()
    }

    /// Writes `data` to the peer with the given identifier. Unknown
    /// identifiers are ignored. The connection is closed after the write
    /// when `close_after` is set or the write fails.
    pub fn send_to_peer(&self, id: ConnectionId, data: &[u8], close_after: bool) -> Result<()> {
        let record = {
            let registry = self.shared.clients.lock().unwrap();
            match registry.map.get(&id) {
                Some(record) => Arc::clone(record),
                None => return Ok(()),
            }
        };
        let result = record.connection.write(data).map(|_| ());
        if close_after || result.is_err() {
            self.shared.close_client(&record);
        }
        result
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.wait_until_stopped();
    }
}

impl ServerShared {
    /// Closes a peer and fires the closed callback exactly once.
    fn close_client(&self, record: &ClientRecord) {
        self.fd_manager.close(&record.descriptor);
        self.clients.lock().unwrap().map.remove(&record.id);
        self.signal_closed(record);
    }

    fn signal_closed(&self, record: &ClientRecord) {
        let first = record
            .closed_signaled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            tracing::debug!(id = record.id, address = %record.address, "peer disconnected");
            if let Some(callback) = &self.callbacks.connection_closed {
                callback(record.id);
            }
        }
    }

    /// Sweeps dead peers when the sweep interval elapsed or the registry is
    /// at the connection limit.
    fn maybe_sweep(&self, local: &mut HashMap<ConnectionId, Arc<ClientRecord>>) {
        let due = {
            let last_sweep = self.last_sweep.lock().unwrap();
            last_sweep.elapsed() >= self.sweep_interval
                || self.clients.lock().unwrap().map.len() >= self.max_connections
        };
        if !due {
            return;
        }
        *self.last_sweep.lock().unwrap() = Instant::now();
        self.clients
            .lock()
            .unwrap()
            .map
            .retain(|_, record| record.descriptor.valid());
        local.retain(|_, record| record.descriptor.valid());
    }

    /// Accepts one pending peer; called by the worker that won the
    /// readiness race. Further queued peers trigger another wakeup.
    fn accept_one(&self) -> Option<Arc<ClientRecord>> {
        let (socket, peer) = {
            let guard = self.listener.lock().unwrap();
            let listener = guard.as_ref()?;
            match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return None,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return None;
                }
            }
        };

        let (address, port) = match peer.as_socket() {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => ("unknown".to_string(), 0),
        };

        if let Err(e) = configure_stream(&socket) {
            tracing::warn!(address = %address, error = %e, "could not configure peer socket");
            return None;
        }

        // At the limit, dead peers are swept once; a peer arriving while the
        // registry is still full is dropped.
        if self.clients.lock().unwrap().map.len() >= self.max_connections {
            self.clients
                .lock()
                .unwrap()
                .map
                .retain(|_, record| record.descriptor.valid());
            if self.clients.lock().unwrap().map.len() >= self.max_connections {
                tracing::warn!(address = %address, "connection limit reached, rejecting peer");
                return None;
            }
        }
        if self.stop.load(Ordering::Acquire) {
            return None;
        }

        let tls = self.tls.lock().unwrap().clone();
        let transport = match tls {
            Some(context) => match context.accept(socket.into(), DEFAULT_TIMEOUT) {
                Ok(stream) => Transport::Tls(Box::new(stream)),
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "TLS handshake with peer failed");
                    return None;
                }
            },
            None => Transport::Plain(socket.into()),
        };

        let descriptor = self.fd_manager.add(transport);
        let connection = TcpConnection::from_descriptor(
            Arc::clone(&self.fd_manager),
            Arc::clone(&descriptor),
            Duration::from_millis(100),
            Duration::from_secs(15),
        );

        let record = {
            let mut registry = self.clients.lock().unwrap();
            let mut id = registry.next_id;
            loop {
                if id <= 0 {
                    id = 1;
                }
                if !registry.map.contains_key(&id) {
                    break;
                }
                id = id.wrapping_add(1);
            }
            registry.next_id = id.wrapping_add(1);
            let record = Arc::new(ClientRecord {
                id,
                descriptor,
                connection,
                address,
                port,
                closed_signaled: AtomicBool::new(false),
            });
            registry.map.insert(id, Arc::clone(&record));
            record
        };

        tracing::debug!(id = record.id, address = %record.address, port = record.port, "peer connected");
        if let Some(callback) = &self.callbacks.new_connection {
            callback(record.id, &record.address, record.port);
        }
        Some(record)
    }

    /// Reads everything available from one peer and delivers it through the
    /// packet callback. Returns false when the peer was closed.
    fn service_client(&self, record: &Arc<ClientRecord>, buffer: &mut [u8]) -> bool {
        loop {
            match record.connection.read_with_pending(buffer) {
                Ok((bytes_read, more)) => {
                    if let Some(callback) = &self.callbacks.packet_received {
                        callback(record.id, Bytes::copy_from_slice(&buffer[..bytes_read]));
                    }
                    if !more {
                        return true;
                    }
                }
                // A spurious wakeup; the peer stays registered.
                Err(SocketError::Timeout { .. }) => return true,
                Err(_) => {
                    self.close_client(record);
                    return false;
                }
            }
        }
    }
}

fn worker_loop(shared: Arc<ServerShared>) {
    let mut local: HashMap<ConnectionId, Arc<ClientRecord>> = HashMap::new();
    let mut buffer = vec![0u8; 4096];

    while !shared.stop.load(Ordering::Acquire) {
        let listener_fd = match shared.listener.lock().unwrap().as_ref() {
            Some(listener) => listener.as_raw_fd(),
            None => break,
        };

        local.retain(|_, record| record.descriptor.valid());

        let mut pollfds = Vec::with_capacity(local.len() + 1);
        pollfds.push(libc::pollfd {
            fd: listener_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        let mut ids = Vec::with_capacity(local.len());
        {
            // Descriptors must not be invalidated while the readiness set is
            // built.
            let _guard = shared.fd_manager.set_guard();
            for (id, record) in &local {
                if let Some(fd) = record.descriptor.raw_fd() {
                    pollfds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    ids.push(*id);
                }
            }
        }

        let timeout_ms = shared.select_interval.as_millis().min(i32::MAX as u128) as libc::c_int;
        let result = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "worker poll failed");
            std::thread::sleep(shared.select_interval);
            continue;
        }
        if result == 0 {
            shared.maybe_sweep(&mut local);
            continue;
        }

        if pollfds[0].revents & libc::POLLIN != 0 && !shared.stop.load(Ordering::Acquire) {
            if let Some(record) = shared.accept_one() {
                local.insert(record.id, record);
            }
            continue;
        }

        for (index, id) in ids.iter().enumerate() {
            let revents = pollfds[index + 1].revents;
            if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                continue;
            }
            let record = match local.get(id) {
                Some(record) => Arc::clone(record),
                None => continue,
            };
            if !shared.service_client(&record, &mut buffer) {
                local.remove(id);
            }
        }

        shared.maybe_sweep(&mut local);
    }
}

/// Binds a non-blocking listening socket, trying every resolved address of
/// the requested family. An empty address binds the IPv6 wildcard (which
/// also accepts IPv4 peers on dual-stack hosts).
fn bind_socket(address: &str, port: u16) -> Result<(Socket, SocketAddr)> {
    let address = if address.is_empty() { "::" } else { address };
    let candidates: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .map_err(|e| {
            SocketError::InvalidParameters(format!(
                "could not get address information for \"{}\": {}",
                address, e
            ))
        })?
        .collect();
    if candidates.is_empty() {
        return Err(SocketError::InvalidParameters(format!(
            "could not resolve listen address \"{}\"",
            address
        )));
    }

    let mut last_error = None;
    for addr in candidates {
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, None) {
            Ok(socket) => socket,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };
        let prepared = socket
            .set_reuse_address(true)
            .and_then(|_| socket.set_nonblocking(true))
            .and_then(|_| socket.bind(&SockAddr::from(addr)))
            .and_then(|_| socket.listen(LISTEN_BACKLOG));
        match prepared {
            Ok(()) => {
                let bound = socket
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_socket())
                    .unwrap_or(addr);
                return Ok((socket, bound));
            }
            Err(e) => last_error = Some(e),
        }
    }

    let error = last_error.expect("at least one bind attempt was made");
    if error.kind() == io::ErrorKind::AddrInUse {
        Err(SocketError::AddressInUse(format!(
            "could not bind to port {}: {}",
            port, error
        )))
    } else {
        Err(SocketError::Bind(format!(
            "could not bind to \"{}\" on port {}: {}",
            address, port, error
        )))
    }
}

/// Best-effort detection of the host's outward-facing address when bound to
/// a wildcard. Uses the local address of a connected (never written to) UDP
/// socket; falls back to the wildcard address itself.
fn detect_local_address(bound: &SocketAddr) -> String {
    let probe = if bound.is_ipv6() {
        UdpSocket::bind("[::]:0").and_then(|socket| {
            socket.connect("[2001:4860:4860::8888]:53")?;
            socket.local_addr()
        })
    } else {
        UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
            socket.connect("8.8.8.8:53")?;
            socket.local_addr()
        })
    };
    match probe {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => bound.ip().to_string(),
    }
}
