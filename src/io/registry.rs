//! Connection registry - one persistent outbound TCP session per device `host:port`
//!
//! Each `connect(host, port)` starts a supervisor task on the registry's own I/O
//! runtime. The supervisor dials, registers the session, hands frames to the installed
//! `ConnectionHandler`, and after any close or failed dial waits a fixed delay and
//! dials again. There is no attempt cap and no backoff growth.
//!
//! One supervisor per device: a second `connect` for a supervised `host:port` is a
//! no-op, so dial failures and close detection can never start two competing reconnect
//! loops. Devices sharing an IP on different ports each get their own supervisor.
//!
//! `send` is keyed by host only. The session table holds the most recently registered
//! session per host; an older session of the same host keeps running but is no longer
//! addressable by `send`.

use crate::domain::facility::{FacilityInfo, FacilityResolver, FacilityTable};
use crate::infra::config::{Config, FramingMode};
use crate::infra::metrics::Metrics;
use crate::io::framing::{Decoded, FrameDecoder};
use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

#[cold]
fn log_connect_failed(host: &str, port: u16, e: &io::Error) {
    error!(host = %host, port = port, error = %e, "device_connect_failed");
}

#[cold]
fn log_write_error(host: &str, e: &io::Error) {
    error!(host = %host, error = %e, "device_write_error");
}

#[cold]
fn log_write_timeout(host: &str) {
    error!(host = %host, "device_write_timeout");
}

/// Identity of one live session, passed to every handler callback
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Unique per session; a reconnect gets a new id
    pub session_id: u64,
    /// Host the session was opened for (the `send` key)
    pub host: String,
    /// Configured device port
    pub port: u16,
    /// Peer address as reported by the socket (`ip:port`)
    pub remote_addr: SocketAddr,
}

/// Transport lifecycle callbacks. All calls for one session come from one task, in order.
pub trait ConnectionHandler: Send + Sync {
    fn on_connected(&self, conn: &ConnectionContext);
    fn on_disconnected(&self, conn: &ConnectionContext);
    fn on_frame(&self, conn: &ConnectionContext, frame: &[u8]);
    fn on_error(&self, conn: &ConnectionContext, cause: &io::Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
    pub outbound_queue: usize,
    pub framing: FramingMode,
    pub delimiter: u8,
    pub max_frame_len: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(3),
            outbound_queue: 64,
            framing: FramingMode::Delimited,
            delimiter: b'\n',
            max_frame_len: 64 * 1024,
        }
    }
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        let devices = config.devices();
        Self {
            reconnect_delay: config.reconnect_delay(),
            dial_timeout: Duration::from_millis(devices.dial_timeout_ms),
            write_timeout: Duration::from_millis(devices.write_timeout_ms),
            outbound_queue: devices.outbound_queue,
            framing: devices.framing,
            delimiter: devices.delimiter,
            max_frame_len: devices.max_frame_len,
        }
    }
}

struct SessionHandle {
    id: u64,
    port: u16,
    outbound: mpsc::Sender<Bytes>,
}

/// Supervised device, keyed by `host:port`
struct DeviceConnection {
    state: ConnectionState,
}

fn device_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Facility lookup handed to the connection handler, served by the registry itself
struct RegistryLookup(Weak<ConnectionRegistry>);

impl FacilityResolver for RegistryLookup {
    fn resolve(&self, remote_addr: &SocketAddr) -> Option<FacilityInfo> {
        self.0.upgrade().and_then(|registry| registry.find_facility(remote_addr))
    }
}

pub struct ConnectionRegistry {
    config: RegistryConfig,
    facilities: Arc<FacilityTable>,
    handler: Arc<dyn ConnectionHandler>,
    metrics: Arc<Metrics>,
    /// `host:port` -> supervised device
    devices: RwLock<FxHashMap<String, DeviceConnection>>,
    /// host -> most recently registered session
    sessions: RwLock<FxHashMap<String, SessionHandle>>,
    runtime: OnceLock<Runtime>,
    next_session_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        facilities: Arc<FacilityTable>,
        handler: Arc<dyn ConnectionHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            facilities,
            handler,
            metrics,
            devices: RwLock::new(FxHashMap::default()),
            sessions: RwLock::new(FxHashMap::default()),
            runtime: OnceLock::new(),
            next_session_id: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Build a registry whose handler resolves facilities through the registry.
    ///
    /// `make_handler` receives the lookup and returns the handler to install. The
    /// lookup holds a weak reference, so the registry and its handler do not keep
    /// each other alive.
    pub fn with_handler<F>(
        config: RegistryConfig,
        facilities: Arc<FacilityTable>,
        metrics: Arc<Metrics>,
        make_handler: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Arc<dyn FacilityResolver>) -> Arc<dyn ConnectionHandler>,
    {
        Arc::new_cyclic(|weak| {
            let lookup: Arc<dyn FacilityResolver> = Arc::new(RegistryLookup(weak.clone()));
            Self::new(config, facilities, make_handler(lookup), metrics)
        })
    }

    /// Size the device I/O worker pool. Only the first call has an effect.
    ///
    /// Returns `Ok(true)` if this call created the pool.
    pub fn configure(&self, device_count: usize) -> io::Result<bool> {
        if self.runtime.get().is_some() {
            debug!(requested = device_count, "registry_already_configured");
            return Ok(false);
        }

        let workers = device_count.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("device-io")
            .enable_all()
            .build()?;

        match self.runtime.set(runtime) {
            Ok(()) => {
                info!(workers = workers, "registry_configured");
                Ok(true)
            }
            Err(lost_race) => {
                lost_race.shutdown_background();
                Ok(false)
            }
        }
    }

    fn io_handle(&self) -> io::Result<Handle> {
        if self.runtime.get().is_none() {
            self.configure(1)?;
        }
        self.runtime
            .get()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| io::Error::other("device io runtime unavailable"))
    }

    /// Open and supervise the session for `host:port`.
    ///
    /// Waits for the first handshake only: `Connected` if it succeeded, `Connecting`
    /// if it failed and the reconnect loop has taken over. Transport failures are never
    /// returned as errors; `Err` means the I/O pool could not be created.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> io::Result<ConnectionState> {
        let handle = self.io_handle()?;
        let key = device_key(host, port);

        {
            let mut devices = self.devices.write();
            if let Some(existing) = devices.get(&key) {
                debug!(device = %key, state = ?existing.state, "device_already_supervised");
                return Ok(existing.state);
            }
            devices.insert(key, DeviceConnection { state: ConnectionState::Connecting });
        }

        let (first_tx, first_rx) = oneshot::channel();
        let registry = Arc::clone(self);
        let host = host.to_string();
        handle.spawn(async move {
            registry.supervise(host, port, first_tx).await;
        });

        Ok(first_rx.await.unwrap_or(ConnectionState::Closed))
    }

    async fn supervise(
        self: Arc<Self>,
        host: String,
        port: u16,
        first: oneshot::Sender<ConnectionState>,
    ) {
        let mut first = Some(first);
        let key = device_key(&host, port);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u64 = 0;

        while !*shutdown.borrow() {
            if attempt > 0 {
                self.metrics.record_reconnect_attempt();
            }
            attempt += 1;
            self.set_state(&key, ConnectionState::Connecting);
            debug!(host = %host, port = port, attempt = attempt, "device_connecting");

            match self.dial(&host, port).await {
                Ok((stream, remote_addr)) => {
                    let (conn, outbound_rx) = self.register_session(&host, port, remote_addr);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(ConnectionState::Connected);
                    }
                    self.handler.on_connected(&conn);
                    self.run_session(stream, &conn, outbound_rx, &mut shutdown).await;
                    self.unregister_session(&conn);
                    self.handler.on_disconnected(&conn);
                }
                Err(e) => {
                    log_connect_failed(&host, port, &e);
                    self.metrics.record_connect_failure();
                    self.set_state(&key, ConnectionState::Closed);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(ConnectionState::Connecting);
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            info!(
                host = %host,
                port = port,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "device_reconnect_scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(&key, ConnectionState::Closed);
        info!(host = %host, port = port, "device_supervisor_stopped");
    }

    async fn dial(&self, host: &str, port: u16) -> io::Result<(TcpStream, SocketAddr)> {
        let stream = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timeout"))??;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        Ok((stream, remote_addr))
    }

    fn set_state(&self, key: &str, state: ConnectionState) {
        if let Some(entry) = self.devices.write().get_mut(key) {
            entry.state = state;
        }
    }

    /// Install a fresh session for `host`, replacing whatever was there
    fn register_session(
        &self,
        host: &str,
        port: u16,
        remote_addr: SocketAddr,
    ) -> (ConnectionContext, mpsc::Receiver<Bytes>) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));

        let replaced = self
            .sessions
            .write()
            .insert(host.to_string(), SessionHandle { id, port, outbound });
        if let Some(previous) = replaced {
            debug!(host = %host, port = port, replaced_port = previous.port, "device_send_target_replaced");
        }
        self.set_state(&device_key(host, port), ConnectionState::Connected);

        self.metrics.record_connected();
        info!(host = %host, remote = %remote_addr, session = id, "device_connected");
        (ConnectionContext { session_id: id, host: host.to_string(), port, remote_addr }, outbound_rx)
    }

    fn unregister_session(&self, conn: &ConnectionContext) {
        {
            let mut sessions = self.sessions.write();
            if sessions.get(&conn.host).is_some_and(|s| s.id == conn.session_id) {
                sessions.remove(&conn.host);
            }
        }
        self.set_state(&device_key(&conn.host, conn.port), ConnectionState::Closed);
        self.metrics.record_disconnected();
        info!(host = %conn.host, remote = %conn.remote_addr, session = conn.session_id, "device_disconnected");
    }

    async fn run_session(
        &self,
        stream: TcpStream,
        conn: &ConnectionContext,
        mut outbound_rx: mpsc::Receiver<Bytes>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let (read_half, write_half) = stream.into_split();

        tokio::select! {
            _ = self.read_loop(read_half, conn) => {}
            _ = Self::write_loop(write_half, &mut outbound_rx, self.config.write_timeout, &conn.host) => {
                warn!(host = %conn.host, "device_write_loop_exited");
            }
            _ = shutdown.changed() => {
                info!(host = %conn.host, "device_session_shutdown");
            }
        }
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf, conn: &ConnectionContext) {
        let mut decoder =
            FrameDecoder::new(self.config.framing, self.config.delimiter, self.config.max_frame_len);
        let mut buf = vec![0u8; 4096];

        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!(host = %conn.host, "device_connection_closed_by_peer");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    self.handler.on_error(conn, &e);
                    return;
                }
            };

            decoder.extend(&buf[..n]);
            while let Some(decoded) = decoder.next_frame() {
                match decoded {
                    Decoded::Frame(frame) => self.handler.on_frame(conn, &frame),
                    Decoded::Oversize(len) => {
                        self.metrics.record_oversize_frame();
                        warn!(host = %conn.host, len = len, "device_frame_oversize");
                    }
                }
            }
        }
    }

    async fn write_loop(
        mut write_half: OwnedWriteHalf,
        outbound_rx: &mut mpsc::Receiver<Bytes>,
        write_timeout: Duration,
        host: &str,
    ) {
        while let Some(msg) = outbound_rx.recv().await {
            match tokio::time::timeout(write_timeout, write_half.write_all(&msg)).await {
                Ok(Ok(())) => {
                    debug!(host = %host, len = msg.len(), "device_message_sent");
                }
                Ok(Err(e)) => {
                    log_write_error(host, &e);
                    return;
                }
                Err(_) => {
                    log_write_timeout(host);
                    return;
                }
            }
        }
    }

    /// Queue `message` for the active session of `host`.
    ///
    /// No session -> silent no-op, returns `false`. Delivery is not confirmed.
    pub fn send(&self, host: &str, message: &str) -> bool {
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(host) else {
            debug!(host = %host, "device_send_no_session");
            return false;
        };

        let queued = match session.outbound.try_send(Bytes::copy_from_slice(message.as_bytes())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(host = %host, "device_send_queue_full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        };
        self.metrics.record_send(queued);
        queued
    }

    /// State of the device supervised for `host:port`
    pub fn state(&self, host: &str, port: u16) -> Option<ConnectionState> {
        self.devices.read().get(&device_key(host, port)).map(|c| c.state)
    }

    /// Hosts `send` can currently reach
    pub fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.sessions.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Facility bound to a connection's remote address, `None` if unconfigured
    pub fn find_facility(&self, remote_addr: &SocketAddr) -> Option<FacilityInfo> {
        self.facilities.find_by_socket(remote_addr).cloned()
    }

    /// Stop every supervisor and close every session
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        info!("registry_shutdown");
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
