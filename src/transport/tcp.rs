//! TCP transport: framed stream server and client instance of the adapter
//! contract
//!
//! Server mode binds and accepts, mapping connections to connection-id
//! strings for directed sends and broadcast. Client mode connects out,
//! optionally pooling send connections. Both share the framing layer, the
//! subscription registry (so subscriptions survive reconnects), heartbeats,
//! and the adapter statistics.

use crate::config::TcpConfig;
use crate::domain_types::ConnectionId;
use crate::error::{ConfigError, PoolError, TransportError};
use crate::message::Envelope;
use crate::serializer::MessageSerializer;
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::framing::{FrameDecoder, encode_frame};
use super::pool::{ConnectionPool, PooledResource, ResourceFactory};
use super::{
    SubscriptionRegistry, Transport, TransportHandler, TransportState, TransportStats,
    TransportStatsSnapshot, TransportSubscription, connect_with_retry, maybe_compress,
    maybe_decompress, monotonic_ms, touch_activity,
};

const READ_BUFFER: usize = 8192;

struct Connection {
    id: ConnectionId,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_activity: AtomicU64,
    peer: SocketAddr,
}

struct Shared {
    config: TcpConfig,
    serializer: Arc<dyn MessageSerializer>,
    state: Mutex<TransportState>,
    stats: Arc<TransportStats>,
    subscriptions: Arc<SubscriptionRegistry>,
    connections: dashmap::DashMap<ConnectionId, Arc<Connection>>,
    epoch: Instant,
    time: SharedTimeProvider,
}

impl Shared {
    fn set_state(&self, next: TransportState) {
        *self.state.lock().expect("transport state poisoned") = next;
    }

    fn state(&self) -> TransportState {
        *self.state.lock().expect("transport state poisoned")
    }

    fn remove_connection(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            self.stats.current_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Framed TCP transport, server or client per configuration
pub struct TcpTransport {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    send_pool: Mutex<Option<Arc<ConnectionPool<TcpConnectionFactory>>>>,
    name: &'static str,
}

impl TcpTransport {
    /// Creates a transport from configuration
    ///
    /// # Errors
    ///
    /// `ConfigError` when the configuration is unusable.
    pub fn new(
        config: TcpConfig,
        serializer: Arc<dyn MessageSerializer>,
        time: SharedTimeProvider,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = if config.is_server { "tcp-server" } else { "tcp-client" };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                serializer,
                state: Mutex::new(TransportState::Disconnected),
                stats: Arc::new(TransportStats::default()),
                subscriptions: Arc::new(SubscriptionRegistry::new()),
                connections: dashmap::DashMap::new(),
                epoch: Instant::now(),
                time,
            }),
            lifecycle: Mutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                tasks: Vec::new(),
                local_addr: None,
            }),
            send_pool: Mutex::new(None),
            name,
        })
    }

    /// Bound address in server mode, available once connected
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().expect("lifecycle poisoned").local_addr
    }

    /// Connection ids of live connections, usable as send destinations
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.key().to_string())
            .collect()
    }

    /// Registers a subscription with the per-subscription error channel
    /// enabled
    ///
    /// # Errors
    ///
    /// `InvalidState` when the transport is disposed.
    pub async fn subscribe_with_errors(
        &self,
        source: Option<&str>,
        handler: TransportHandler,
    ) -> Result<TransportSubscription, TransportError> {
        self.subscribe_inner(source, handler, true)
    }

    fn subscribe_inner(
        &self,
        source: Option<&str>,
        handler: TransportHandler,
        with_errors: bool,
    ) -> Result<TransportSubscription, TransportError> {
        if self.shared.state() == TransportState::Disposed {
            return Err(TransportError::InvalidState {
                state: TransportState::Disposed.to_string(),
            });
        }
        Ok(self.shared.subscriptions.insert(
            source.map(ToString::to_string),
            handler,
            with_errors,
            self.shared.stats.clone(),
        ))
    }

    async fn connect_server(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let listener = bind_listener(&self.shared.config)?;
        let local_addr = listener.local_addr()?;
        let lifecycle_cancel = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
            lifecycle.cancel = cancel.child_token();
            lifecycle.local_addr = Some(local_addr);
            lifecycle.cancel.clone()
        };
        let shared = self.shared.clone();
        let task = tokio::spawn(accept_loop(shared, listener, lifecycle_cancel));
        self.lifecycle
            .lock()
            .expect("lifecycle poisoned")
            .tasks
            .push(task);
        info!(addr = %local_addr, "tcp server listening");
        Ok(())
    }

    async fn connect_client(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let lifecycle_cancel = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
            lifecycle.cancel = cancel.child_token();
            lifecycle.cancel.clone()
        };
        let shared = self.shared.clone();
        let policy = shared.config.common.reconnect.backoff.clone();
        let attempts = shared.config.common.reconnect.attempts.max(1);
        let time = shared.time.clone();
        let stream = connect_with_retry(&policy, attempts, &time, cancel, || {
            establish_stream(shared.clone())
        })
        .await?;
        register_connection(self.shared.clone(), stream, lifecycle_cancel);

        if self.shared.config.use_connection_pooling {
            let pool = ConnectionPool::new(
                TcpConnectionFactory {
                    shared: self.shared.clone(),
                },
                crate::config::PoolConfig {
                    min: 0,
                    max: self.shared.config.connection_pool_size,
                    acquire_timeout: self.shared.config.connection_pool_timeout.as_duration(),
                    ..crate::config::PoolConfig::default()
                },
                self.shared.time.clone(),
            )
            .map_err(|e| TransportError::Rejected {
                reason: e.to_string(),
            })?;
            let maintenance = tokio::spawn(
                pool.clone().run_maintenance(
                    self.lifecycle
                        .lock()
                        .expect("lifecycle poisoned")
                        .cancel
                        .clone(),
                ),
            );
            self.lifecycle
                .lock()
                .expect("lifecycle poisoned")
                .tasks
                .push(maintenance);
            *self.send_pool.lock().expect("send pool poisoned") = Some(pool);
        }
        info!(
            remote = %format!("{}:{}", self.shared.config.remote_host, self.shared.config.remote_port),
            "tcp client connected"
        );
        Ok(())
    }

    fn encode_envelope(
        &self,
        envelope: &Envelope,
        destination: Option<&str>,
    ) -> Result<Bytes, TransportError> {
        let mut message = self.shared.serializer.to_transport(envelope)?;
        if let Some(dest) = destination {
            message.destination = Some(dest.to_string());
        }
        maybe_compress(&mut message, &self.shared.config.common.compression)?;
        let bytes = self.shared.serializer.encode(&message)?;
        encode_frame(
            &bytes,
            &self.shared.config.framing,
            self.shared.config.max_message_size.as_usize(),
        )
    }

    fn send_targets(
        &self,
        destination: Option<&str>,
    ) -> Result<Vec<Arc<Connection>>, TransportError> {
        if self.shared.config.is_server {
            match destination {
                Some(raw) => {
                    let id = raw
                        .parse::<uuid::Uuid>()
                        .map(ConnectionId::new)
                        .map_err(|_| TransportError::Rejected {
                            reason: format!("invalid connection id: {raw}"),
                        })?;
                    let conn = self
                        .shared
                        .connections
                        .get(&id)
                        .map(|c| c.clone())
                        .ok_or_else(|| TransportError::Rejected {
                            reason: format!("no such connection: {raw}"),
                        })?;
                    Ok(vec![conn])
                }
                None => Ok(self
                    .shared
                    .connections
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect()),
            }
        } else {
            let conn = self
                .shared
                .connections
                .iter()
                .next()
                .map(|entry| entry.value().clone())
                .ok_or(TransportError::NotConnected)?;
            Ok(vec![conn])
        }
    }

    async fn pooled_send(&self, frame: &Bytes) -> Result<(), TransportError> {
        let pool = self
            .send_pool
            .lock()
            .expect("send pool poisoned")
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let cancel = CancellationToken::new();
        let mut lease = pool.acquire(&cancel).await?;
        let started = Instant::now();
        let write_timeout = self.shared.config.common.write_timeout.as_duration();
        let result = lease.get().write_frame(frame, write_timeout).await;
        match result {
            Ok(()) => {
                self.shared.stats.record_send(frame.len(), started.elapsed());
                lease.release().await;
                Ok(())
            }
            Err(err) => {
                self.shared.stats.record_send_failure(&err);
                lease.mark_unhealthy();
                lease.release().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        self.name
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        match self.shared.state() {
            TransportState::Disconnected => {}
            state @ (TransportState::Connected
            | TransportState::Connecting
            | TransportState::Reconnecting
            | TransportState::Disconnecting
            | TransportState::Disposed) => {
                return Err(TransportError::InvalidState {
                    state: state.to_string(),
                });
            }
        }
        self.shared.set_state(TransportState::Connecting);
        let result = if self.shared.config.is_server {
            self.connect_server(cancel).await
        } else {
            self.connect_client(cancel).await
        };
        match result {
            Ok(()) => {
                self.shared.set_state(TransportState::Connected);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(TransportState::Disconnected);
                *self.shared.stats.last_error.lock().expect("stats poisoned") =
                    Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.shared.state() == TransportState::Disposed {
            return Ok(());
        }
        self.shared.set_state(TransportState::Disconnecting);

        // Drain in-flight writes up to the write-timeout grace deadline.
        let grace = self.shared.config.common.write_timeout.as_duration();
        let connections: Vec<Arc<Connection>> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in connections {
            if let Ok(mut writer) = tokio::time::timeout(grace, conn.writer.lock()).await {
                let _ = writer.shutdown().await;
            }
            self.shared.remove_connection(conn.id);
        }

        let pool = self.send_pool.lock().expect("send pool poisoned").take();
        if let Some(pool) = pool {
            pool.close().await;
        }

        let mut lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
        lifecycle.cancel.cancel();
        for task in lifecycle.tasks.drain(..) {
            task.abort();
        }
        lifecycle.local_addr = None;
        drop(lifecycle);

        self.shared.set_state(TransportState::Disposed);
        info!(transport = self.name, "transport disposed");
        Ok(())
    }

    async fn send(
        &self,
        envelope: &Envelope,
        destination: Option<&str>,
    ) -> Result<(), TransportError> {
        if self.shared.state() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let frame = self.encode_envelope(envelope, destination)?;

        if !self.shared.config.is_server && self.shared.config.use_connection_pooling {
            return self.pooled_send(&frame).await;
        }

        let targets = self.send_targets(destination)?;
        if targets.is_empty() {
            return Err(TransportError::Rejected {
                reason: "no connected peers".to_string(),
            });
        }
        let write_timeout = self.shared.config.common.write_timeout.as_duration();
        for conn in targets {
            let started = Instant::now();
            match write_frame(&conn, &frame, write_timeout).await {
                Ok(()) => {
                    self.shared.stats.record_send(frame.len(), started.elapsed());
                    touch_activity(&conn.last_activity, self.shared.epoch);
                }
                Err(err) => {
                    self.shared.stats.record_send_failure(&err);
                    warn!(connection = %conn.id, error = %err, "send failed, closing connection");
                    self.shared.remove_connection(conn.id);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        source: Option<&str>,
        handler: TransportHandler,
    ) -> Result<TransportSubscription, TransportError> {
        self.subscribe_inner(source, handler, false)
    }

    fn statistics(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

async fn write_frame(
    conn: &Connection,
    frame: &[u8],
    write_timeout: Duration,
) -> Result<(), TransportError> {
    let mut writer = conn.writer.lock().await;
    let io = async {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    };
    match tokio::time::timeout(write_timeout, io).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(TransportError::Wire { source }),
        Err(_) => Err(TransportError::Timeout {
            elapsed_ms: write_timeout.as_millis() as u64,
        }),
    }
}

fn bind_listener(config: &TcpConfig) -> Result<TcpListener, TransportError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| TransportError::Rejected {
            reason: format!("invalid bind address {}:{}", config.host, config.port),
        })?;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    if let Some(size) = config.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(config.backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

fn apply_stream_options(stream: &TcpStream, config: &TcpConfig) -> Result<(), TransportError> {
    stream.set_nodelay(config.no_delay)?;
    let sock = socket2::SockRef::from(stream);
    if config.common.keep_alive {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(config.common.keep_alive_interval.as_duration());
        sock.set_tcp_keepalive(&keepalive)?;
    }
    if let Some(size) = config.receive_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    sock.set_linger(config.linger)?;
    Ok(())
}

async fn establish_stream(shared: Arc<Shared>) -> Result<TcpStream, TransportError> {
    let addr = format!(
        "{}:{}",
        shared.config.remote_host, shared.config.remote_port
    );
    let connect_timeout = shared.config.common.connect_timeout.as_duration();
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Timeout {
            elapsed_ms: connect_timeout.as_millis() as u64,
        })??;
    apply_stream_options(&stream, &shared.config)?;
    Ok(stream)
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if shared.connections.len() >= shared.config.max_connections {
                    warn!(%peer, "connection refused: at max_connections");
                    drop(stream);
                    continue;
                }
                if let Err(err) = apply_stream_options(&stream, &shared.config) {
                    warn!(%peer, error = %err, "failed to apply socket options");
                }
                let id = register_connection(shared.clone(), stream, cancel.clone());
                debug!(%peer, connection = %id, "connection accepted");
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                shared
                    .subscriptions
                    .deliver_error(&TransportError::Wire { source: err });
            }
        }
    }
}

fn register_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> ConnectionId {
    let peer = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (read_half, write_half) = stream.into_split();
    let id = ConnectionId::generate();
    let conn = Arc::new(Connection {
        id,
        writer: tokio::sync::Mutex::new(write_half),
        last_activity: AtomicU64::new(monotonic_ms(shared.epoch)),
        peer,
    });
    shared.connections.insert(id, conn.clone());
    shared.stats.current_connections.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(read_loop(shared.clone(), conn.clone(), read_half, cancel.clone()));
    if shared.config.heartbeat_interval.is_some() {
        tokio::spawn(heartbeat_loop(shared, conn, cancel));
    }
    id
}

async fn read_loop(
    shared: Arc<Shared>,
    conn: Arc<Connection>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::new(
        shared.config.framing.clone(),
        shared.config.max_message_size.as_usize(),
    );
    let mut buf = [0u8; READ_BUFFER];
    let source_id = conn.id.to_string();

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = read_half.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                if let Err(err) = decoder.finish() {
                    warn!(connection = %source_id, peer = %conn.peer, "peer closed mid-frame");
                    shared.subscriptions.deliver_error(&err);
                } else {
                    debug!(connection = %source_id, peer = %conn.peer, "peer closed cleanly");
                }
                break;
            }
            Ok(n) => {
                shared.stats.record_receive(n);
                touch_activity(&conn.last_activity, shared.epoch);
                decoder.extend(&buf[..n]);
                match drain_frames(&shared, &source_id, &mut decoder).await {
                    Ok(()) => {}
                    Err(err) => {
                        error!(connection = %source_id, error = %err, "framing violation, closing connection");
                        shared.subscriptions.deliver_error(&err);
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(connection = %source_id, error = %err, "read failed");
                shared
                    .subscriptions
                    .deliver_error(&TransportError::Wire { source: err });
                break;
            }
        }
    }

    shared.remove_connection(conn.id);
    maybe_reconnect(shared, cancel);
}

async fn drain_frames(
    shared: &Arc<Shared>,
    source_id: &str,
    decoder: &mut FrameDecoder,
) -> Result<(), TransportError> {
    loop {
        match decoder.next_frame()? {
            None => return Ok(()),
            Some(frame) => {
                if frame.is_empty() {
                    // Peer heartbeat: activity only.
                    continue;
                }
                match shared.serializer.decode(&frame) {
                    Ok(mut message) => {
                        if let Err(err) = maybe_decompress(&mut message) {
                            warn!(error = %err, "failed to decompress payload");
                            shared.subscriptions.deliver_error(&err);
                            continue;
                        }
                        shared.stats.record_message_in();
                        shared
                            .subscriptions
                            .deliver(Some(source_id), &message, &shared.stats)
                            .await;
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to decode transport message");
                        shared.subscriptions.deliver_error(&err);
                    }
                }
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, conn: Arc<Connection>, cancel: CancellationToken) {
    let Some(interval) = shared.config.heartbeat_interval else {
        return;
    };
    let tick = interval / 2;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = shared.time.sleep(tick.max(Duration::from_millis(10))) => {}
        }
        if !shared.connections.contains_key(&conn.id) {
            return;
        }
        let idle = monotonic_ms(shared.epoch)
            .saturating_sub(conn.last_activity.load(Ordering::Relaxed));
        if let Some(timeout) = shared.config.heartbeat_timeout
            && idle >= timeout.as_millis() as u64
        {
            warn!(connection = %conn.id, idle_ms = idle, "heartbeat timeout, closing connection");
            shared
                .subscriptions
                .deliver_error(&TransportError::HeartbeatTimeout);
            shared.remove_connection(conn.id);
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
            return;
        }
        if idle >= interval.as_millis() as u64 {
            let frame = match encode_frame(
                &[],
                &shared.config.framing,
                shared.config.max_message_size.as_usize(),
            ) {
                Ok(frame) => frame,
                Err(_) => return,
            };
            let write_timeout = shared.config.common.write_timeout.as_duration();
            if write_frame(&conn, &frame, write_timeout).await.is_ok() {
                touch_activity(&conn.last_activity, shared.epoch);
                debug!(connection = %conn.id, "heartbeat sent");
            }
        }
    }
}

/// Client-side auto-reconnect: a wire failure on a connected transport
/// transitions to `Reconnecting` and re-attempts connect per policy, with
/// subscriptions preserved in the shared registry.
fn maybe_reconnect(shared: Arc<Shared>, cancel: CancellationToken) {
    if shared.config.is_server
        || !shared.config.common.reconnect.enabled
        || cancel.is_cancelled()
        || shared.state() != TransportState::Connected
    {
        return;
    }
    shared.set_state(TransportState::Reconnecting);
    tokio::spawn(async move {
        let policy = shared.config.common.reconnect.backoff.clone();
        let attempts = shared.config.common.reconnect.attempts.max(1);
        let time = shared.time.clone();
        let result = connect_with_retry(&policy, attempts, &time, &cancel, || {
            establish_stream(shared.clone())
        })
        .await;
        match result {
            Ok(stream) => {
                register_connection(shared.clone(), stream, cancel);
                shared.set_state(TransportState::Connected);
                info!("tcp client reconnected");
            }
            Err(err) => {
                error!(error = %err, "reconnect attempts exhausted");
                shared.set_state(TransportState::Disconnected);
                shared.subscriptions.deliver_error(&err);
            }
        }
    });
}

/// One pooled send-only connection
pub struct PooledTcpConnection {
    id: ConnectionId,
    stream: tokio::sync::Mutex<TcpStream>,
    framing: crate::transport::framing::FramingProtocol,
    max_frame: usize,
}

impl PooledTcpConnection {
    async fn write_frame(&self, frame: &[u8], write_timeout: Duration) -> Result<(), TransportError> {
        let mut stream = self.stream.lock().await;
        let io = async {
            stream.write_all(frame).await?;
            stream.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match tokio::time::timeout(write_timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(TransportError::Wire { source }),
            Err(_) => Err(TransportError::Timeout {
                elapsed_ms: write_timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl PooledResource for PooledTcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn is_healthy(&self) -> bool {
        // Zero-byte heartbeat frame as the probe.
        match encode_frame(&[], &self.framing, self.max_frame) {
            Ok(frame) => self
                .write_frame(&frame, Duration::from_secs(5))
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
    }
}

/// Opens pooled send connections to the configured remote endpoint
pub struct TcpConnectionFactory {
    shared: Arc<Shared>,
}

#[async_trait]
impl ResourceFactory for TcpConnectionFactory {
    type Resource = PooledTcpConnection;

    async fn establish(&self) -> Result<PooledTcpConnection, PoolError> {
        let stream = establish_stream(self.shared.clone())
            .await
            .map_err(|err| PoolError::Establish {
                source: anyhow::anyhow!(err),
            })?;
        Ok(PooledTcpConnection {
            id: ConnectionId::generate(),
            stream: tokio::sync::Mutex::new(stream),
            framing: self.shared.config.framing.clone(),
            max_frame: self.shared.config.max_message_size.as_usize(),
        })
    }
}
