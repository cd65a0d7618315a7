use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{fence, AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::{
    net::{TcpListener, TcpStream},
    Interest,
};
use parking_lot::Mutex;

use crate::{
    buffers::Pulled,
    config::ServerConfig,
    connection::{Connection, ConnectionId},
    error::{NetworkError, Result},
    event::UnifiedEvent,
    handler::Listener,
    logging::{LevelFilter, LogLevel, Logger},
    poll::{PollHandle, LISTENER_TOKEN, UDP_TOKEN},
    pool::BufferPool,
    registry::ConnectionRegistry,
    udp::UdpChannel,
};

/// Reads performed for one readable event before the connection is re-armed
/// and the loop moves on to other connections.
pub(crate) const READS_PER_EVENT: usize = 16;

/// The single-threaded dispatch core behind [`Server`](crate::Server).
///
/// Owns the multiplexer, the listening socket(s) and the connection registry.
/// Each [`update`](Reactor::update) turns one batch of readiness events into
/// accepts, reads, writes and callbacks.
pub(crate) struct Reactor {
    pub(crate) poll: PollHandle,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) listener: Arc<dyn Listener>,
    pub(crate) logger: LevelFilter,
    pub(crate) config: ServerConfig,
    pub(crate) pool: BufferPool,
    pub(crate) running: AtomicBool,
    close_generation: AtomicU64,
    update_lock: Mutex<()>,
    tcp_listener: Mutex<Option<TcpListener>>,
    udp: Mutex<Option<UdpChannel>>,
}

impl Reactor {
    pub(crate) fn new(config: ServerConfig, listener: Arc<dyn Listener>) -> Result<Arc<Self>> {
        config.validate()?;
        let logger = LevelFilter::new(Arc::clone(&config.logger), config.log_level);

        Ok(Arc::new(Self {
            poll: PollHandle::new(config.events_capacity)?,
            connections: ConnectionRegistry::new(),
            listener,
            logger,
            pool: BufferPool::new(config.buffer_pool_size, config.read_buffer_size),
            config,
            running: AtomicBool::new(false),
            close_generation: AtomicU64::new(0),
            update_lock: Mutex::new(()),
            tcp_listener: Mutex::new(None),
            udp: Mutex::new(None),
        }))
    }

    /// Replaces any current listener with one bound to `tcp` (and `udp`).
    ///
    /// The registration happens under the update lock after waking the poller,
    /// so it never interleaves with a running update. On failure the server is
    /// left closed and unbound.
    pub(crate) fn bind(&self, tcp: SocketAddr, udp: Option<SocketAddr>) -> Result<()> {
        self.close();

        let bound = {
            let _guard = self.update_lock.lock();
            if let Err(e) = self.poll.wake() {
                self.logger
                    .log(LogLevel::Debug, &format!("Unable to wake poller: {e}"));
            }
            self.bind_locked(tcp, udp)
        };

        if let Err(e) = bound {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    fn bind_locked(&self, tcp: SocketAddr, udp: Option<SocketAddr>) -> Result<()> {
        let mut listener = TcpListener::bind(tcp).map_err(|e| NetworkError::bind(tcp, e))?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local = listener.local_addr()?;
        *self.tcp_listener.lock() = Some(listener);
        self.logger.log(
            LogLevel::Info,
            &format!("Accepting connections on port: {local}/TCP"),
        );

        if let Some(udp_addr) = udp {
            let channel = UdpChannel::bind(self.poll.registry(), udp_addr)
                .map_err(|e| NetworkError::bind(udp_addr, e))?;
            self.logger.log(
                LogLevel::Info,
                &format!("Accepting connections on port: {}/UDP", channel.local_addr()),
            );
            *self.udp.lock() = Some(channel);
        }
        Ok(())
    }

    /// Runs one loop iteration: wait up to `timeout`, then dispatch.
    pub(crate) fn update(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        // wait out an in-progress bind before touching the poller
        drop(self.update_lock.lock());

        let events = self.poll.poll(timeout)?;
        for event in events {
            self.dispatch(event);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, event: UnifiedEvent) {
        match event.token() {
            LISTENER_TOKEN => self.accept_pending(),
            UDP_TOKEN => self.read_udp(),
            token => {
                let connection = u32::try_from(token.0)
                    .ok()
                    .and_then(|raw| self.connections.get(ConnectionId(raw)));

                let Some(connection) = connection else {
                    // closed earlier in this pass
                    self.logger
                        .log(LogLevel::Debug, &format!("Skipping stale event {event:?}"));
                    return;
                };

                if event.is_readable() {
                    self.read_connection(&connection);
                }
                if event.is_writable() && connection.is_connected() {
                    self.write_connection(&connection);
                }
            }
        }
    }

    fn accept_pending(self: &Arc<Self>) {
        loop {
            let (accepted, generation) = {
                let guard = self.tcp_listener.lock();
                let Some(listener) = guard.as_ref() else {
                    return;
                };
                (listener.accept(), self.close_generation())
            };

            match accepted {
                Ok((stream, peer_addr)) => self.accept_operation(stream, peer_addr, generation),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.logger.log(
                        LogLevel::Warn,
                        &format!("Unable to accept new connection: {e}"),
                    );
                    break;
                }
            }
        }
    }

    fn close_generation(&self) -> u64 {
        self.close_generation.load(Ordering::SeqCst)
    }

    /// Registers a freshly accepted stream.
    ///
    /// `generation` is the close generation observed while the listener was
    /// still in place. A `close` that ran since then may have missed this
    /// connection in its snapshot, so it is closed here instead, silently,
    /// before `connected` could fire.
    fn accept_operation(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        generation: u64,
    ) {
        if let Some(max) = self.config.max_connections {
            if self.connections.len() >= max {
                self.logger.log(
                    LogLevel::Warn,
                    &format!("Max connections reached, rejecting {peer_addr}"),
                );
                return;
            }
        }

        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            self.logger
                .log(LogLevel::Debug, &format!("Failed to set TCP_NODELAY: {e}"));
        }

        let id = self.connections.allocate_id();
        let connection = match Connection::accept(self, id, stream, peer_addr) {
            Ok(connection) => connection,
            Err(e) => {
                self.logger.log(
                    LogLevel::Debug,
                    &format!("Unable to accept TCP connection: {e}"),
                );
                return;
            }
        };

        // published while still pending, so a racing close closes it silently
        self.connections.add(Arc::clone(&connection));
        fence(Ordering::SeqCst);
        if self.close_generation() != generation {
            self.logger.log(
                LogLevel::Debug,
                &format!("Server closed while accepting {peer_addr}, dropping {connection}"),
            );
            connection.close();
            return;
        }
        if !connection.mark_connected() {
            return;
        }
        self.logger.log(
            LogLevel::Debug,
            &format!("{connection} connected from {peer_addr}"),
        );
        connection.notify_connected();
    }

    /// Delivers the lines available on `connection`, in arrival order.
    ///
    /// Readiness is edge-triggered, so bytes left unread are never reported
    /// again on their own. Reads continue until the socket runs dry, or until
    /// [`READS_PER_EVENT`] reads have been made; in that case the connection
    /// is re-armed so the rest is picked up on a later pass and a peer that
    /// streams nonstop cannot starve the others.
    fn read_connection(&self, connection: &Arc<Connection>) {
        for _ in 0..READS_PER_EVENT {
            if !connection.is_connected() {
                return;
            }
            match connection.pull_lines() {
                Ok(Pulled::Lines(lines)) => {
                    for line in lines {
                        if !connection.is_connected() {
                            return;
                        }
                        if self.logger.enabled(LogLevel::Debug) {
                            self.logger
                                .log(LogLevel::Debug, &format!("{connection} received TCP: {line}"));
                        }
                        connection.notify_received(&line);
                    }
                }
                Ok(Pulled::Idle) => return,
                Err(e) => {
                    self.logger
                        .log(LogLevel::Debug, &format!("{connection} warning: {e}"));
                    connection.close();
                    return;
                }
            }
        }

        if let Err(e) = connection.rearm() {
            self.logger
                .log(LogLevel::Debug, &format!("{connection} unable to re-arm: {e}"));
            connection.close();
        }
    }

    fn write_connection(&self, connection: &Arc<Connection>) {
        if let Err(e) = connection.flush_writes() {
            self.logger
                .log(LogLevel::Debug, &format!("{connection} update: {e}"));
            connection.close();
        }
    }

    fn read_udp(&self) {
        let guard = self.udp.lock();
        let Some(channel) = guard.as_ref() else {
            return;
        };

        let mut scratch = self.pool.acquire();
        loop {
            let (from, len) = match channel.read_from_address(&mut scratch) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("Error reading UDP data: {e}"));
                    break;
                }
            };

            let owner = self
                .connections
                .snapshot()
                .into_iter()
                .find(|connection| connection.udp_remote_address() == Some(from));

            match owner {
                Some(connection) => self.logger.log(
                    LogLevel::Debug,
                    &format!("{connection} received UDP ({len}), dropped: no UDP framing"),
                ),
                None => self.logger.log(
                    LogLevel::Debug,
                    &format!("Ignoring UDP from unregistered address: {from}"),
                ),
            }
        }
    }

    /// Closes every connection and the listening socket(s). Idempotent, never
    /// fails, and safe to call before anything was bound.
    pub(crate) fn close(&self) {
        // bumped under the listener lock: an accept either saw the old
        // generation and closes itself, or finds no listener at all
        let tcp_listener = {
            let mut guard = self.tcp_listener.lock();
            self.close_generation.fetch_add(1, Ordering::SeqCst);
            guard.take()
        };
        fence(Ordering::SeqCst);

        let live = self.connections.snapshot();
        if !live.is_empty() {
            self.logger
                .log(LogLevel::Info, "Closing server connections...");
        }
        for connection in live {
            connection.close();
        }

        if let Some(mut listener) = tcp_listener {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                self.logger
                    .log(LogLevel::Debug, &format!("Unable to close server: {e}"));
            }
            self.logger.log(LogLevel::Info, "Server closed.");
        }

        if let Some(channel) = self.udp.lock().take() {
            if let Err(e) = channel.close(self.poll.registry()) {
                self.logger
                    .log(LogLevel::Debug, &format!("Unable to close UDP channel: {e}"));
            }
        }

        let _guard = self.update_lock.lock();
        if let Some(Err(e)) = self.poll.flush() {
            self.logger
                .log(LogLevel::Debug, &format!("Final close poll failed: {e}"));
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp_listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub(crate) fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp.lock().as_ref().map(UdpChannel::local_addr)
    }
}
