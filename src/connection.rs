//! One accepted TCP peer.
//!
//! ```text
//!   Pending ──accepted & registered──▶ Connected ──close()──▶ Closed
//! ```
//!
//! A connection never leaves `Closed`; a reconnecting peer gets a fresh
//! `Connection` with a fresh id. `close` can race from any number of threads
//! and still fires `disconnected` at most once, and only for a connection that
//! actually reached `Connected`.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Weak,
    },
};

use mio::{net::TcpStream, Interest, Registry, Token};
use parking_lot::Mutex;

use crate::{
    buffers::{Broken, ConnectionBuffers, Drained, Pulled, WriteSignal},
    codec::LineCodec,
    handler::Listener,
    logging::{LevelFilter, LogLevel, Logger},
    reactor::Reactor,
    server::Server,
};

/// Identifier of a live connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new(id: u32) -> Self {
        ConnectionId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connected,
    Closed,
}

const PENDING: u8 = 0;
const CONNECTED: u8 = 1;
const CLOSED: u8 = 2;

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            PENDING => ConnectionState::Pending,
            CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: AtomicU8,
    stream: Mutex<Option<TcpStream>>,
    buffers: ConnectionBuffers,
    udp_remote_addr: Mutex<Option<SocketAddr>>,
    registry: Arc<Registry>,
    listener: Arc<dyn Listener>,
    logger: LevelFilter,
    reactor: Weak<Reactor>,
}

impl Connection {
    /// Registers `stream` for read readiness and wraps it, still `Pending`.
    pub(crate) fn accept(
        reactor: &Arc<Reactor>,
        id: ConnectionId,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<Arc<Self>> {
        let registry = Arc::clone(reactor.poll.registry());
        registry.register(&mut stream, id.token(), Interest::READABLE)?;

        Ok(Arc::new(Self {
            id,
            peer_addr,
            state: AtomicU8::new(PENDING),
            stream: Mutex::new(Some(stream)),
            buffers: ConnectionBuffers::new(
                reactor.pool.clone(),
                reactor.config.write_buffer_capacity,
            ),
            udp_remote_addr: Mutex::new(None),
            registry,
            listener: Arc::clone(&reactor.listener),
            logger: reactor.logger.clone(),
            reactor: Arc::downgrade(reactor),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Note that a connection can become disconnected at any time.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The peer's TCP address, or `None` once the connection is closed.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.stream.lock().as_ref().map(|_| self.peer_addr)
    }

    /// Address the peer registered for the UDP side channel, if any.
    pub fn udp_remote_address(&self) -> Option<SocketAddr> {
        *self.udp_remote_addr.lock()
    }

    /// Associates a UDP source address with this connection so inbound
    /// datagrams from it are attributed here rather than dropped as
    /// unregistered.
    pub fn set_udp_remote_address(&self, addr: Option<SocketAddr>) {
        *self.udp_remote_addr.lock() = addr;
    }

    /// The server this connection belongs to, while it is still alive.
    pub fn server(&self) -> Option<Server> {
        self.reactor.upgrade().map(Server::from_reactor)
    }

    /// Queues `line` for delivery and returns the number of bytes accepted.
    ///
    /// Never fails loudly for I/O. A connection that is not connected yet, or
    /// no longer, accepts nothing and returns `0`. One that breaks while
    /// queueing (including write-queue overflow) is closed and returns `0`. Callers observe the failure through that `0` or the
    /// `disconnected` callback.
    ///
    /// # Panics
    ///
    /// Panics if `line` is empty. Sending nothing is a caller bug.
    pub fn send(&self, line: &str) -> usize {
        assert!(!line.is_empty(), "line cannot be empty");
        if !self.is_connected() {
            return 0;
        }

        let bytes = LineCodec::encode_to_bytes(line);
        match self.queue(&bytes) {
            Ok(()) => {
                if self.logger.enabled(LogLevel::Debug) {
                    self.logger
                        .log(LogLevel::Debug, &format!("{self} sent TCP ({})", bytes.len()));
                }
                bytes.len()
            }
            Err(e) => {
                self.logger
                    .log(LogLevel::Debug, &format!("{self} unable to send TCP: {e}"));
                self.close();
                0
            }
        }
    }

    fn queue(&self, bytes: &[u8]) -> Result<(), Broken> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed").into());
        }

        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?;

        if self.buffers.enqueue_write(bytes)? == WriteSignal::RegisterWritable {
            self.registry
                .reregister(stream, self.id.token(), Interest::READABLE | Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Closes the connection. Idempotent and safe from any thread.
    ///
    /// Releases the socket, deregisters it and leaves the server's registry;
    /// fires `disconnected` only if this call moved the connection out of
    /// `Connected`.
    pub fn close(&self) {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            return;
        }

        if let Some(mut stream) = self.stream.lock().take() {
            if let Err(e) = self.registry.deregister(&mut stream) {
                self.logger.log(
                    LogLevel::Debug,
                    &format!("Unable to deregister {self}: {e}"),
                );
            }
        }
        self.buffers.clear();

        if let Some(reactor) = self.reactor.upgrade() {
            reactor.connections.remove(self);
        }

        if previous == CONNECTED {
            self.listener.disconnected(self);
            self.logger
                .log(LogLevel::Info, &format!("{self} disconnected."));
        }
    }

    pub(crate) fn mark_connected(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn notify_connected(&self) {
        self.listener.connected(self);
    }

    pub(crate) fn notify_received(&self, line: &str) {
        self.listener.received(self, line);
    }

    /// One read's worth of lines. The stream lock is released before the
    /// caller dispatches them, so callbacks are free to `send`.
    pub(crate) fn pull_lines(&self) -> Result<Pulled, Broken> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?;
        self.buffers.pull_readable(stream)
    }

    /// Drains queued output; reverts to read-only interest once empty.
    pub(crate) fn flush_writes(&self) -> Result<Drained, Broken> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?;

        let drained = self.buffers.drain_writable(stream)?;
        if drained == Drained::Complete {
            self.registry
                .reregister(stream, self.id.token(), Interest::READABLE)?;
        }
        Ok(drained)
    }

    /// Re-registers the current interest so readiness that is still pending
    /// gets reported again on the next poll.
    pub(crate) fn rearm(&self) -> io::Result<()> {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Ok(());
        };
        let interest = if self.buffers.wants_writable() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.registry.reregister(stream, self.id.token(), interest)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection {}", self.id)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("queued", &self.buffers.queued_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::{
        io::{BufRead, BufReader},
        net::TcpStream as StdTcpStream,
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    #[derive(Default)]
    struct CountingListener {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn connected(&self, _connection: &Connection) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnected(&self, _connection: &Connection) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn received(&self, _connection: &Connection, _line: &str) {}
    }

    /// A reactor plus one accepted (still pending) connection and its client.
    fn accepted_pair(
        listener: Arc<CountingListener>,
    ) -> (Arc<Reactor>, Arc<Connection>, StdTcpStream) {
        let reactor = Reactor::new(ServerConfig::default(), listener).unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdTcpStream::connect(std_listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = std_listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let id = reactor.connections.allocate_id();
        let connection =
            Connection::accept(&reactor, id, TcpStream::from_std(accepted), peer).unwrap();
        reactor.connections.add(Arc::clone(&connection));
        (reactor, connection, client)
    }

    #[test]
    fn test_display_and_state() {
        let (_reactor, connection, _client) = accepted_pair(Arc::default());
        assert_eq!(connection.to_string(), format!("Connection {}", connection.id()));
        assert_eq!(connection.state(), ConnectionState::Pending);
        assert!(connection.mark_connected());
        assert!(!connection.mark_connected());
        assert!(connection.is_connected());
        assert!(connection.remote_address().is_some());
    }

    #[test]
    fn test_close_is_idempotent() {
        let listener = Arc::new(CountingListener::default());
        let (reactor, connection, _client) = accepted_pair(Arc::clone(&listener));
        connection.mark_connected();

        connection.close();
        connection.close();

        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.remote_address().is_none());
        assert!(reactor.connections.get(connection.id()).is_none());
    }

    #[test]
    fn test_close_from_many_threads_fires_once() {
        let listener = Arc::new(CountingListener::default());
        let (_reactor, connection, _client) = accepted_pair(Arc::clone(&listener));
        connection.mark_connected();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let connection = Arc::clone(&connection);
                std::thread::spawn(move || connection.close())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_close_is_silent() {
        let listener = Arc::new(CountingListener::default());
        let (_reactor, connection, _client) = accepted_pair(Arc::clone(&listener));
        connection.close();
        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 0);
        assert!(!connection.mark_connected());
    }

    #[test]
    fn test_send_after_close_returns_zero() {
        let (_reactor, connection, _client) = accepted_pair(Arc::default());
        connection.mark_connected();
        connection.close();
        assert_eq!(connection.send("too late"), 0);
    }

    #[test]
    #[should_panic(expected = "line cannot be empty")]
    fn test_send_empty_panics() {
        let (_reactor, connection, _client) = accepted_pair(Arc::default());
        connection.mark_connected();
        connection.send("");
    }

    #[test]
    fn test_send_then_flush_reaches_peer() {
        let (_reactor, connection, client) = accepted_pair(Arc::default());
        connection.mark_connected();

        assert_eq!(connection.send("hello"), 6);
        assert_eq!(connection.buffers.queued_len(), 6);
        assert_eq!(connection.flush_writes().unwrap(), Drained::Complete);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).unwrap();
        assert_eq!(line, "hello\n");
    }

    #[test]
    fn test_overflowing_send_closes() {
        let listener = Arc::new(CountingListener::default());
        let config = ServerConfig::builder()
            .write_buffer_capacity(8)
            .build()
            .unwrap();
        let reactor = Reactor::new(config, listener.clone()).unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = StdTcpStream::connect(std_listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = std_listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let id = reactor.connections.allocate_id();
        let connection =
            Connection::accept(&reactor, id, TcpStream::from_std(accepted), peer).unwrap();
        connection.mark_connected();

        assert_eq!(connection.send("this is far too long"), 0);
        assert!(!connection.is_connected());
        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_while_pending_is_refused_without_closing() {
        let listener = Arc::new(CountingListener::default());
        let (_reactor, connection, _client) = accepted_pair(Arc::clone(&listener));

        assert_eq!(connection.send("early"), 0);
        assert_eq!(connection.state(), ConnectionState::Pending);
        assert_eq!(connection.buffers.queued_len(), 0);
        assert!(connection.mark_connected());
    }

    #[test]
    fn test_udp_address_round_trip() {
        let (_reactor, connection, _client) = accepted_pair(Arc::default());
        assert!(connection.udp_remote_address().is_none());
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        connection.set_udp_remote_address(Some(addr));
        assert_eq!(connection.udp_remote_address(), Some(addr));
    }
}
