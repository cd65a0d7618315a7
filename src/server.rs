use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::{atomic::Ordering, Arc},
    thread::{self, Builder, JoinHandle},
    time::Duration,
};

use crate::{
    config::ServerConfig,
    connection::{Connection, ConnectionId},
    error::{NetworkError, Result},
    handler::Listener,
    logging::{LogLevel, Logger},
    reactor::Reactor,
};

/// Name of the thread spawned by [`Server::start`].
pub const SERVER_THREAD_NAME: &str = "mill-lines-server";

/// An embeddable line server.
///
/// `Server` is a cheap handle: clones share the same reactor, so one clone can
/// drive the loop while others bind, broadcast or stop from other threads.
///
/// ## Example
///
/// ```rust,no_run
/// use mill_lines::{Connection, Listener, Server, ServerConfig};
///
/// struct Echo;
///
/// impl Listener for Echo {
///     fn received(&self, connection: &Connection, line: &str) {
///         if !line.is_empty() {
///             connection.send(line);
///         }
///     }
/// }
///
/// let server = Server::new(ServerConfig::default(), Echo)?;
/// server.bind("127.0.0.1:1337")?;
/// let handle = server.start()?;
/// // ...
/// server.stop();
/// let _ = handle.join();
/// # Ok::<(), mill_lines::NetworkError>(())
/// ```
#[derive(Clone)]
pub struct Server {
    reactor: Arc<Reactor>,
}

impl Server {
    pub fn new<L: Listener>(config: ServerConfig, listener: L) -> Result<Self> {
        Self::with_shared_listener(config, Arc::new(listener))
    }

    /// Like [`new`](Self::new), for a listener the application keeps a handle to.
    pub fn with_shared_listener(config: ServerConfig, listener: Arc<dyn Listener>) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new(config, listener)?,
        })
    }

    pub(crate) fn from_reactor(reactor: Arc<Reactor>) -> Self {
        Self { reactor }
    }

    /// Opens a TCP listener on `addr`, closing any previous listener and its
    /// connections first.
    ///
    /// ## Errors
    ///
    /// Propagates the bind failure; the server is then left unbound and the
    /// call may be retried.
    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let tcp = resolve(addr)?;
        self.reactor.bind(tcp, None)
    }

    /// Opens a TCP listener on every interface at `port`.
    pub fn bind_port(&self, port: u16) -> Result<()> {
        self.reactor
            .bind(SocketAddr::from(([0, 0, 0, 0], port)), None)
    }

    /// Opens a TCP listener plus the UDP side channel.
    ///
    /// The UDP channel only attributes inbound datagrams to connections by
    /// [`udp_remote_address`](Connection::udp_remote_address); it defines no
    /// datagram framing and delivers nothing to the [`Listener`].
    pub fn bind_with_udp<A: ToSocketAddrs, U: ToSocketAddrs>(&self, tcp: A, udp: U) -> Result<()> {
        let tcp = resolve(tcp)?;
        let udp = resolve(udp)?;
        self.reactor.bind(tcp, Some(udp))
    }

    /// Accepts new connections and reads or writes pending data once.
    ///
    /// Waits up to `timeout` for something to become ready; `Duration::ZERO`
    /// returns immediately. Meant to be called in a tight loop by a dedicated
    /// thread (see [`run`](Self::run)) or driven by the application.
    pub fn update(&self, timeout: Duration) -> Result<()> {
        self.reactor.update(timeout)
    }

    /// Calls [`update`](Self::update) until [`stop`](Self::stop) is called.
    ///
    /// A failed update is logged and closes the server, but does not end the
    /// loop; only `stop` does. The loop then waits one `poll_timeout` before
    /// trying again.
    pub fn run(&self) {
        self.reactor.running.store(true, Ordering::SeqCst);
        self.run_until_stopped();
    }

    fn run_until_stopped(&self) {
        let timeout = self.reactor.config.poll_timeout;
        self.drive(|server| server.update(timeout));
    }

    fn drive<F>(&self, mut step: F)
    where
        F: FnMut(&Self) -> Result<()>,
    {
        let backoff = self.reactor.config.poll_timeout;
        while self.reactor.running.load(Ordering::SeqCst) {
            if let Err(e) = step(self) {
                self.reactor.logger.log(
                    LogLevel::Error,
                    &format!("Error updating server connections: {e}"),
                );
                self.close();
                thread::sleep(backoff);
            }
        }
    }

    /// Spawns a thread that runs the loop until [`stop`](Self::stop).
    pub fn start(&self) -> Result<JoinHandle<()>> {
        self.reactor.running.store(true, Ordering::SeqCst);
        let server = self.clone();
        Builder::new()
            .name(SERVER_THREAD_NAME.to_string())
            .spawn(move || server.run_until_stopped())
            .map_err(|e| {
                self.reactor.running.store(false, Ordering::SeqCst);
                NetworkError::Spawn(e)
            })
    }

    /// Closes the server and makes [`run`](Self::run) return.
    ///
    /// This method is thread-safe and can be called from any thread,
    /// including from inside a callback.
    pub fn stop(&self) {
        self.reactor.running.store(false, Ordering::SeqCst);
        self.close();
        if let Err(e) = self.reactor.poll.wake() {
            self.reactor
                .logger
                .log(LogLevel::Debug, &format!("Unable to wake poller: {e}"));
        }
    }

    /// Closes every connection and the listening socket(s).
    ///
    /// Idempotent, never fails, and fine to call before [`bind`](Self::bind).
    /// There is no graceful drain: queued output is abandoned.
    pub fn close(&self) {
        self.reactor.close();
    }

    pub fn is_running(&self) -> bool {
        self.reactor.running.load(Ordering::SeqCst)
    }

    /// Sends `line` to every live connection, including the sender of the
    /// line being handled.
    pub fn broadcast(&self, line: &str) {
        self.reactor
            .connections
            .for_each(|connection| {
                connection.send(line);
            });
    }

    /// Sends `line` to every live connection except `id`.
    pub fn broadcast_except(&self, id: ConnectionId, line: &str) {
        self.reactor.connections.for_each(|connection| {
            if connection.id() != id {
                connection.send(line);
            }
        });
    }

    /// Sends `line` to connection `id`. A missing id is a no-op returning 0.
    pub fn send_to(&self, id: ConnectionId, line: &str) -> usize {
        self.reactor
            .connections
            .get(id)
            .map_or(0, |connection| connection.send(line))
    }

    /// Snapshot of the live connections, ordered by id.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.reactor.connections.snapshot()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.reactor.connections.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.reactor.connections.len()
    }

    /// Address of the TCP listener, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.reactor.local_addr()
    }

    /// Address of the UDP side channel, once bound.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.reactor.udp_local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.reactor.config
    }
}

fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| NetworkError::Resolve("address resolved to nothing".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpStream,
        sync::atomic::AtomicUsize,
        thread,
        time::Instant,
    };

    #[derive(Default)]
    struct Counter {
        connected: AtomicUsize,
    }

    impl Listener for Counter {
        fn connected(&self, _connection: &Connection) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn received(&self, connection: &Connection, line: &str) {
            if let Some(server) = connection.server() {
                server.broadcast(line);
            }
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_server_start_stop() {
        let server = Server::new(ServerConfig::default(), Counter::default()).unwrap();
        server.bind("127.0.0.1:0").unwrap();
        let handle = server.start().unwrap();
        assert!(server.is_running());

        thread::sleep(Duration::from_millis(50));
        server.stop();
        handle.join().unwrap();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_stop_wakes_a_long_update() {
        let config = ServerConfig::builder()
            .poll_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        let server = Server::new(config, Counter::default()).unwrap();
        server.bind("127.0.0.1:0").unwrap();
        let handle = server.start().unwrap();

        thread::sleep(Duration::from_millis(50));
        let stopped_at = Instant::now();
        server.stop();
        handle.join().unwrap();
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_rebind_while_running() {
        let counter = Arc::new(Counter::default());
        let server =
            Server::with_shared_listener(ServerConfig::default(), counter.clone()).unwrap();
        server.bind("127.0.0.1:0").unwrap();
        let handle = server.start().unwrap();

        server.bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        wait_for(|| counter.connected.load(Ordering::SeqCst) == 1);

        server.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_send_to_missing_id_is_noop() {
        let server = Server::new(ServerConfig::default(), Counter::default()).unwrap();
        assert_eq!(server.send_to(ConnectionId(42), "nobody"), 0);
        server.broadcast("nobody");
        server.broadcast_except(ConnectionId(1), "nobody");
    }

    #[test]
    fn test_callback_can_reach_server() {
        let server = Server::new(ServerConfig::default(), Counter::default()).unwrap();
        server.bind("127.0.0.1:0").unwrap();
        let handle = server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"to everyone\n").unwrap();

        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).unwrap();
        assert_eq!(line, "to everyone\n");

        server.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_failing_update_backs_off() {
        let config = ServerConfig::builder()
            .poll_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let server = Server::new(config, Counter::default()).unwrap();
        server.reactor.running.store(true, Ordering::SeqCst);

        let stopper = server.clone();
        let stop_later = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stopper.stop();
        });

        let attempts = AtomicUsize::new(0);
        server.drive(|_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(NetworkError::Io(std::io::Error::other("poller gone")))
        });
        stop_later.join().unwrap();

        let attempts = attempts.load(Ordering::SeqCst);
        assert!(attempts >= 1);
        assert!(attempts <= 10, "{attempts} attempts in 300ms");
    }

    #[test]
    fn test_unresolvable_bind_is_an_error() {
        let server = Server::new(ServerConfig::default(), Counter::default()).unwrap();
        let empty: &[SocketAddr] = &[];
        assert!(matches!(server.bind(empty), Err(NetworkError::Resolve(_))));
    }
}
