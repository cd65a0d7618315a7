use crate::connection::Connection;

/// Application callbacks, implemented by the program embedding the server.
///
/// `connected` and `received` always run on the thread driving
/// [`Server::update`](crate::Server::update); none of them should block for
/// long, since no other connection is serviced while a callback runs.
pub trait Listener: Send + Sync + 'static {
    /// Called once for a new peer, before any `received` for it.
    fn connected(&self, connection: &Connection) {
        let _ = connection;
    }

    /// Called at most once, when a connected peer goes away.
    ///
    /// There is no guarantee as to what thread invokes this: a close may be
    /// triggered by the loop or by any thread calling `send` or `close`.
    fn disconnected(&self, connection: &Connection) {
        let _ = connection;
    }

    /// Called once per decoded line, in arrival order.
    fn received(&self, connection: &Connection, line: &str);
}
