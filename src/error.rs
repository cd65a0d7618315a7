use std::{io, net::SocketAddr, result::Result as StdResult};

use thiserror::Error;

pub type Result<T> = StdResult<T, NetworkError>;

/// Server-level failures.
///
/// I/O trouble on a single established connection never shows up here: it
/// closes that connection and is observed through
/// [`Listener::disconnected`](crate::Listener::disconnected) instead.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Bind Error: could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Resolve Error: {0}")]
    Resolve(String),

    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Spawn Error: could not start the server thread: {0}")]
    Spawn(#[source] io::Error),
}

impl NetworkError {
    pub(crate) fn bind(addr: SocketAddr, source: io::Error) -> Self {
        NetworkError::Bind { addr, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let addr: SocketAddr = "127.0.0.1:1337".parse().unwrap();
        let err = NetworkError::bind(addr, io::Error::from(io::ErrorKind::AddrInUse));
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:1337"), "{msg}");
    }

    #[test]
    fn test_io_error_converts() {
        let err: NetworkError = io::Error::other("boom").into();
        assert!(matches!(err, NetworkError::Io(_)));
    }
}
