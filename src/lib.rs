//! # Mill-Lines
//! An embeddable line server core: many concurrent TCP clients exchanging
//! newline-delimited text, served by a single-threaded reactor built on [`mio`].
//!
//! The application supplies a [`Listener`] and is told about connects,
//! disconnects and received lines. It never touches sockets, buffers or the
//! event loop.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │   Server    │───▶│   Reactor    │───▶│   PollHandle     │
//! └─────────────┘    └──────────────┘    └──────────────────┘
//!                           │
//!                           ▼
//!                 ┌────────────────────┐    ┌─────────────────────┐
//!                 │ ConnectionRegistry │───▶│ Connection          │
//!                 └────────────────────┘    │  └ ConnectionBuffers│
//!                                           │     └ LineCodec     │
//!                                           └─────────────────────┘
//! ```
//!
//! - One thread drives [`Server::update`] (directly, via [`Server::run`], or
//!   via [`Server::start`]); `connected` and `received` always fire there.
//! - Any thread may `send`, `broadcast`, `bind`, `close` or `stop`.
//! - Lines from one peer arrive in the order the peer wrote them, split at
//!   `\n` and trimmed, however TCP chunked the bytes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_lines::{Connection, Listener, Server, ServerConfig};
//!
//! struct Chat;
//!
//! impl Listener for Chat {
//!     fn connected(&self, connection: &Connection) {
//!         connection.send("welcome");
//!     }
//!
//!     fn received(&self, connection: &Connection, line: &str) {
//!         if line.is_empty() {
//!             return;
//!         }
//!         if let Some(server) = connection.server() {
//!             server.broadcast_except(connection.id(), line);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default(), Chat)?;
//!     server.bind("0.0.0.0:1337")?;
//!     server.run();
//!     Ok(())
//! }
//! ```

pub mod buffers;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod logging;
pub mod poll;
pub mod pool;
mod reactor;
pub mod registry;
pub mod server;
pub mod udp;

pub use codec::LineCodec;
pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{NetworkError, Result};
pub use handler::Listener;
pub use logging::{LogLevel, Logger, NoOpLogger, TracingLogger};
pub use server::Server;

/// Commonly used types, for `use mill_lines::prelude::*;`.
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::connection::{Connection, ConnectionId};
    pub use crate::handler::Listener;
    pub use crate::logging::{LogLevel, Logger, TracingLogger};
    pub use crate::server::Server;
}
