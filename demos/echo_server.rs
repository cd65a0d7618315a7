//! Line chat server.
//!
//! Lines starting with `ALL` go to every client, lines starting with `EXCEPT`
//! go to everyone but the sender, anything else is echoed back.
//!
//! ```text
//! cargo run --example echo_server -- 127.0.0.1:1337
//! nc 127.0.0.1 1337
//! ```

use std::sync::Arc;

use anyhow::Context;
use mill_lines::prelude::*;
use tracing_subscriber::EnvFilter;

struct ChatHandler;

impl Listener for ChatHandler {
    fn connected(&self, connection: &Connection) {
        tracing::info!("{connection} joined from {:?}", connection.remote_address());
        connection.send("welcome");
    }

    fn disconnected(&self, connection: &Connection) {
        tracing::info!("{connection} left");
    }

    fn received(&self, connection: &Connection, line: &str) {
        if line.is_empty() {
            return;
        }
        let Some(server) = connection.server() else {
            return;
        };

        if line.starts_with("ALL") {
            server.broadcast(line);
        } else if line.starts_with("EXCEPT") {
            server.broadcast_except(connection.id(), line);
        } else {
            connection.send(line);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1337".to_string());

    let config = ServerConfig::builder()
        .logger(Arc::new(TracingLogger))
        .verbose(true)
        .build()?;

    let server = Server::new(config, ChatHandler)?;
    server
        .bind(addr.as_str())
        .with_context(|| format!("binding {addr}"))?;

    server.run();
    Ok(())
}
