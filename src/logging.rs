//! Injected logging.
//!
//! The server never prints on its own. Everything it has to say goes through a
//! [`Logger`] handed in with the [`ServerConfig`](crate::ServerConfig), filtered
//! by the configured minimum [`LogLevel`]. Applications can implement the trait
//! however they like, or use [`TracingLogger`] to forward into `tracing`.

use std::sync::Arc;

/// Log levels for server events, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for server events.
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards every message to the matching `tracing` macro.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "mill_lines", "{message}"),
            LogLevel::Info => tracing::info!(target: "mill_lines", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "mill_lines", "{message}"),
            LogLevel::Error => tracing::error!(target: "mill_lines", "{message}"),
        }
    }
}

/// A logger paired with the minimum level it should see.
///
/// This is what the reactor and every connection actually hold; `enabled`
/// lets call sites skip building a message nobody will read.
#[derive(Clone)]
pub struct LevelFilter {
    inner: Arc<dyn Logger>,
    min_level: LogLevel,
}

impl LevelFilter {
    pub fn new(inner: Arc<dyn Logger>, min_level: LogLevel) -> Self {
        Self { inner, min_level }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }
}

impl Logger for LevelFilter {
    fn log(&self, level: LogLevel, message: &str) {
        if self.enabled(level) {
            self.inner.log(level, message);
        }
    }
}
