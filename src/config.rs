use std::{fmt, sync::Arc, time::Duration};

use crate::{
    error::{NetworkError, Result},
    logging::{LogLevel, Logger, NoOpLogger},
};

/// Configuration for a [`Server`](crate::Server).
///
/// Controls buffer sizes, connection limits, polling and logging. Use
/// `ServerConfig::builder()` for ergonomic construction.
///
/// ## Buffers
///
/// - read_buffer_size: size of the scratch chunk used for one non-blocking read.
///   It bounds a single read, not a line; partial lines accumulate across reads.
/// - write_buffer_capacity: hard bound on bytes queued per connection. A send
///   that would overflow it breaks (and closes) that connection.
///
/// ## Logging
///
/// - log_level: minimum level forwarded to the logger. Toggling it never
///   changes what goes over the wire.
#[derive(Clone)]
pub struct ServerConfig {
    /// Size of one scratch read chunk
    pub read_buffer_size: usize,
    /// Maximum bytes queued for writing per connection
    pub write_buffer_capacity: usize,
    /// Number of scratch buffers allocated up front
    pub buffer_pool_size: usize,
    /// Maximum readiness events handled per update
    pub events_capacity: usize,
    /// Wait used by each update issued from `run`
    pub poll_timeout: Duration,
    /// Maximum number of live connections
    pub max_connections: Option<usize>,
    /// Enable TCP_NODELAY on accepted sockets
    pub no_delay: bool,
    /// Minimum level handed to the logger
    pub log_level: LogLevel,
    /// Logger for server events
    pub logger: Arc<dyn Logger>,
}

pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_WRITE_BUFFER_CAPACITY: usize = 16384;
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 16;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(NetworkError::Configuration(
                "read_buffer_size must be greater than zero".into(),
            ));
        }
        if self.write_buffer_capacity == 0 {
            return Err(NetworkError::Configuration(
                "write_buffer_capacity must be greater than zero".into(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(NetworkError::Configuration(
                "events_capacity must be greater than zero".into(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(NetworkError::Configuration(
                "max_connections of zero would refuse every peer".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_capacity: DEFAULT_WRITE_BUFFER_CAPACITY,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            max_connections: None,
            no_delay: true,
            log_level: LogLevel::Info,
            logger: Arc::new(NoOpLogger),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_capacity", &self.write_buffer_capacity)
            .field("buffer_pool_size", &self.buffer_pool_size)
            .field("events_capacity", &self.events_capacity)
            .field("poll_timeout", &self.poll_timeout)
            .field("max_connections", &self.max_connections)
            .field("no_delay", &self.no_delay)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

/// Builder for ServerConfig using the builder pattern.
///
/// All fields are optional and will use defaults from ServerConfig::default()
/// if not explicitly set.
#[derive(Default)]
pub struct ServerConfigBuilder {
    read_buffer_size: Option<usize>,
    write_buffer_capacity: Option<usize>,
    buffer_pool_size: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    max_connections: Option<usize>,
    no_delay: Option<bool>,
    log_level: Option<LogLevel>,
    logger: Option<Arc<dyn Logger>>,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scratch read chunk size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    /// Set the per-connection write queue bound
    pub fn write_buffer_capacity(mut self, capacity: usize) -> Self {
        self.write_buffer_capacity = Some(capacity);
        self
    }

    /// Set how many scratch buffers are allocated up front
    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = Some(size);
        self
    }

    /// Set the number of readiness events handled per update
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    /// Set the wait used by `run` for each update
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Set the minimum log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Shorthand for `log_level(LogLevel::Debug)` when enabled
    pub fn verbose(self, enabled: bool) -> Self {
        if enabled {
            self.log_level(LogLevel::Debug)
        } else {
            self
        }
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build and validate the ServerConfig
    pub fn build(self) -> Result<ServerConfig> {
        let default = ServerConfig::default();
        let config = ServerConfig {
            read_buffer_size: self.read_buffer_size.unwrap_or(default.read_buffer_size),
            write_buffer_capacity: self
                .write_buffer_capacity
                .unwrap_or(default.write_buffer_capacity),
            buffer_pool_size: self.buffer_pool_size.unwrap_or(default.buffer_pool_size),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            max_connections: self.max_connections.or(default.max_connections),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            log_level: self.log_level.unwrap_or(default.log_level),
            logger: self.logger.unwrap_or(default.logger),
        };
        config.validate()?;
        Ok(config)
    }
}
