use mio::{event::Event, Token};
use std::fmt;

/// Owned copy of a readiness event.
///
/// mio's `Events` buffer is borrowed from the poller, so the reactor copies out
/// what it needs and releases the poller before running any callbacks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnifiedEvent {
    token: Token,
    is_readable: bool,
    is_writable: bool,
    is_closed: bool,
    is_error: bool,
}

impl fmt::Debug for UnifiedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedEvent")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .field("is_closed", &self.is_closed)
            .field("is_error", &self.is_error)
            .finish()
    }
}

impl UnifiedEvent {
    pub fn new(token: Token, is_readable: bool, is_writable: bool) -> Self {
        Self {
            token,
            is_readable,
            is_writable,
            is_closed: false,
            is_error: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Readable, or hung up: either way a read will tell us what happened.
    pub fn is_readable(&self) -> bool {
        self.is_readable || self.is_closed || self.is_error
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }
}

impl From<&Event> for UnifiedEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_closed: event.is_read_closed() || event.is_write_closed(),
            is_error: event.is_error(),
        }
    }
}
