use std::{io, sync::Arc, time::Duration};

use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::event::UnifiedEvent;

/// Wakes a blocked `update`, e.g. so `bind` or `stop` can proceed.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);
/// The TCP listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX - 2);
/// The UDP side channel, when bound.
pub const UDP_TOKEN: Token = Token(usize::MAX - 3);

struct Selector {
    poller: Poll,
    events: Events,
}

/// The readiness multiplexer.
///
/// Only one thread polls at a time (the poller sits behind a mutex), while the
/// shared `Registry` lets any thread register, re-register or deregister
/// sources without waiting for the poll to return.
pub struct PollHandle {
    selector: Mutex<Selector>,
    registry: Arc<Registry>,
    waker: Waker,
}

impl PollHandle {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let poller = Poll::new()?;
        let registry = Arc::new(poller.registry().try_clone()?);
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(PollHandle {
            selector: Mutex::new(Selector {
                poller,
                events: Events::with_capacity(events_capacity),
            }),
            registry,
            waker,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Waits up to `timeout` (`Duration::ZERO` returns immediately) and copies
    /// out the ready events. Waker events are filtered out.
    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<UnifiedEvent>> {
        let mut selector = self.selector.lock();
        let Selector { poller, events } = &mut *selector;

        match poller.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(UnifiedEvent::from)
            .collect())
    }

    /// One non-blocking pass that lets the OS finish releasing closed sockets.
    ///
    /// Skipped (returns `None`) when another thread is mid-poll; that poll
    /// does the same job.
    pub fn flush(&self) -> Option<io::Result<()>> {
        let mut selector = self.selector.try_lock()?;
        let Selector { poller, events } = &mut *selector;
        Some(poller.poll(events, Some(Duration::ZERO)))
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
