//! Per-connection read and write buffering.
//!
//! Reads are pulled through a pooled scratch chunk into the connection's
//! [`LineCodec`]. Writes are appended to a bounded queue that only the loop
//! thread drains. The socket is touched only through `Read`/`Write`, which is
//! all these operations need; registration changes are left to the caller,
//! driven by the [`WriteSignal`] and [`Drained`] values returned here.
//!
//! ```text
//!   send() ──enqueue_write──▶ [ write queue ] ──drain_writable──▶ socket
//!             (any thread)         Mutex          (loop thread)
//! ```

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{codec::LineCodec, pool::BufferPool};

/// The single failure signal for connection I/O.
///
/// Resets, broken pipes, end-of-stream and queue overflow all collapse into
/// this: the connection has to be closed.
#[derive(Debug, Error)]
#[error("connection broken: {0}")]
pub struct Broken(#[from] io::Error);

impl Broken {
    pub fn closed_by_peer() -> Self {
        Broken(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))
    }

    pub fn cause(&self) -> &io::Error {
        &self.0
    }
}

/// Outcome of one [`ConnectionBuffers::pull_readable`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Pulled {
    /// Bytes were read. Holds the lines they completed, possibly none.
    Lines(Vec<String>),
    /// The socket had nothing to give right now.
    Idle,
}

/// What the caller must do after queueing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSignal {
    /// The queue was empty and nobody is waiting on write readiness yet.
    RegisterWritable,
    /// A drain is already scheduled; the bytes wait for it.
    Queued,
}

/// Outcome of one [`ConnectionBuffers::drain_writable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Queue is empty; write readiness is no longer needed.
    Complete,
    /// The socket filled up with bytes still queued.
    Partial,
}

#[derive(Debug, Default)]
struct WriteQueue {
    bytes: BytesMut,
    write_interest: bool,
}

#[derive(Debug)]
pub struct ConnectionBuffers {
    codec: Mutex<LineCodec>,
    write: Mutex<WriteQueue>,
    pool: BufferPool,
    write_capacity: usize,
}

impl ConnectionBuffers {
    pub fn new(pool: BufferPool, write_capacity: usize) -> Self {
        Self {
            codec: Mutex::new(LineCodec::new()),
            write: Mutex::new(WriteQueue::default()),
            pool,
            write_capacity,
        }
    }

    /// Performs one non-blocking read and feeds whatever arrived to the codec.
    ///
    /// `Ok(Pulled::Idle)` means "nothing yet"; a peer that closed its side
    /// surfaces as `Err(Broken)`, never as an empty read.
    pub fn pull_readable<R: Read + ?Sized>(&self, socket: &mut R) -> Result<Pulled, Broken> {
        let mut scratch = self.pool.acquire();
        let read = loop {
            match socket.read(&mut scratch) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Pulled::Idle),
                Err(e) => return Err(Broken(e)),
            }
        };

        if read == 0 {
            return Err(Broken::closed_by_peer());
        }

        Ok(Pulled::Lines(self.codec.lock().feed(&scratch[..read])))
    }

    /// Appends `bytes` to the write queue.
    ///
    /// Overflowing the configured capacity breaks the connection; nothing is
    /// queued in that case.
    pub fn enqueue_write(&self, bytes: &[u8]) -> Result<WriteSignal, Broken> {
        let mut queue = self.write.lock();

        if queue.bytes.len() + bytes.len() > self.write_capacity {
            return Err(Broken(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "write buffer limit exceeded: {} queued, {} more, capacity {}",
                    queue.bytes.len(),
                    bytes.len(),
                    self.write_capacity
                ),
            )));
        }

        let was_empty = queue.bytes.is_empty();
        queue.bytes.extend_from_slice(bytes);

        if was_empty && !queue.write_interest {
            queue.write_interest = true;
            Ok(WriteSignal::RegisterWritable)
        } else {
            Ok(WriteSignal::Queued)
        }
    }

    /// Writes as much of the queue as the socket accepts without blocking.
    pub fn drain_writable<W: Write + ?Sized>(&self, socket: &mut W) -> Result<Drained, Broken> {
        let mut queue = self.write.lock();

        while !queue.bytes.is_empty() {
            match socket.write(&queue.bytes) {
                Ok(0) => return Err(Broken(io::ErrorKind::WriteZero.into())),
                Ok(n) => queue.bytes.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Broken(e)),
            }
        }

        if queue.bytes.is_empty() {
            queue.write_interest = false;
            Ok(Drained::Complete)
        } else {
            Ok(Drained::Partial)
        }
    }

    /// Whether a drain is pending, i.e. write readiness is still wanted.
    pub fn wants_writable(&self) -> bool {
        self.write.lock().write_interest
    }

    pub fn queued_len(&self) -> usize {
        self.write.lock().bytes.len()
    }

    /// Drops queued output and partial input after a close.
    pub fn clear(&self) {
        let mut queue = self.write.lock();
        queue.bytes.clear();
        queue.write_interest = false;
        *self.codec.lock() = LineCodec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted socket: each read pops one step, writes accept up to `room` bytes.
    struct ScriptedSocket {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        room: usize,
        write_error: Option<io::ErrorKind>,
    }

    impl ScriptedSocket {
        fn new() -> Self {
            Self {
                reads: VecDeque::new(),
                written: Vec::new(),
                room: usize::MAX,
                write_error: None,
            }
        }

        fn then_read(mut self, bytes: &[u8]) -> Self {
            self.reads.push_back(Ok(bytes.to_vec()));
            self
        }

        fn then_fail(mut self, kind: io::ErrorKind) -> Self {
            self.reads.push_back(Err(kind.into()));
            self
        }
    }

    impl Read for ScriptedSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn buffers(write_capacity: usize) -> ConnectionBuffers {
        ConnectionBuffers::new(BufferPool::new(1, 64), write_capacity)
    }

    #[test]
    fn test_pull_returns_complete_lines() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new()
            .then_read(b"ONE tacos\nTWO are good.\nTHREE usua")
            .then_read(b"lly.\n");

        assert_eq!(
            buffers.pull_readable(&mut socket).unwrap(),
            Pulled::Lines(vec!["ONE tacos".into(), "TWO are good.".into()])
        );
        assert_eq!(
            buffers.pull_readable(&mut socket).unwrap(),
            Pulled::Lines(vec!["THREE usually.".into()])
        );
        assert_eq!(buffers.pull_readable(&mut socket).unwrap(), Pulled::Idle);
    }

    #[test]
    fn test_partial_read_yields_empty_lines_batch() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new().then_read(b"no newline yet");
        assert_eq!(
            buffers.pull_readable(&mut socket).unwrap(),
            Pulled::Lines(Vec::new())
        );
    }

    #[test]
    fn test_line_longer_than_scratch_chunk() {
        let buffers = ConnectionBuffers::new(BufferPool::new(1, 4), 1024);
        let mut socket = ScriptedSocket::new()
            .then_read(b"abcd")
            .then_read(b"efgh")
            .then_read(b"ij\n");
        let mut lines = Vec::new();
        while let Pulled::Lines(batch) = buffers.pull_readable(&mut socket).unwrap() {
            lines.extend(batch);
        }
        assert_eq!(lines, vec!["abcdefghij"]);
    }

    #[test]
    fn test_end_of_stream_is_broken() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new().then_read(b"");
        let err = buffers.pull_readable(&mut socket).unwrap_err();
        assert_eq!(err.cause().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_errors_collapse_to_broken() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::Other,
        ] {
            let buffers = buffers(1024);
            let mut socket = ScriptedSocket::new().then_fail(kind);
            assert!(buffers.pull_readable(&mut socket).is_err());
        }
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new()
            .then_fail(io::ErrorKind::Interrupted)
            .then_read(b"ok\n");
        assert_eq!(
            buffers.pull_readable(&mut socket).unwrap(),
            Pulled::Lines(vec!["ok".into()])
        );
    }

    #[test]
    fn test_first_enqueue_requests_write_interest() {
        let buffers = buffers(1024);
        assert_eq!(
            buffers.enqueue_write(b"a\n").unwrap(),
            WriteSignal::RegisterWritable
        );
        assert_eq!(buffers.enqueue_write(b"b\n").unwrap(), WriteSignal::Queued);
        assert_eq!(buffers.queued_len(), 4);
        assert!(buffers.wants_writable());
    }

    #[test]
    fn test_full_drain_clears_interest() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new();
        buffers.enqueue_write(b"hello\n").unwrap();

        assert_eq!(buffers.drain_writable(&mut socket).unwrap(), Drained::Complete);
        assert_eq!(socket.written, b"hello\n");
        assert!(!buffers.wants_writable());
        assert_eq!(
            buffers.enqueue_write(b"again\n").unwrap(),
            WriteSignal::RegisterWritable
        );
    }

    #[test]
    fn test_partial_drain_keeps_remainder() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new();
        socket.room = 3;
        buffers.enqueue_write(b"abcdef").unwrap();

        assert_eq!(buffers.drain_writable(&mut socket).unwrap(), Drained::Partial);
        assert_eq!(socket.written, b"abc");
        assert_eq!(buffers.queued_len(), 3);
        assert_eq!(buffers.enqueue_write(b"g").unwrap(), WriteSignal::Queued);

        socket.room = usize::MAX;
        assert_eq!(buffers.drain_writable(&mut socket).unwrap(), Drained::Complete);
        assert_eq!(socket.written, b"abcdefg");
    }

    #[test]
    fn test_write_failure_is_broken() {
        let buffers = buffers(1024);
        let mut socket = ScriptedSocket::new();
        socket.write_error = Some(io::ErrorKind::BrokenPipe);
        buffers.enqueue_write(b"x\n").unwrap();
        assert!(buffers.drain_writable(&mut socket).is_err());
    }

    #[test]
    fn test_overflow_is_broken_and_queues_nothing() {
        let buffers = buffers(8);
        buffers.enqueue_write(b"12345").unwrap();
        assert!(buffers.enqueue_write(b"6789").is_err());
        assert_eq!(buffers.queued_len(), 5);
    }

    #[test]
    fn test_concurrent_enqueue_keeps_every_byte() {
        use std::sync::Arc;
        use std::thread;

        let buffers = Arc::new(buffers(64 * 1024));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let buffers = Arc::clone(&buffers);
                thread::spawn(move || {
                    for _ in 0..100 {
                        buffers.enqueue_write(b"line\n").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffers.queued_len(), 4 * 100 * 5);
    }
}
