use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        mpsc::{self as channel, TryRecvError},
        Arc,
    },
};

use parking_lot::Mutex;

/// Shared pool of fixed-size scratch buffers for socket reads.
///
/// Every read borrows a buffer for the duration of one `read` call and hands
/// it back on drop, so a server with thousands of idle connections still only
/// owns a handful of read buffers.
#[derive(Clone)]
pub struct BufferPool {
    sender: channel::Sender<Vec<u8>>,
    receiver: Arc<Mutex<channel::Receiver<Vec<u8>>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(initial_size: usize, buffer_size: usize) -> Self {
        let (sender, receiver) = channel::channel();

        for _ in 0..initial_size {
            // the receiver is alive right here
            let _ = sender.send(vec![0; buffer_size]);
        }

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            buffer_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes a buffer from the pool, allocating one if the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = match self.receiver.lock().try_recv() {
            Ok(buffer) => Some(buffer),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        };

        let mut buffer = recycled.unwrap_or_default();
        buffer.resize(self.buffer_size, 0);

        PooledBuffer {
            buffer: Some(buffer),
            pool_sender: self.sender.clone(),
        }
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        let receiver = self.receiver.lock();
        let drained: Vec<Vec<u8>> = receiver.try_iter().collect();
        let count = drained.len();
        for buffer in drained {
            let _ = self.sender.send(buffer);
        }
        count
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

/// A scratch buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool_sender: channel::Sender<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let _ = self.pool_sender.send(buffer);
        }
    }
}
