//! Heap-backed FIFO for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fifo::Fifo;

/// Bounded byte queue standing in for a shared-memory FIFO.
#[derive(Debug)]
pub struct MemFifo {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
    segment_handle: u64,
}

impl MemFifo {
    pub fn new(capacity: usize, segment_handle: u64) -> Arc<Self> {
        Arc::new(MemFifo {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            segment_handle,
        })
    }

    fn buf(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Peer-side enqueue. Returns the number of bytes accepted.
    pub fn push(&self, data: &[u8]) -> usize {
        self.enqueue(data)
    }

    /// Peer-side dequeue of everything queued.
    pub fn drain(&self) -> Vec<u8> {
        self.buf().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Fifo for MemFifo {
    fn max_dequeue(&self) -> usize {
        self.len()
    }

    fn max_enqueue(&self) -> usize {
        self.capacity - self.len()
    }

    fn dequeue(&self, buf: &mut [u8]) -> usize {
        let mut q = self.buf();
        let n = buf.len().min(q.len());
        for (dst, src) in buf.iter_mut().zip(q.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn enqueue(&self, data: &[u8]) -> usize {
        let mut q = self.buf();
        let n = data.len().min(self.capacity - q.len());
        q.extend(&data[..n]);
        n
    }

    fn segment_handle(&self) -> u64 {
        self.segment_handle
    }
}
