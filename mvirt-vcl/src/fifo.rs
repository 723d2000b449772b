//! FIFO ownership references.
//!
//! The byte queue itself lives in a shared segment and is implemented by the
//! dataplane side. Sessions only hold references to it.

use std::fmt;
use std::sync::Arc;

/// Shared-memory byte queue as seen from the application side.
pub trait Fifo: Send + Sync {
    /// Bytes available to dequeue.
    fn max_dequeue(&self) -> usize;

    /// Free space available to enqueue.
    fn max_enqueue(&self) -> usize;

    /// Copy up to `buf.len()` bytes out of the FIFO.
    fn dequeue(&self, buf: &mut [u8]) -> usize;

    /// Copy as much of `data` as fits into the FIFO.
    fn enqueue(&self, data: &[u8]) -> usize;

    /// Segment this FIFO was allocated from.
    fn segment_handle(&self) -> u64;
}

/// Shared reference to a FIFO.
pub type FifoRef = Arc<dyn Fifo>;

/// Receive/transmit FIFO pair owned by a session.
#[derive(Clone)]
pub struct FifoPair {
    pub rx: FifoRef,
    pub tx: FifoRef,
}

impl FifoPair {
    pub fn new(rx: FifoRef, tx: FifoRef) -> Self {
        FifoPair { rx, tx }
    }

    /// Segment handle both FIFOs must live in.
    pub fn segment_handle(&self) -> u64 {
        self.rx.segment_handle()
    }
}

impl fmt::Debug for FifoPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoPair")
            .field("segment_handle", &format_args!("{:#x}", self.segment_handle()))
            .field("rx_ready", &self.rx.max_dequeue())
            .field("tx_space", &self.tx.max_enqueue())
            .finish()
    }
}
