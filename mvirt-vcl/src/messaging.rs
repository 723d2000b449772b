//! Message queues with eventfd signaling.
//!
//! Each queue pairs a bounded crossbeam channel with an eventfd so that a
//! worker can sleep in epoll (or poll) until messages arrive.
//!
//! # Example
//!
//! ```ignore
//! use mvirt_vcl::messaging::channel;
//!
//! let (inbox, outbox) = channel::<u32>(64)?;
//! outbox.send(7)?;
//! // woken by inbox.eventfd()
//! let mut batch = Vec::new();
//! inbox.drain_into(&mut batch, 16);
//! ```

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};

/// The receiving end of a queue. Owned by exactly one worker at a time.
pub struct Inbox<T> {
    rx: Receiver<T>,
    eventfd: Arc<EventFd>,
}

/// The sending end of a queue. Sending signals the receiver's eventfd.
pub struct Outbox<T> {
    tx: Sender<T>,
    eventfd: Arc<EventFd>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Outbox {
            tx: self.tx.clone(),
            eventfd: self.eventfd.clone(),
        }
    }
}

/// Create a queue holding at most `capacity` messages.
pub fn channel<T>(capacity: usize) -> std::io::Result<(Inbox<T>, Outbox<T>)> {
    let eventfd = Arc::new(
        EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(std::io::Error::from)?,
    );
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    Ok((
        Inbox {
            rx,
            eventfd: eventfd.clone(),
        },
        Outbox { tx, eventfd },
    ))
}

impl<T> Inbox<T> {
    /// Eventfd to register with epoll.
    pub fn eventfd(&self) -> BorrowedFd<'_> {
        self.eventfd.as_fd()
    }

    pub fn eventfd_raw(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    /// Move up to `max` queued messages into `buf`. Returns the count moved.
    pub fn drain_into(&self, buf: &mut Vec<T>, max: usize) -> usize {
        // Reset the counter first so a send racing with the drain re-arms it.
        let _ = self.eventfd.read();
        let before = buf.len();
        while buf.len() - before < max {
            match self.rx.try_recv() {
                Ok(msg) => buf.push(msg),
                Err(_) => break,
            }
        }
        if !self.rx.is_empty() {
            let _ = self.eventfd.write(1);
        }
        buf.len() - before
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Block until the queue is signaled or `timeout` expires.
    ///
    /// Returns true if signaled. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> std::io::Result<bool> {
        if !self.rx.is_empty() {
            return Ok(true);
        }
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(t) => PollTimeout::try_from(t.as_millis().min(i32::MAX as u128) as u64)
                .unwrap_or(PollTimeout::NONE),
        };
        let mut fds = [PollFd::new(self.eventfd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(n) => Ok(n > 0 || !self.rx.is_empty()),
            Err(nix::errno::Errno::EINTR) => Ok(!self.rx.is_empty()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<T> Outbox<T> {
    /// Queue a message and signal the receiver.
    ///
    /// Fails if the queue is full or the receiver is gone.
    pub fn send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(msg)?;
        self.signal();
        Ok(())
    }

    /// Signal the receiver without sending a message.
    pub fn signal(&self) {
        // Ignore errors - counter overflow means the receiver is already awake
        let _ = self.eventfd.write(1);
    }

    /// True if both ends refer to the same queue.
    pub fn same_queue(&self, other: &Outbox<T>) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl<T> std::fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("eventfd", &self.eventfd.as_raw_fd())
            .field("len", &self.rx.len())
            .finish()
    }
}

impl<T> std::fmt::Debug for Outbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("eventfd", &self.eventfd.as_raw_fd())
            .finish()
    }
}
