//! Event queue multiplexer.
//!
//! A worker watches its own event queue plus any peer-owned queues it picks
//! up (cut-through sessions). With eventfd notification enabled each queue's
//! eventfd sits in one epoll set and waiting returns the registrations that
//! became readable. Without eventfds the worker sleeps on its own queue and
//! scans the other registrations after every wakeup.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::trace;

use crate::error::{Result, VclError};
use crate::event::EventQueue;
use crate::pool::Pool;

/// Registration index of the worker's own queue.
pub const OWN_QUEUE_REGISTRATION: u32 = 0;

/// Longest sleep on the own queue in poll mode while peer queues are watched.
const PEER_SCAN_INTERVAL: Duration = Duration::from_millis(10);

/// Application-visible wait record.
///
/// Same layout as the kernel's `struct epoll_event`, so callers can hand
/// these straight to `epoll_wait`.
pub type VclEpollEvent = EpollEvent;

const _: () = assert!(
    std::mem::size_of::<VclEpollEvent>() == std::mem::size_of::<nix::libc::epoll_event>()
);
const _: () = assert!(
    std::mem::align_of::<VclEpollEvent>() == std::mem::align_of::<nix::libc::epoll_event>()
);

/// One watched queue.
#[derive(Debug, Clone)]
pub struct MqEvtConn {
    pub mq: Arc<EventQueue>,
    pub fd: RawFd,
}

/// Per-worker wait set over event queues.
pub struct MqEpoll {
    epoll: Option<Epoll>,
    conns: Pool<MqEvtConn>,
    events: Vec<EpollEvent>,
}

impl MqEpoll {
    /// Create a wait set with the worker's own queue at
    /// [`OWN_QUEUE_REGISTRATION`].
    pub fn new(own: Arc<EventQueue>, use_eventfd: bool, max_events: usize) -> Result<Self> {
        let epoll = if use_eventfd {
            Some(Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?)
        } else {
            None
        };
        let mut mux = MqEpoll {
            epoll,
            conns: Pool::with_capacity_limit(u32::MAX),
            events: vec![EpollEvent::empty(); max_events.max(1)],
        };
        let index = mux.add_evfd(own)?;
        debug_assert_eq!(index, OWN_QUEUE_REGISTRATION);
        Ok(mux)
    }

    pub fn uses_eventfd(&self) -> bool {
        self.epoll.is_some()
    }

    /// Start watching `mq`. Returns the registration index.
    pub fn add_evfd(&mut self, mq: Arc<EventQueue>) -> Result<u32> {
        let fd = mq.eventfd_raw();
        let index = self
            .conns
            .insert_with(|_| MqEvtConn { mq: mq.clone(), fd })
            .ok_or(VclError::PoolExhausted)?;
        if let Some(epoll) = &self.epoll {
            let event = EpollEvent::new(EpollFlags::EPOLLIN, index as u64);
            if let Err(e) = epoll.add(mq.eventfd(), event) {
                self.conns.remove(index);
                return Err(e.into());
            }
        }
        trace!(registration = index, fd, "Registered event queue");
        Ok(index)
    }

    /// Stop watching a queue. Unknown or already removed indices are ignored.
    pub fn del_evfd(&mut self, index: u32) -> Result<()> {
        let Some(conn) = self.conns.remove(index) else {
            return Ok(());
        };
        if let Some(epoll) = &self.epoll {
            match epoll.delete(conn.mq.eventfd()) {
                Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
                Err(e) => return Err(e.into()),
            }
        }
        trace!(registration = index, fd = conn.fd, "Deregistered event queue");
        Ok(())
    }

    pub fn get(&self, index: u32) -> Option<&MqEvtConn> {
        self.conns.get(index)
    }

    /// Number of watched queues, the worker's own included.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Wait until at least one queue has messages or `timeout` expires.
    ///
    /// Returns the registration indices with pending messages, empty on
    /// timeout. `None` waits forever.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<u32>> {
        let ready = self.pending();
        if !ready.is_empty() {
            return Ok(ready);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(Vec::new());
                    }
                    Some(d - now)
                }
                None => None,
            };
            let ready = match self.epoll.is_some() {
                true => self.wait_epoll(remaining)?,
                false => self.wait_own(remaining)?,
            };
            if !ready.is_empty() {
                return Ok(ready);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Vec::new());
            }
        }
    }

    fn wait_epoll(&mut self, remaining: Option<Duration>) -> Result<Vec<u32>> {
        let Some(epoll) = &self.epoll else {
            return Ok(Vec::new());
        };
        // Clamp to what EpollTimeout takes directly; the caller loops to the deadline.
        let timeout = match remaining {
            None => EpollTimeout::NONE,
            Some(t) => EpollTimeout::from(t.as_millis().min(u16::MAX as u128) as u16),
        };
        let n = match epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        let mut ready: Vec<u32> = self.events[..n]
            .iter()
            .map(|ev| ev.data() as u32)
            .filter(|idx| self.conns.get(*idx).is_some())
            .collect();
        ready.sort_unstable();
        ready.dedup();
        Ok(ready)
    }

    fn wait_own(&self, remaining: Option<Duration>) -> Result<Vec<u32>> {
        // Peer queues have no wakeup in this mode, so sleep in slices and rescan.
        let slice = if self.conns.len() > 1 {
            Some(remaining.map_or(PEER_SCAN_INTERVAL, |r| r.min(PEER_SCAN_INTERVAL)))
        } else {
            remaining
        };
        if let Some(own) = self.conns.get(OWN_QUEUE_REGISTRATION) {
            own.mq.wait(slice)?;
        }
        Ok(self.pending())
    }

    /// Swap the epoll set for a descriptor that fails every wait.
    #[cfg(test)]
    pub(crate) fn break_epoll(&mut self) -> std::io::Result<()> {
        let file = std::fs::File::open("/dev/null")?;
        self.epoll = Some(Epoll(std::os::fd::OwnedFd::from(file)));
        Ok(())
    }

    /// Registrations whose queue is non-empty right now.
    fn pending(&self) -> Vec<u32> {
        self.conns
            .iter()
            .filter(|(_, c)| !c.mq.is_empty())
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Debug for MqEpoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqEpoll")
            .field("epfd", &self.epoll.as_ref().map(|e| e.0.as_raw_fd()))
            .field("registrations", &self.conns.indices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionEvent;
    use crate::messaging::channel;

    fn queue() -> (Arc<EventQueue>, crate::event::EventQueueSender) {
        let (inbox, outbox) = channel::<SessionEvent>(16).unwrap();
        (Arc::new(inbox), outbox)
    }

    #[test]
    fn test_own_queue_is_first_registration() {
        let (own, _tx) = queue();
        let mux = MqEpoll::new(own, true, 8).unwrap();
        assert!(mux.get(OWN_QUEUE_REGISTRATION).is_some());
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_wait_reports_ready_registration() {
        let (own, _own_tx) = queue();
        let (peer, peer_tx) = queue();
        let mut mux = MqEpoll::new(own, true, 8).unwrap();
        let idx = mux.add_evfd(peer).unwrap();

        assert!(mux.wait(Some(Duration::from_millis(5))).unwrap().is_empty());

        peer_tx.send(SessionEvent::Rx { handle: 1 }).unwrap();
        assert_eq!(mux.wait(Some(Duration::from_secs(1))).unwrap(), vec![idx]);
    }

    #[test]
    fn test_del_evfd_idempotent() {
        let (own, _own_tx) = queue();
        let (peer, _peer_tx) = queue();
        let mut mux = MqEpoll::new(own, true, 8).unwrap();
        let idx = mux.add_evfd(peer).unwrap();
        mux.del_evfd(idx).unwrap();
        mux.del_evfd(idx).unwrap();
        mux.del_evfd(1234).unwrap();
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_queue_torn_down_before_deregistration() {
        let (own, _own_tx) = queue();
        let (peer, _peer_tx) = queue();
        let mut mux = MqEpoll::new(own, true, 8).unwrap();
        let idx = mux.add_evfd(peer.clone()).unwrap();
        drop(peer);
        mux.del_evfd(idx).unwrap();
    }

    #[test]
    fn test_poll_mode_wakes_on_own_queue() {
        let (own, own_tx) = queue();
        let mut mux = MqEpoll::new(own, false, 8).unwrap();
        assert!(!mux.uses_eventfd());

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            own_tx.send(SessionEvent::Tx { handle: 2 }).unwrap();
        });
        assert_eq!(
            mux.wait(Some(Duration::from_secs(5))).unwrap(),
            vec![OWN_QUEUE_REGISTRATION]
        );
        sender.join().unwrap();
    }

    #[test]
    fn test_poll_mode_rescans_peer_queues() {
        let (own, _own_tx) = queue();
        let (peer, peer_tx) = queue();
        let mut mux = MqEpoll::new(own, false, 8).unwrap();
        let idx = mux.add_evfd(peer).unwrap();

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            peer_tx.send(SessionEvent::Rx { handle: 3 }).unwrap();
        });
        // Nothing ever lands on the own queue
        assert_eq!(mux.wait(None).unwrap(), vec![idx]);
        sender.join().unwrap();
    }

    #[test]
    fn test_event_record_layout() {
        let ev = VclEpollEvent::new(EpollFlags::EPOLLIN, 0xdead_beef);
        assert_eq!(ev.data(), 0xdead_beef);
        assert_eq!(
            std::mem::size_of_val(&ev),
            std::mem::size_of::<nix::libc::epoll_event>()
        );
    }
}
