//! Messages exchanged with the dataplane over event queues.
//!
//! [`SessionEvent`]s flow from the dataplane (or a sibling worker) into a
//! worker's queue. [`AppEvent`]s flow back on the dataplane's per-thread
//! queues.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::fifo::FifoPair;
use crate::handle::SessionHandle;
use crate::messaging::{Inbox, Outbox};
use crate::session::Session;

/// A worker's inbound queue.
pub type EventQueue = Inbox<SessionEvent>;

/// Sending side of a worker's inbound queue.
pub type EventQueueSender = Outbox<SessionEvent>;

/// Receiving side of a dataplane thread's queue.
pub type VppEventQueue = Inbox<AppEvent>;

/// Sending side of a dataplane thread's queue.
pub type VppEventQueueSender = Outbox<AppEvent>;

/// A peer connected to one of our listeners.
#[derive(Debug)]
pub struct AcceptedMsg {
    pub listener_handle: u64,
    pub handle: u64,
    pub vpp_thread_index: u32,
    pub segment_handle: u64,
    pub fifos: FifoPair,
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
}

/// Co-located peer: FIFOs plus the peer-owned queue to watch.
#[derive(Debug)]
pub struct CutThrough {
    pub fifos: FifoPair,
    pub peer_mq: Arc<EventQueue>,
}

/// Completion of a connect request. `context` is the session index.
#[derive(Debug)]
pub struct ConnectedMsg {
    pub context: u32,
    pub retval: i32,
    pub handle: u64,
    pub vpp_thread_index: u32,
    pub segment_handle: u64,
    pub fifos: Option<FifoPair>,
    pub local: Option<SocketAddr>,
    pub cut_through: Option<CutThrough>,
}

/// Completion of a bind request. `context` is the session index.
#[derive(Debug)]
pub struct BoundMsg {
    pub context: u32,
    pub retval: i32,
    pub handle: u64,
    pub vpp_thread_index: u32,
    pub local: Option<SocketAddr>,
    /// Datagram listeners get FIFOs right away.
    pub fifos: Option<FifoPair>,
    /// False if the listener shares its parent's event queue.
    pub has_listener_mq: bool,
}

/// Dataplane acknowledged moving a session to this worker.
#[derive(Debug)]
pub struct WorkerUpdateReply {
    pub handle: u64,
    pub retval: i32,
    pub wrk_index: u32,
    pub vpp_thread_index: u32,
}

/// New shared segment to map.
#[derive(Debug)]
pub struct MapSegmentMsg {
    pub segment_handle: u64,
    pub name: String,
    pub fd: OwnedFd,
    pub size: usize,
}

/// Events delivered to a worker.
#[derive(Debug)]
pub enum SessionEvent {
    Accepted(AcceptedMsg),
    Connected(ConnectedMsg),
    Bound(BoundMsg),
    Unlistened { handle: u64, retval: i32 },
    /// Peer closed gracefully.
    Disconnected { handle: u64 },
    /// Peer reset the connection.
    Reset { handle: u64 },
    WorkerUpdateReply(WorkerUpdateReply),
    /// Session handed over by a sibling worker.
    Adopt {
        session: Box<Session>,
        /// Cut-through peer queue the session was watching.
        ct_mq: Option<Arc<EventQueue>>,
        from_wrk: u32,
    },
    MapSegment(MapSegmentMsg),
    UnmapSegment { segment_handle: u64 },
    /// Data arrived in a session's rx FIFO.
    Rx { handle: u64 },
    /// Space freed in a session's tx FIFO.
    Tx { handle: u64 },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Accepted(_) => "accepted",
            SessionEvent::Connected(_) => "connected",
            SessionEvent::Bound(_) => "bound",
            SessionEvent::Unlistened { .. } => "unlistened",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::Reset { .. } => "reset",
            SessionEvent::WorkerUpdateReply(_) => "worker_update_reply",
            SessionEvent::Adopt { .. } => "adopt",
            SessionEvent::MapSegment(_) => "map_segment",
            SessionEvent::UnmapSegment { .. } => "unmap_segment",
            SessionEvent::Rx { .. } => "rx",
            SessionEvent::Tx { .. } => "tx",
        }
    }

    /// Dataplane session handle the event refers to, if any.
    pub fn vpp_handle(&self) -> Option<u64> {
        match self {
            SessionEvent::Accepted(m) => Some(m.handle),
            SessionEvent::Connected(m) => Some(m.handle),
            SessionEvent::Bound(m) => Some(m.handle),
            SessionEvent::Unlistened { handle, .. }
            | SessionEvent::Disconnected { handle }
            | SessionEvent::Reset { handle }
            | SessionEvent::Rx { handle }
            | SessionEvent::Tx { handle } => Some(*handle),
            SessionEvent::WorkerUpdateReply(m) => Some(m.handle),
            SessionEvent::Adopt { session, .. } => Some(session.vpp_handle),
            SessionEvent::MapSegment(_) | SessionEvent::UnmapSegment { .. } => None,
        }
    }
}

/// Notifications sent from a worker to a dataplane thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    AcceptedReply { handle: u64, retval: i32 },
    DisconnectedReply { handle: u64, retval: i32 },
    ResetReply { handle: u64, retval: i32 },
    /// Application enqueued data on the session's tx FIFO.
    TxNotify { handle: u64 },
}

/// What happened to a session, as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VclEventKind {
    Connected,
    ConnectFailed,
    /// A listener has a connection waiting to be accepted.
    Accept,
    Readable,
    Writable,
    /// Peer closed gracefully.
    Closing,
    Reset,
    /// Session moved to this worker under a new handle.
    Migrated,
}

/// Notification returned by the worker's wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VclEvent {
    pub handle: SessionHandle,
    pub kind: VclEventKind,
}
