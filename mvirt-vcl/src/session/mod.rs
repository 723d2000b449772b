//! Session records.
//!
//! A session is one logical connection or listener. It lives in the pool of
//! exactly one worker and is only mutated from that worker's thread.

pub mod attr;
pub mod state;

pub use attr::{AttrFlags, SessionAttr, SessionAttrs};
pub use state::{AppState, STATE_LISTEN_ANY, STATE_OPEN, SessionState};

use std::collections::VecDeque;
use std::net::SocketAddr;

use bitflags::bitflags;
use tracing::debug;

use crate::error::{Result, VclError};
use crate::fifo::FifoPair;

/// Sentinel for "no dataplane handle yet".
pub const INVALID_VPP_HANDLE: u64 = u64::MAX;

/// Transport protocol of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportProto {
    #[default]
    Tcp,
    Udp,
    Tls,
}

impl TransportProto {
    /// Datagram sessions accept data without a handshake.
    pub fn is_dgram(self) -> bool {
        matches!(self, TransportProto::Udp)
    }
}

bitflags! {
    /// Flags attached to a queued accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AcceptFlags: u32 {
        /// Peer closed before the application accepted.
        const CLOSED = 1 << 0;
        /// Peer reset before the application accepted.
        const RESET = 1 << 1;
    }
}

/// Payload of a message queued on a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMsgPayload {
    /// A peer connected; the session is already allocated in the worker pool.
    Accepted { session_index: u32, vpp_handle: u64 },
}

/// Message queued on a listener until the application accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMsg {
    pub payload: SessionMsgPayload,
    pub flags: AcceptFlags,
}

impl SessionMsg {
    pub fn accepted(session_index: u32, vpp_handle: u64) -> Self {
        SessionMsg {
            payload: SessionMsgPayload::Accepted {
                session_index,
                vpp_handle,
            },
            flags: AcceptFlags::empty(),
        }
    }

    pub fn vpp_handle(&self) -> u64 {
        match self.payload {
            SessionMsgPayload::Accepted { vpp_handle, .. } => vpp_handle,
        }
    }
}

/// Per-connection bookkeeping mirroring the dataplane's view of a session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Index in the owning worker's pool.
    pub session_index: u32,
    /// Worker owning the pool slot.
    pub wrk_index: u32,
    /// Dataplane handle, [`INVALID_VPP_HANDLE`] until known.
    pub vpp_handle: u64,
    /// Dataplane thread owning the peer side.
    pub vpp_thread_index: u32,
    pub state: SessionState,
    /// Dataplane retval that moved the session to FAILED.
    pub failure_retval: i32,
    /// State to restore once a worker update completes.
    pub pre_update_state: Option<SessionState>,
    pub proto: TransportProto,
    pub fifos: Option<FifoPair>,
    /// Cut-through FIFOs when the peer is co-located.
    pub ct_fifos: Option<FifoPair>,
    /// Multiplexer registration of the cut-through peer queue.
    pub ct_registration: Option<u32>,
    pub attrs: SessionAttrs,
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    pub sndbuf_size: u32,
    pub rcvbuf_size: u32,
    pub user_mss: u32,
    pub transport_opts: u64,
    pub has_rx_evt: bool,
    /// Accepts waiting for the application (listeners only).
    pub accept_evts: VecDeque<SessionMsg>,
    pub backlog: u32,
    /// Listener that spawned this session (accepted sessions only).
    pub listener_index: Option<u32>,
}

impl Session {
    pub fn new(session_index: u32, wrk_index: u32, proto: TransportProto) -> Self {
        Session {
            session_index,
            wrk_index,
            vpp_handle: INVALID_VPP_HANDLE,
            vpp_thread_index: 0,
            state: SessionState::Start,
            failure_retval: 0,
            pre_update_state: None,
            proto,
            fifos: None,
            ct_fifos: None,
            ct_registration: None,
            attrs: SessionAttrs::default(),
            local: None,
            peer: None,
            sndbuf_size: 0,
            rcvbuf_size: 0,
            user_mss: 0,
            transport_opts: 0,
            has_rx_evt: false,
            accept_evts: VecDeque::new(),
            backlog: 0,
            listener_index: None,
        }
    }

    /// Move to `to`, logging the transition.
    pub fn transition(&mut self, to: SessionState) {
        debug!(
            wrk_index = self.wrk_index,
            session_index = self.session_index,
            vpp_handle = %format_args!("{:#x}", self.vpp_handle),
            from = %self.state,
            to = %to,
            "Session state change"
        );
        self.state = to;
    }

    /// Mark the session FAILED with the dataplane's retval.
    pub fn fail(&mut self, retval: i32) {
        self.failure_retval = retval;
        self.transition(SessionState::Failed);
    }

    /// Park the session while it migrates to another worker.
    pub fn begin_update(&mut self) {
        if self.state != SessionState::Updated {
            self.pre_update_state = Some(self.state);
            self.transition(SessionState::Updated);
        }
    }

    /// Apply a peer close or reset (`to`). Returns false if the state does
    /// not allow it.
    ///
    /// Only open or closing sessions move. A session parked for migration
    /// keeps `Updated` and carries `to` over to the state it resumes in.
    pub fn apply_peer_close(&mut self, to: SessionState) -> bool {
        let current = match self.state {
            SessionState::Updated => self.pre_update_state,
            state => Some(state),
        };
        let moves = match current {
            Some(SessionState::Connect | SessionState::Accept) => true,
            Some(SessionState::VppClosing) => to == SessionState::Disconnect,
            _ => false,
        };
        if !moves {
            return false;
        }
        if self.state == SessionState::Updated {
            debug!(
                wrk_index = self.wrk_index,
                session_index = self.session_index,
                to = %to,
                "Peer close while migrating"
            );
            self.pre_update_state = Some(to);
        } else {
            self.transition(to);
        }
        true
    }

    /// Restore the pre-update state after reattachment.
    pub fn finish_update(&mut self) {
        if let Some(prev) = self.pre_update_state.take() {
            self.transition(prev);
        }
    }

    pub fn is_ct(&self) -> bool {
        self.ct_fifos.is_some()
    }

    /// FIFOs used for data transfer, preferring cut-through.
    pub fn data_fifos(&self) -> Option<&FifoPair> {
        self.ct_fifos.as_ref().or(self.fifos.as_ref())
    }

    pub fn is_open(&self) -> bool {
        self.state.intersects(STATE_OPEN)
            || (self.state == SessionState::Listen && self.proto.is_dgram())
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.state,
            SessionState::VppClosing | SessionState::Disconnect
        )
    }

    pub fn is_listener(&self) -> bool {
        self.state.is_listener()
    }

    /// Error for a closing session that has drained its data.
    ///
    /// A reset surfaces as `ConnectionReset`; a graceful close is `Ok`.
    pub fn closing_error(&self) -> Result<()> {
        if self.state == SessionState::Disconnect {
            Err(VclError::ConnectionReset)
        } else {
            Ok(())
        }
    }

    /// Error for an operation on a session that is not open.
    pub fn closed_error(&self) -> VclError {
        if self.state == SessionState::Disconnect {
            VclError::ConnectionReset
        } else {
            VclError::NotConnected
        }
    }

    /// Bytes ready to read, or pending accepts for listeners.
    pub fn read_ready(&self) -> Result<usize> {
        if self.is_listener() {
            return Ok(self.accept_evts.len());
        }
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let ready = self.data_fifos().map_or(0, |f| f.rx.max_dequeue());
        if ready == 0 && self.is_closing() {
            self.closing_error()?;
        }
        Ok(ready)
    }

    /// Free space ready to write.
    pub fn write_ready(&self) -> Result<usize> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        if self.attrs.test(SessionAttr::ShutWr) {
            return Err(VclError::NotConnected);
        }
        Ok(self.data_fifos().map_or(0, |f| f.tx.max_enqueue()))
    }

    /// Mark a pending accept for `vpp_handle` with `flags`.
    ///
    /// Returns true if the listener had such an accept queued.
    pub fn flag_pending_accept(&mut self, vpp_handle: u64, flags: AcceptFlags) -> bool {
        match self
            .accept_evts
            .iter_mut()
            .find(|m| m.vpp_handle() == vpp_handle)
        {
            Some(msg) => {
                msg.flags |= flags;
                true
            }
            None => false,
        }
    }

    /// Drop a pending accept entry, e.g. when its session was freed.
    pub fn remove_pending_accept(&mut self, session_index: u32) {
        self.accept_evts.retain(|m| match m.payload {
            SessionMsgPayload::Accepted {
                session_index: s, ..
            } => s != session_index,
        });
    }
}
