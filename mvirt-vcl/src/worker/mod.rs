//! Worker records.
//!
//! A worker is one thread's registration with the dataplane. It owns a pool
//! of sessions, an inbound event queue and the wait set over it. Only the
//! owning thread touches a worker's sessions; other threads talk to it by
//! sending messages to its queue.

pub mod dispatch;
pub mod registry;

pub use registry::{WorkerEntry, WorkerRegistry};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::{debug, warn};

use crate::config::VclConfig;
use crate::control::ControlChannel;
use crate::error::{Result, VclError};
use crate::event::{
    AppEvent, EventQueue, EventQueueSender, SessionEvent, VclEvent, VclEventKind,
    VppEventQueueSender,
};
use crate::handle::{MAX_SESSIONS_PER_WORKER, SessionHandle};
use crate::messaging::channel;
use crate::multiplexer::MqEpoll;
use crate::pool::Pool;
use crate::segment::SegmentManager;
use crate::session::{AppState, Session, TransportProto};

/// Process a worker was forked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkOrigin {
    pub parent_pid: i32,
    pub parent_vpp_wrk_index: u32,
}

pub struct Worker {
    pub wrk_index: u32,
    /// Worker index as known to the dataplane.
    pub vpp_wrk_index: u32,
    pub api_client_index: u32,
    pub state: AppState,
    sessions: Pool<Session>,
    session_index_by_vpp_handle: HashMap<u64, u32>,
    pub listen_session_index: Option<u32>,
    app_event_queue: Arc<EventQueue>,
    event_sender: EventQueueSender,
    /// Dataplane per-thread queues, indexed by thread.
    pub vpp_event_queues: Vec<VppEventQueueSender>,
    pub(crate) mux: MqEpoll,
    pub(crate) mq_msg_vector: Vec<SessionEvent>,
    /// Events no session claimed yet, retried once on the next cycle.
    pub(crate) unhandled_evts: VecDeque<SessionEvent>,
    pub(crate) pending_session_wrk_updates: Vec<u32>,
    app_events: VecDeque<VclEvent>,
    pub thread_id: ThreadId,
    pub current_pid: i32,
    pub forked_child: Option<ForkOrigin>,
    pub(crate) segments: Arc<SegmentManager>,
    pub(crate) control: Arc<dyn ControlChannel>,
}

impl Worker {
    pub fn new(
        wrk_index: u32,
        config: &VclConfig,
        segments: Arc<SegmentManager>,
        control: Arc<dyn ControlChannel>,
        pid: i32,
    ) -> Result<Self> {
        let (inbox, sender) = channel(config.event_queue_size as usize)?;
        let inbox = Arc::new(inbox);
        let mux = MqEpoll::new(
            inbox.clone(),
            config.use_mq_eventfd,
            config.event_queue_size.clamp(1, 1024) as usize,
        )?;
        Ok(Worker {
            wrk_index,
            vpp_wrk_index: u32::MAX,
            api_client_index: u32::MAX,
            state: AppState::Start,
            sessions: Pool::with_capacity_limit(MAX_SESSIONS_PER_WORKER),
            session_index_by_vpp_handle: HashMap::new(),
            listen_session_index: None,
            app_event_queue: inbox,
            event_sender: sender,
            vpp_event_queues: Vec::new(),
            mux,
            mq_msg_vector: Vec::with_capacity(64),
            unhandled_evts: VecDeque::new(),
            pending_session_wrk_updates: Vec::new(),
            app_events: VecDeque::new(),
            thread_id: std::thread::current().id(),
            current_pid: pid,
            forked_child: None,
            segments,
            control,
        })
    }

    /// Sender for this worker's inbound queue.
    pub fn event_sender(&self) -> EventQueueSender {
        self.event_sender.clone()
    }

    pub fn app_event_queue(&self) -> &Arc<EventQueue> {
        &self.app_event_queue
    }

    pub fn mux(&self) -> &MqEpoll {
        &self.mux
    }

    /// Allocate a session in START state.
    pub fn session_alloc(&mut self, proto: TransportProto) -> Result<u32> {
        let wrk_index = self.wrk_index;
        let index = self
            .sessions
            .insert_with(|idx| Session::new(idx, wrk_index, proto))
            .ok_or(VclError::PoolExhausted)?;
        debug!(wrk_index, session_index = index, ?proto, "Allocated session");
        Ok(index)
    }

    /// Insert a session record built elsewhere (migration, fork).
    pub(crate) fn session_adopt(&mut self, mut session: Session) -> Result<u32> {
        let wrk_index = self.wrk_index;
        let index = self
            .sessions
            .insert_with(move |idx| {
                session.session_index = idx;
                session.wrk_index = wrk_index;
                session
            })
            .ok_or(VclError::PoolExhausted)?;
        Ok(index)
    }

    /// Reinsert a session under its existing index, so handles stay valid.
    pub(crate) fn session_restore(&mut self, mut session: Session) -> Result<u32> {
        let index = session.session_index;
        session.wrk_index = self.wrk_index;
        self.sessions
            .insert_at(index, session)
            .map_err(|_| VclError::InvalidHandle(index))?;
        Ok(index)
    }

    /// Release a session slot and any handle-table entry pointing at it.
    pub fn session_free(&mut self, session_index: u32) -> Option<Session> {
        let session = self.sessions.remove(session_index)?;
        if self
            .session_index_by_vpp_handle
            .get(&session.vpp_handle)
            .is_some_and(|idx| *idx == session_index)
        {
            self.session_index_by_vpp_handle.remove(&session.vpp_handle);
        }
        if self.listen_session_index == Some(session_index) {
            self.listen_session_index = None;
        }
        debug!(
            wrk_index = self.wrk_index,
            session_index,
            state = %session.state,
            "Freed session"
        );
        Some(session)
    }

    pub fn session_get(&self, session_index: u32) -> Option<&Session> {
        self.sessions.get(session_index)
    }

    pub fn session_get_mut(&mut self, session_index: u32) -> Option<&mut Session> {
        self.sessions.get_mut(session_index)
    }

    /// Handle for a session in this worker's pool.
    pub fn session_handle(&self, session_index: u32) -> SessionHandle {
        // Pool capacity and the worker limit keep both parts in range.
        SessionHandle::new(self.wrk_index, session_index)
            .unwrap_or(SessionHandle::from_raw(u32::MAX))
    }

    fn check_handle(&self, handle: SessionHandle) -> Result<u32> {
        let (wrk_index, session_index) = handle.parse();
        if wrk_index != self.wrk_index {
            return Err(VclError::ForeignHandle {
                handle: handle.raw(),
                owner: wrk_index,
                current: self.wrk_index,
            });
        }
        if self.sessions.is_free_index(session_index) {
            return Err(VclError::InvalidHandle(handle.raw()));
        }
        Ok(session_index)
    }

    /// Resolve a handle, rejecting handles owned by other workers.
    pub fn session_get_w_handle(&self, handle: SessionHandle) -> Result<&Session> {
        let index = self.check_handle(handle)?;
        self.sessions
            .get(index)
            .ok_or(VclError::InvalidHandle(handle.raw()))
    }

    pub fn session_get_w_handle_mut(&mut self, handle: SessionHandle) -> Result<&mut Session> {
        let index = self.check_handle(handle)?;
        self.sessions
            .get_mut(index)
            .ok_or(VclError::InvalidHandle(handle.raw()))
    }

    pub fn table_add_vpp_handle(&mut self, vpp_handle: u64, session_index: u32) {
        self.session_index_by_vpp_handle
            .insert(vpp_handle, session_index);
    }

    pub fn table_del_vpp_handle(&mut self, vpp_handle: u64) -> Option<u32> {
        self.session_index_by_vpp_handle.remove(&vpp_handle)
    }

    pub fn table_lookup_vpp_handle(&self, vpp_handle: u64) -> Option<u32> {
        self.session_index_by_vpp_handle.get(&vpp_handle).copied()
    }

    pub fn get_w_vpp_handle(&mut self, vpp_handle: u64) -> Result<&mut Session> {
        let index = self
            .table_lookup_vpp_handle(vpp_handle)
            .ok_or(VclError::UnknownVppHandle(vpp_handle))?;
        self.sessions
            .get_mut(index)
            .ok_or(VclError::UnknownVppHandle(vpp_handle))
    }

    /// Resolve a listener by dataplane handle. Non-listeners are rejected.
    pub fn lookup_listener(&mut self, listener_handle: u64) -> Result<&mut Session> {
        let session = self.get_w_vpp_handle(listener_handle)?;
        if !session.is_listener() {
            return Err(VclError::NotListener(session.session_index));
        }
        Ok(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_indices(&self) -> Vec<u32> {
        self.sessions.indices()
    }

    pub fn sessions(&self) -> impl Iterator<Item = (u32, &Session)> {
        self.sessions.iter()
    }

    /// Notify a dataplane thread. Best effort; failures are logged.
    pub fn send_to_vpp(&self, vpp_thread_index: u32, event: AppEvent) {
        match self.vpp_event_queues.get(vpp_thread_index as usize) {
            Some(q) => {
                if let Err(e) = q.send(event) {
                    warn!(
                        wrk_index = self.wrk_index,
                        vpp_thread_index,
                        error = %e,
                        "Dropped notification to dataplane"
                    );
                }
            }
            None => debug!(
                wrk_index = self.wrk_index,
                vpp_thread_index, "No dataplane queue for thread"
            ),
        }
    }

    pub(crate) fn push_app_event(&mut self, session_index: u32, kind: VclEventKind) {
        let handle = self.session_handle(session_index);
        self.app_events.push_back(VclEvent { handle, kind });
    }

    /// Take up to `max` notifications collected by dispatch.
    pub fn take_app_events(&mut self, max: usize) -> Vec<VclEvent> {
        let n = max.min(self.app_events.len());
        self.app_events.drain(..n).collect()
    }

    pub fn has_app_events(&self) -> bool {
        !self.app_events.is_empty()
    }

    /// Number of events waiting for a matching session.
    pub fn unhandled_len(&self) -> usize {
        self.unhandled_evts.len()
    }

    pub fn pending_session_wrk_updates(&self) -> &[u32] {
        &self.pending_session_wrk_updates
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("wrk_index", &self.wrk_index)
            .field("vpp_wrk_index", &self.vpp_wrk_index)
            .field("state", &self.state)
            .field("sessions", &self.sessions.len())
            .field("current_pid", &self.current_pid)
            .field("forked_child", &self.forked_child)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::test_util::ScriptedDataplane;

    fn worker(wrk_index: u32) -> Worker {
        let config = VclConfig::default();
        Worker::new(
            wrk_index,
            &config,
            Arc::new(SegmentManager::new(4)),
            ScriptedDataplane::new(),
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_alloc_and_handle() {
        let mut wrk = worker(2);
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        let handle = wrk.session_handle(idx);
        assert_eq!(handle.parse(), (2, idx));
        assert_eq!(wrk.session_get_w_handle(handle).unwrap().session_index, idx);
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let mut wrk = worker(1);
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        let foreign = SessionHandle::new(3, idx).unwrap();
        assert!(matches!(
            wrk.session_get_w_handle(foreign),
            Err(VclError::ForeignHandle {
                owner: 3,
                current: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_freed_handle_invalid() {
        let mut wrk = worker(0);
        let idx = wrk.session_alloc(TransportProto::Udp).unwrap();
        let handle = wrk.session_handle(idx);
        wrk.session_free(idx).unwrap();
        assert!(matches!(
            wrk.session_get_w_handle(handle),
            Err(VclError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_vpp_handle_table_roundtrip() {
        let mut wrk = worker(0);
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        wrk.table_add_vpp_handle(0xfeed, idx);
        assert_eq!(wrk.get_w_vpp_handle(0xfeed).unwrap().session_index, idx);

        assert_eq!(wrk.table_del_vpp_handle(0xfeed), Some(idx));
        assert!(matches!(
            wrk.get_w_vpp_handle(0xfeed),
            Err(VclError::UnknownVppHandle(0xfeed))
        ));
    }

    #[test]
    fn test_lookup_listener_requires_listen_state() {
        let mut wrk = worker(0);
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        wrk.session_get_mut(idx).unwrap().state = SessionState::Accept;
        wrk.table_add_vpp_handle(0x10, idx);

        assert!(wrk.get_w_vpp_handle(0x10).is_ok());
        assert!(matches!(
            wrk.lookup_listener(0x10),
            Err(VclError::NotListener(_))
        ));

        wrk.session_get_mut(idx).unwrap().state = SessionState::ListenNoMq;
        assert!(wrk.lookup_listener(0x10).is_ok());
    }

    #[test]
    fn test_free_clears_handle_table() {
        let mut wrk = worker(0);
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        wrk.session_get_mut(idx).unwrap().vpp_handle = 0x77;
        wrk.table_add_vpp_handle(0x77, idx);
        wrk.session_free(idx);
        assert_eq!(wrk.table_lookup_vpp_handle(0x77), None);
    }
}
