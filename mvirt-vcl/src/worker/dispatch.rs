//! Event dispatch.
//!
//! Drains the worker's queues and applies each event to the session it
//! names. Events that match no session are parked and retried once after
//! the next batch, so a disconnect racing local bookkeeping is not lost.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::{
    AcceptedMsg, AppEvent, BoundMsg, ConnectedMsg, EventQueue, SessionEvent, VclEventKind,
    WorkerUpdateReply,
};
use crate::session::{AcceptFlags, Session, SessionMsg, SessionState};

use super::Worker;

/// Upper bound on messages taken from one queue per cycle.
const MAX_BATCH: usize = 256;

/// Generic failure retval used when rejecting toward the dataplane.
const RETVAL_UNSPECIFIED: i32 = -1;

impl Worker {
    /// Wait up to `timeout` for events and apply them.
    ///
    /// Returns the number of events applied. Zero means the wait timed out
    /// or everything that arrived was parked.
    pub fn wait_and_dispatch(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let ready = if self.unhandled_evts.is_empty() {
            self.mux.wait(timeout)?
        } else {
            // Parked events must get their retry even if nothing new shows up
            self.mux.wait(Some(Duration::ZERO))?
        };
        let carried = std::mem::take(&mut self.unhandled_evts);

        let mut handled = 0;
        for registration in ready {
            let Some(conn) = self.mux.get(registration) else {
                continue;
            };
            let mq = conn.mq.clone();
            let mut batch = std::mem::take(&mut self.mq_msg_vector);
            mq.drain_into(&mut batch, MAX_BATCH);
            for event in batch.drain(..) {
                match self.handle_event(event) {
                    None => handled += 1,
                    Some(event) => self.park_unhandled(event),
                }
            }
            self.mq_msg_vector = batch;
        }

        for event in carried {
            match self.handle_event(event) {
                None => handled += 1,
                Some(event) => self.drop_unhandled(event),
            }
        }
        Ok(handled)
    }

    /// Apply one event. Returns it back if no session matched.
    pub(crate) fn handle_event(&mut self, event: SessionEvent) -> Option<SessionEvent> {
        match event {
            SessionEvent::Accepted(msg) => self.handle_accepted(msg),
            SessionEvent::Connected(msg) => {
                self.handle_connected(msg);
                None
            }
            SessionEvent::Bound(msg) => {
                self.handle_bound(msg);
                None
            }
            SessionEvent::Unlistened { handle, retval } => {
                if retval != 0 {
                    warn!(
                        wrk_index = self.wrk_index,
                        vpp_handle = %format_args!("{handle:#x}"),
                        retval,
                        "Unbind failed"
                    );
                } else {
                    debug!(
                        wrk_index = self.wrk_index,
                        vpp_handle = %format_args!("{handle:#x}"),
                        "Unbind acknowledged"
                    );
                }
                None
            }
            SessionEvent::Disconnected { handle } => self.handle_disconnected(handle),
            SessionEvent::Reset { handle } => self.handle_reset(handle),
            SessionEvent::WorkerUpdateReply(msg) => self.handle_worker_update_reply(msg),
            SessionEvent::Adopt {
                session,
                ct_mq,
                from_wrk,
            } => {
                self.handle_adopt(*session, ct_mq, from_wrk);
                None
            }
            SessionEvent::MapSegment(msg) => {
                if let Err(e) =
                    self.segments
                        .attach(msg.segment_handle, &msg.name, &msg.fd, msg.size)
                {
                    warn!(
                        segment_handle = %format_args!("{:#x}", msg.segment_handle),
                        error = %e,
                        "Failed to map segment"
                    );
                }
                None
            }
            SessionEvent::UnmapSegment { segment_handle } => {
                if let Err(e) = self.segments.detach(segment_handle) {
                    warn!(error = %e, "Failed to unmap segment");
                }
                None
            }
            SessionEvent::Rx { handle } => {
                let Some(index) = self.table_lookup_vpp_handle(handle) else {
                    return Some(SessionEvent::Rx { handle });
                };
                if let Some(session) = self.session_get_mut(index) {
                    session.has_rx_evt = true;
                }
                self.push_app_event(index, VclEventKind::Readable);
                None
            }
            SessionEvent::Tx { handle } => {
                let Some(index) = self.table_lookup_vpp_handle(handle) else {
                    return Some(SessionEvent::Tx { handle });
                };
                self.push_app_event(index, VclEventKind::Writable);
                None
            }
        }
    }

    fn handle_accepted(&mut self, msg: AcceptedMsg) -> Option<SessionEvent> {
        let (listener_index, proto, backlog, queued) = match self.lookup_listener(msg.listener_handle)
        {
            Ok(l) => (l.session_index, l.proto, l.backlog, l.accept_evts.len()),
            Err(_) => return Some(SessionEvent::Accepted(msg)),
        };

        if backlog > 0 && queued >= backlog as usize {
            warn!(
                wrk_index = self.wrk_index,
                listener_index,
                backlog,
                "Listen backlog full, rejecting accept"
            );
            self.reject_accept(&msg);
            return None;
        }
        if !self.segments.is_mapped(msg.segment_handle) {
            warn!(
                wrk_index = self.wrk_index,
                segment_handle = %format_args!("{:#x}", msg.segment_handle),
                "Accepted session in unmapped segment"
            );
            self.reject_accept(&msg);
            return None;
        }

        let index = match self.session_alloc(proto) {
            Ok(index) => index,
            Err(e) => {
                warn!(wrk_index = self.wrk_index, error = %e, "Cannot allocate accepted session");
                self.reject_accept(&msg);
                return None;
            }
        };
        let session = self.session_get_mut(index)?;
        session.vpp_handle = msg.handle;
        session.vpp_thread_index = msg.vpp_thread_index;
        session.fifos = Some(msg.fifos);
        session.local = msg.local;
        session.peer = msg.peer;
        session.listener_index = Some(listener_index);
        session.transition(SessionState::Accept);
        self.table_add_vpp_handle(msg.handle, index);

        let listener = self.session_get_mut(listener_index)?;
        listener
            .accept_evts
            .push_back(SessionMsg::accepted(index, msg.handle));
        self.push_app_event(listener_index, VclEventKind::Accept);
        debug!(
            wrk_index = self.wrk_index,
            listener_index,
            session_index = index,
            vpp_handle = %format_args!("{:#x}", msg.handle),
            "Queued accept"
        );
        None
    }

    fn reject_accept(&self, msg: &AcceptedMsg) {
        self.send_to_vpp(
            msg.vpp_thread_index,
            AppEvent::AcceptedReply {
                handle: msg.handle,
                retval: RETVAL_UNSPECIFIED,
            },
        );
    }

    fn handle_connected(&mut self, msg: ConnectedMsg) {
        let wrk_index = self.wrk_index;
        let pending = self
            .session_get(msg.context)
            .is_some_and(|s| s.state == SessionState::Start);
        if !pending {
            debug!(
                wrk_index,
                session_index = msg.context,
                "Connect reply for a session no longer waiting"
            );
            if msg.retval == 0
                && let Err(e) = self.control.disconnect_session(wrk_index, msg.handle)
            {
                warn!(wrk_index, error = %e, "Failed to disconnect orphaned session");
            }
            return;
        }

        if msg.retval != 0 {
            if let Some(session) = self.session_get_mut(msg.context) {
                session.fail(msg.retval);
            }
            self.push_app_event(msg.context, VclEventKind::ConnectFailed);
            return;
        }

        if msg.fifos.is_some() && !self.segments.is_mapped(msg.segment_handle) {
            warn!(
                wrk_index,
                session_index = msg.context,
                segment_handle = %format_args!("{:#x}", msg.segment_handle),
                "Connected session in unmapped segment"
            );
            if let Some(session) = self.session_get_mut(msg.context) {
                session.fail(RETVAL_UNSPECIFIED);
            }
            if let Err(e) = self.control.disconnect_session(wrk_index, msg.handle) {
                warn!(wrk_index, error = %e, "Failed to disconnect session in unmapped segment");
            }
            self.push_app_event(msg.context, VclEventKind::ConnectFailed);
            return;
        }

        let (ct_fifos, ct_registration) = match msg.cut_through {
            Some(ct) => match self.mux.add_evfd(ct.peer_mq) {
                Ok(reg) => (Some(ct.fifos), Some(reg)),
                Err(e) => {
                    warn!(wrk_index, error = %e, "Cannot watch cut-through peer queue");
                    (Some(ct.fifos), None)
                }
            },
            None => (None, None),
        };

        let Some(session) = self.session_get_mut(msg.context) else {
            return;
        };
        session.vpp_handle = msg.handle;
        session.vpp_thread_index = msg.vpp_thread_index;
        session.fifos = msg.fifos;
        session.ct_fifos = ct_fifos;
        session.ct_registration = ct_registration;
        if msg.local.is_some() {
            session.local = msg.local;
        }
        session.transition(SessionState::Connect);
        self.table_add_vpp_handle(msg.handle, msg.context);
        self.push_app_event(msg.context, VclEventKind::Connected);
    }

    fn handle_bound(&mut self, msg: BoundMsg) {
        let wrk_index = self.wrk_index;
        let pending = self
            .session_get(msg.context)
            .is_some_and(|s| s.state == SessionState::Start);
        if !pending {
            debug!(
                wrk_index,
                session_index = msg.context,
                "Bind reply for a session no longer waiting"
            );
            if msg.retval == 0
                && let Err(e) = self.control.unbind(wrk_index, msg.handle)
            {
                warn!(wrk_index, error = %e, "Failed to unbind orphaned listener");
            }
            return;
        }

        let Some(session) = self.session_get_mut(msg.context) else {
            return;
        };
        if msg.retval != 0 {
            session.fail(msg.retval);
            return;
        }
        session.vpp_handle = msg.handle;
        session.vpp_thread_index = msg.vpp_thread_index;
        if msg.local.is_some() {
            session.local = msg.local;
        }
        session.fifos = msg.fifos;
        session.transition(if msg.has_listener_mq {
            SessionState::Listen
        } else {
            SessionState::ListenNoMq
        });
        self.table_add_vpp_handle(msg.handle, msg.context);
        self.listen_session_index = Some(msg.context);
        info!(
            wrk_index,
            session_index = msg.context,
            vpp_handle = %format_args!("{:#x}", msg.handle),
            "Listener bound"
        );
    }

    fn handle_disconnected(&mut self, handle: u64) -> Option<SessionEvent> {
        let Some(index) = self.table_lookup_vpp_handle(handle) else {
            return Some(SessionEvent::Disconnected { handle });
        };
        let session = self.session_get_mut(index)?;
        let moved = session.apply_peer_close(SessionState::VppClosing);
        let listener = session.listener_index;
        self.flag_on_listener(listener, handle, AcceptFlags::CLOSED);
        if moved {
            self.push_app_event(index, VclEventKind::Closing);
        }
        None
    }

    fn handle_reset(&mut self, handle: u64) -> Option<SessionEvent> {
        let Some(index) = self.table_lookup_vpp_handle(handle) else {
            return Some(SessionEvent::Reset { handle });
        };
        let session = self.session_get_mut(index)?;
        let moved = session.apply_peer_close(SessionState::Disconnect);
        let listener = session.listener_index;
        let thread = session.vpp_thread_index;
        self.flag_on_listener(listener, handle, AcceptFlags::RESET);
        self.send_to_vpp(thread, AppEvent::ResetReply { handle, retval: 0 });
        if moved {
            self.push_app_event(index, VclEventKind::Reset);
        }
        None
    }

    fn flag_on_listener(&mut self, listener: Option<u32>, handle: u64, flags: AcceptFlags) {
        if let Some(listener) = listener.and_then(|l| self.session_get_mut(l))
            && listener.flag_pending_accept(handle, flags)
        {
            debug!(
                listener_index = listener.session_index,
                vpp_handle = %format_args!("{handle:#x}"),
                ?flags,
                "Flagged pending accept"
            );
        }
    }

    fn handle_adopt(
        &mut self,
        mut session: Session,
        ct_mq: Option<Arc<EventQueue>>,
        from_wrk: u32,
    ) {
        let vpp_handle = session.vpp_handle;
        session.begin_update();
        session.listener_index = None;
        session.ct_registration = match ct_mq {
            Some(mq) => self.mux.add_evfd(mq).ok(),
            None => None,
        };
        let index = match self.session_adopt(session) {
            Ok(index) => index,
            Err(e) => {
                warn!(wrk_index = self.wrk_index, from_wrk, error = %e, "Cannot adopt session");
                return;
            }
        };
        self.table_add_vpp_handle(vpp_handle, index);
        self.pending_session_wrk_updates.push(index);
        debug!(
            wrk_index = self.wrk_index,
            from_wrk,
            session_index = index,
            vpp_handle = %format_args!("{vpp_handle:#x}"),
            "Adopted session"
        );
    }

    fn handle_worker_update_reply(&mut self, msg: WorkerUpdateReply) -> Option<SessionEvent> {
        let index = match self.table_lookup_vpp_handle(msg.handle) {
            Some(index) if self.pending_session_wrk_updates.contains(&index) => index,
            _ => return Some(SessionEvent::WorkerUpdateReply(msg)),
        };
        self.pending_session_wrk_updates.retain(|i| *i != index);
        let session = self.session_get_mut(index)?;
        if msg.retval != 0 {
            session.pre_update_state = None;
            session.fail(msg.retval);
            return None;
        }
        session.vpp_thread_index = msg.vpp_thread_index;
        session.finish_update();
        self.push_app_event(index, VclEventKind::Migrated);
        None
    }

    fn park_unhandled(&mut self, event: SessionEvent) {
        debug!(
            wrk_index = self.wrk_index,
            kind = event.kind(),
            vpp_handle = ?event.vpp_handle(),
            "Parked unmatched event"
        );
        self.unhandled_evts.push_back(event);
    }

    fn drop_unhandled(&self, event: SessionEvent) {
        debug!(
            wrk_index = self.wrk_index,
            kind = event.kind(),
            vpp_handle = ?event.vpp_handle(),
            "Dropped unmatched event"
        );
        if let SessionEvent::Accepted(msg) = &event {
            self.reject_accept(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::VclConfig;
    use crate::event::{CutThrough, EventQueueSender};
    use crate::fifo::FifoPair;
    use crate::messaging::channel;
    use crate::segment::SegmentManager;
    use crate::session::TransportProto;
    use crate::test_util::{MemFifo, ScriptedDataplane, memfd_segment};

    const SEG: u64 = 0x5e9;

    fn worker() -> (Worker, EventQueueSender) {
        let segments = Arc::new(SegmentManager::new(4));
        let fd = memfd_segment("dispatch-test", 4096).unwrap();
        segments.attach(SEG, "dispatch-test", &fd, 4096).unwrap();
        let wrk = Worker::new(
            0,
            &VclConfig::default(),
            segments,
            ScriptedDataplane::new(),
            1,
        )
        .unwrap();
        let tx = wrk.event_sender();
        (wrk, tx)
    }

    fn fifos() -> FifoPair {
        FifoPair::new(MemFifo::new(256, SEG), MemFifo::new(256, SEG))
    }

    fn listener(wrk: &mut Worker, vpp_handle: u64) -> u32 {
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        let s = wrk.session_get_mut(idx).unwrap();
        s.state = SessionState::Listen;
        s.vpp_handle = vpp_handle;
        wrk.table_add_vpp_handle(vpp_handle, idx);
        idx
    }

    fn accepted(listener_handle: u64, handle: u64) -> SessionEvent {
        SessionEvent::Accepted(AcceptedMsg {
            listener_handle,
            handle,
            vpp_thread_index: 0,
            segment_handle: SEG,
            fifos: fifos(),
            local: None,
            peer: None,
        })
    }

    #[test]
    fn test_accept_allocates_session() {
        let (mut wrk, tx) = worker();
        let l = listener(&mut wrk, 0x100);
        tx.send(accepted(0x100, 0x200)).unwrap();

        assert_eq!(wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap(), 1);
        let idx = wrk.table_lookup_vpp_handle(0x200).unwrap();
        let s = wrk.session_get(idx).unwrap();
        assert_eq!(s.state, SessionState::Accept);
        assert_eq!(s.listener_index, Some(l));
        assert_eq!(wrk.session_get(l).unwrap().accept_evts.len(), 1);
    }

    #[test]
    fn test_reset_before_accept_flags_listener() {
        let (mut wrk, tx) = worker();
        let l = listener(&mut wrk, 0x100);
        tx.send(accepted(0x100, 0x200)).unwrap();
        tx.send(SessionEvent::Reset { handle: 0x200 }).unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();

        let msg = &wrk.session_get(l).unwrap().accept_evts[0];
        assert!(msg.flags.contains(AcceptFlags::RESET));
        let idx = wrk.table_lookup_vpp_handle(0x200).unwrap();
        assert_eq!(wrk.session_get(idx).unwrap().state, SessionState::Disconnect);
    }

    #[test]
    fn test_connect_failure_marks_failed() {
        let (mut wrk, tx) = worker();
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        tx.send(SessionEvent::Connected(ConnectedMsg {
            context: idx,
            retval: -110,
            handle: 0,
            vpp_thread_index: 0,
            segment_handle: SEG,
            fifos: None,
            local: None,
            cut_through: None,
        }))
        .unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();

        let s = wrk.session_get(idx).unwrap();
        assert_eq!(s.state, SessionState::Failed);
        assert_eq!(s.failure_retval, -110);
        assert_eq!(
            wrk.take_app_events(8)[0].kind,
            VclEventKind::ConnectFailed
        );
    }

    #[test]
    fn test_connect_in_unmapped_segment_fails() {
        let (mut wrk, tx) = worker();
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        tx.send(SessionEvent::Connected(ConnectedMsg {
            context: idx,
            retval: 0,
            handle: 0x300,
            vpp_thread_index: 0,
            segment_handle: 0xbad,
            fifos: Some(FifoPair::new(MemFifo::new(8, 0xbad), MemFifo::new(8, 0xbad))),
            local: None,
            cut_through: None,
        }))
        .unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(wrk.session_get(idx).unwrap().state, SessionState::Failed);
        assert_eq!(wrk.table_lookup_vpp_handle(0x300), None);
    }

    #[test]
    fn test_cut_through_registers_peer_queue() {
        let (mut wrk, tx) = worker();
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        let (peer_mq, _peer_tx) = channel::<SessionEvent>(8).unwrap();
        tx.send(SessionEvent::Connected(ConnectedMsg {
            context: idx,
            retval: 0,
            handle: 0x400,
            vpp_thread_index: 0,
            segment_handle: SEG,
            fifos: Some(fifos()),
            local: None,
            cut_through: Some(CutThrough {
                fifos: fifos(),
                peer_mq: Arc::new(peer_mq),
            }),
        }))
        .unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();

        let s = wrk.session_get(idx).unwrap();
        assert!(s.is_ct());
        let reg = s.ct_registration.unwrap();
        assert!(wrk.mux().get(reg).is_some());
    }

    #[test]
    fn test_unmatched_event_retried_once() {
        let (mut wrk, tx) = worker();
        tx.send(SessionEvent::Disconnected { handle: 0x900 }).unwrap();
        assert_eq!(wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap(), 0);
        assert_eq!(wrk.unhandled_len(), 1);

        // Session shows up in the next batch; the parked event then applies
        let idx = wrk.session_alloc(TransportProto::Tcp).unwrap();
        wrk.session_get_mut(idx).unwrap().state = SessionState::Connect;
        wrk.table_add_vpp_handle(0x900, idx);
        assert_eq!(wrk.wait_and_dispatch(Some(Duration::from_millis(5))).unwrap(), 1);
        assert_eq!(wrk.session_get(idx).unwrap().state, SessionState::VppClosing);
        assert_eq!(wrk.unhandled_len(), 0);
    }

    #[test]
    fn test_unmatched_event_dropped_after_retry() {
        let (mut wrk, tx) = worker();
        tx.send(SessionEvent::Reset { handle: 0x901 }).unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(wrk.unhandled_len(), 1);
        wrk.wait_and_dispatch(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(wrk.unhandled_len(), 0);
    }

    #[test]
    fn test_parked_events_survive_failed_wait() {
        let (mut wrk, tx) = worker();
        tx.send(SessionEvent::Disconnected { handle: 0x902 }).unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(wrk.unhandled_len(), 1);

        wrk.mux.break_epoll().unwrap();
        assert!(wrk.wait_and_dispatch(Some(Duration::from_millis(5))).is_err());
        assert_eq!(wrk.unhandled_len(), 1);
    }

    #[test]
    fn test_reset_during_migration_survives_update_reply() {
        let (mut wrk, tx) = worker();
        let mut moved = Session::new(4, 1, TransportProto::Tcp);
        moved.vpp_handle = 0xabc;
        moved.state = SessionState::Connect;

        tx.send(SessionEvent::Adopt {
            session: Box::new(moved),
            ct_mq: None,
            from_wrk: 1,
        })
        .unwrap();
        tx.send(SessionEvent::Reset { handle: 0xabc }).unwrap();
        tx.send(SessionEvent::WorkerUpdateReply(WorkerUpdateReply {
            handle: 0xabc,
            retval: 0,
            wrk_index: 0,
            vpp_thread_index: 0,
        }))
        .unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_millis(5))).unwrap();

        let idx = wrk.table_lookup_vpp_handle(0xabc).unwrap();
        assert_eq!(wrk.session_get(idx).unwrap().state, SessionState::Disconnect);
        let kinds: Vec<_> = wrk.take_app_events(8).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&VclEventKind::Reset));
        assert!(kinds.contains(&VclEventKind::Migrated));
    }

    #[test]
    fn test_reset_ignored_for_listener() {
        let (mut wrk, tx) = worker();
        let l = listener(&mut wrk, 0x100);
        tx.send(SessionEvent::Reset { handle: 0x100 }).unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(wrk.session_get(l).unwrap().state, SessionState::Listen);
        assert!(wrk.take_app_events(8).is_empty());
    }

    #[test]
    fn test_update_reply_before_adopt() {
        let (mut wrk, tx) = worker();
        let mut moved = Session::new(7, 1, TransportProto::Tcp);
        moved.vpp_handle = 0xabc;
        moved.state = SessionState::Connect;

        tx.send(SessionEvent::WorkerUpdateReply(WorkerUpdateReply {
            handle: 0xabc,
            retval: 0,
            wrk_index: 0,
            vpp_thread_index: 3,
        }))
        .unwrap();
        tx.send(SessionEvent::Adopt {
            session: Box::new(moved),
            ct_mq: None,
            from_wrk: 1,
        })
        .unwrap();
        wrk.wait_and_dispatch(Some(Duration::from_secs(1))).unwrap();
        let idx = wrk.table_lookup_vpp_handle(0xabc).unwrap();
        assert_eq!(wrk.session_get(idx).unwrap().state, SessionState::Updated);

        // The parked reply matches on the next cycle
        wrk.wait_and_dispatch(Some(Duration::from_millis(5))).unwrap();
        let s = wrk.session_get(idx).unwrap();
        assert_eq!(s.state, SessionState::Connect);
        assert_eq!(s.wrk_index, 0);
        assert_eq!(s.vpp_thread_index, 3);
        assert!(wrk.pending_session_wrk_updates().is_empty());
    }
}
