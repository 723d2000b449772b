//! Application-facing session calls.
//!
//! Every call resolves the calling thread's worker (running the fork check),
//! validates the handle against it, and then either works on the session's
//! FIFOs directly or issues a control request and waits for its completion
//! on the worker's queue.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::context::VclContext;
use crate::control::{BindRequest, ConnectRequest, SessionWorkerUpdate};
use crate::error::{Result, VclError};
use crate::event::{AppEvent, SessionEvent, VclEvent};
use crate::handle::SessionHandle;
use crate::session::{
    INVALID_VPP_HANDLE, Session, SessionAttr, SessionMsgPayload, SessionState, TransportProto,
};
use crate::worker::Worker;

/// Dispatch events until `done` holds for the session or `timeout` expires.
fn wait_session(
    wrk: &mut Worker,
    session_index: u32,
    timeout: Duration,
    done: impl Fn(&Session) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let session = wrk
            .session_get(session_index)
            .ok_or(VclError::InvalidHandle(session_index))?;
        if done(session) {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(VclError::TimedOut);
        }
        wrk.wait_and_dispatch(Some(deadline - now))?;
    }
}

fn handle_index(wrk: &Worker, handle: SessionHandle) -> Result<u32> {
    Ok(wrk.session_get_w_handle(handle)?.session_index)
}

impl VclContext {
    /// Allocate a session on the calling thread's worker.
    pub fn session_create(&self, proto: TransportProto, nonblocking: bool) -> Result<SessionHandle> {
        self.with_worker(|wrk| {
            let idx = wrk.session_alloc(proto)?;
            if let Some(s) = wrk.session_get_mut(idx) {
                s.attrs.set_nonblocking(nonblocking);
            }
            Ok(wrk.session_handle(idx))
        })
    }

    /// Record the local endpoint for a later listen or connect.
    pub fn session_bind(&self, handle: SessionHandle, local: SocketAddr) -> Result<()> {
        self.with_worker(|wrk| {
            let s = wrk.session_get_w_handle_mut(handle)?;
            if s.state != SessionState::Start {
                return Err(VclError::InvalidState {
                    expected: "STATE_START",
                    actual: s.state,
                });
            }
            s.local = Some(local);
            debug!(%handle, %local, "Session bound locally");
            Ok(())
        })
    }

    /// Ask the dataplane to listen on the bound endpoint and wait for it.
    pub fn session_listen(&self, handle: SessionHandle, backlog: u32) -> Result<()> {
        let timeout = self.config().session_timeout();
        let default_backlog = self.config().listen_queue_size;
        self.with_worker(|wrk| {
            let wrk_index = wrk.wrk_index;
            let s = wrk.session_get_w_handle_mut(handle)?;
            if s.is_listener() {
                return Ok(());
            }
            if s.state != SessionState::Start {
                return Err(VclError::InvalidState {
                    expected: "STATE_START",
                    actual: s.state,
                });
            }
            let local = s
                .local
                .ok_or_else(|| VclError::InvalidArgument("listen before bind".to_string()))?;
            s.backlog = if backlog == 0 { default_backlog } else { backlog };
            s.attrs.set(SessionAttr::Listen);
            let request = BindRequest {
                wrk_index,
                context: s.session_index,
                proto: s.proto,
                local,
            };
            let idx = s.session_index;
            self.control().bind(request)?;

            wait_session(wrk, idx, timeout, |s| s.state != SessionState::Start)?;
            let s = wrk
                .session_get(idx)
                .ok_or(VclError::InvalidHandle(handle.raw()))?;
            if s.state == SessionState::Failed {
                return Err(VclError::rejected("bind", s.failure_retval));
            }
            info!(%handle, %local, state = %s.state, "Listening");
            Ok(())
        })
    }

    /// Take the next connection queued on a listener.
    ///
    /// Returns the new session's handle and the peer address. A connection
    /// the peer already closed or reset is still handed out; its state
    /// makes the first read fail.
    pub fn session_accept(
        &self,
        listener: SessionHandle,
    ) -> Result<(SessionHandle, Option<SocketAddr>)> {
        let timeout = self.config().accept_timeout();
        self.with_worker(|wrk| {
            let l = wrk.session_get_w_handle(listener)?;
            if !l.is_listener() {
                return Err(VclError::NotListener(listener.raw()));
            }
            let lidx = l.session_index;
            let nonblocking = l.attrs.is_nonblocking();
            if l.accept_evts.is_empty() {
                if nonblocking {
                    return Err(VclError::WouldBlock);
                }
                wait_session(wrk, lidx, timeout, |s| !s.accept_evts.is_empty())?;
            }

            let msg = wrk
                .session_get_mut(lidx)
                .and_then(|l| l.accept_evts.pop_front())
                .ok_or(VclError::WouldBlock)?;
            let SessionMsgPayload::Accepted {
                session_index,
                vpp_handle,
            } = msg.payload;
            let s = wrk
                .session_get_mut(session_index)
                .ok_or(VclError::InvalidHandle(session_index))?;
            s.attrs.set_nonblocking(nonblocking);
            s.attrs.set(SessionAttr::Server);
            let peer = s.peer;
            let thread = s.vpp_thread_index;
            wrk.send_to_vpp(
                thread,
                AppEvent::AcceptedReply {
                    handle: vpp_handle,
                    retval: 0,
                },
            );
            let accepted = wrk.session_handle(session_index);
            debug!(
                %listener,
                %accepted,
                vpp_handle = %format_args!("{vpp_handle:#x}"),
                flags = ?msg.flags,
                "Accepted session"
            );
            Ok((accepted, peer))
        })
    }

    /// Connect to `remote`.
    ///
    /// Non-blocking sessions return right away and report completion as a
    /// `Connected` or `ConnectFailed` event.
    pub fn session_connect(&self, handle: SessionHandle, remote: SocketAddr) -> Result<()> {
        let timeout = self.config().session_timeout();
        self.with_worker(|wrk| {
            let wrk_index = wrk.wrk_index;
            let s = wrk.session_get_w_handle_mut(handle)?;
            if s.is_open() {
                return Err(VclError::AlreadyConnected(handle.raw()));
            }
            if s.state != SessionState::Start {
                return Err(VclError::InvalidState {
                    expected: "STATE_START",
                    actual: s.state,
                });
            }
            s.peer = Some(remote);
            let request = ConnectRequest {
                wrk_index,
                context: s.session_index,
                proto: s.proto,
                remote,
                local: s.local,
            };
            let idx = s.session_index;
            let nonblocking = s.attrs.is_nonblocking();
            self.control().connect_session(request)?;
            if nonblocking {
                return Ok(());
            }

            wait_session(wrk, idx, timeout, |s| s.state != SessionState::Start)?;
            let s = wrk
                .session_get(idx)
                .ok_or(VclError::InvalidHandle(handle.raw()))?;
            if s.state == SessionState::Failed {
                return Err(VclError::rejected("connect", s.failure_retval));
            }
            debug!(%handle, %remote, ct = s.is_ct(), "Connected");
            Ok(())
        })
    }

    /// Read into `buf`. Returns 0 once a gracefully closed peer is drained.
    pub fn session_read(&self, handle: SessionHandle, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.config().session_timeout();
        self.with_worker(|wrk| {
            let idx = handle_index(wrk, handle)?;
            let deadline = Instant::now() + timeout;
            loop {
                let s = wrk
                    .session_get_mut(idx)
                    .ok_or(VclError::InvalidHandle(handle.raw()))?;
                if s.is_listener() {
                    return Err(VclError::InvalidState {
                        expected: "connected session",
                        actual: s.state,
                    });
                }
                if buf.is_empty() {
                    return Ok(0);
                }
                let ready = s.read_ready()?;
                if ready > 0 {
                    let n = match s.data_fifos() {
                        Some(fifos) => fifos.rx.dequeue(buf),
                        None => 0,
                    };
                    if s.data_fifos().is_some_and(|f| f.rx.max_dequeue() == 0) {
                        s.has_rx_evt = false;
                    }
                    return Ok(n);
                }
                if s.is_closing() {
                    s.closing_error()?;
                    return Ok(0);
                }
                if s.attrs.is_nonblocking() {
                    return Err(VclError::WouldBlock);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(VclError::TimedOut);
                }
                wrk.wait_and_dispatch(Some(deadline - now))?;
            }
        })
    }

    /// Write as much of `data` as fits. Returns the number of bytes queued.
    pub fn session_write(&self, handle: SessionHandle, data: &[u8]) -> Result<usize> {
        let timeout = self.config().session_timeout();
        self.with_worker(|wrk| {
            let idx = handle_index(wrk, handle)?;
            let deadline = Instant::now() + timeout;
            loop {
                let s = wrk
                    .session_get(idx)
                    .ok_or(VclError::InvalidHandle(handle.raw()))?;
                if data.is_empty() {
                    return Ok(0);
                }
                let space = s.write_ready()?;
                if space > 0 {
                    let n = match s.data_fifos() {
                        Some(fifos) => fifos.tx.enqueue(data),
                        None => 0,
                    };
                    let (is_ct, vpp_handle, thread) = (s.is_ct(), s.vpp_handle, s.vpp_thread_index);
                    if n > 0 && !is_ct {
                        wrk.send_to_vpp(thread, AppEvent::TxNotify { handle: vpp_handle });
                    }
                    return Ok(n);
                }
                if s.attrs.is_nonblocking() {
                    return Err(VclError::WouldBlock);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(VclError::TimedOut);
                }
                wrk.wait_and_dispatch(Some(deadline - now))?;
            }
        })
    }

    /// Close a session and free its slot.
    ///
    /// Dataplane notification is best effort; the local slot is always
    /// released.
    pub fn session_close(&self, handle: SessionHandle) -> Result<()> {
        self.with_worker(|wrk| {
            let idx = handle_index(wrk, handle)?;
            let pending_accepts: Vec<u32> = wrk
                .session_get(idx)
                .filter(|s| s.is_listener())
                .map(|l| {
                    l.accept_evts
                        .iter()
                        .map(|m| match m.payload {
                            SessionMsgPayload::Accepted { session_index, .. } => session_index,
                        })
                        .collect()
                })
                .unwrap_or_default();
            for child in pending_accepts {
                self.close_local(wrk, child);
            }
            self.close_local(wrk, idx);
            debug!(%handle, "Closed session");
            Ok(())
        })
    }

    fn close_local(&self, wrk: &mut Worker, idx: u32) {
        let Some(s) = wrk.session_get(idx) else {
            return;
        };
        let wrk_index = wrk.wrk_index;
        let (state, vpp_handle, thread) = (s.state, s.vpp_handle, s.vpp_thread_index);
        let (ct_registration, listener_index) = (s.ct_registration, s.listener_index);

        if vpp_handle != INVALID_VPP_HANDLE {
            let sent = match state {
                SessionState::Listen | SessionState::ListenNoMq => {
                    self.control().unbind(wrk_index, vpp_handle)
                }
                SessionState::Connect | SessionState::Accept => {
                    self.control().disconnect_session(wrk_index, vpp_handle)
                }
                SessionState::VppClosing => {
                    wrk.send_to_vpp(
                        thread,
                        AppEvent::DisconnectedReply {
                            handle: vpp_handle,
                            retval: 0,
                        },
                    );
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = sent {
                warn!(
                    wrk_index,
                    session_index = idx,
                    error = %e,
                    "Dataplane not notified of close"
                );
            }
        }

        if let Some(reg) = ct_registration
            && let Err(e) = wrk.mux.del_evfd(reg)
        {
            warn!(wrk_index, registration = reg, error = %e, "Cut-through deregistration failed");
        }
        if let Some(listener) = listener_index.and_then(|l| wrk.session_get_mut(l)) {
            listener.remove_pending_accept(idx);
        }
        if vpp_handle != INVALID_VPP_HANDLE {
            wrk.table_del_vpp_handle(vpp_handle);
        }
        wrk.session_free(idx);
    }

    pub fn session_state(&self, handle: SessionHandle) -> Result<SessionState> {
        self.with_worker(|wrk| Ok(wrk.session_get_w_handle(handle)?.state))
    }

    /// Local and peer endpoints.
    pub fn session_endpoints(
        &self,
        handle: SessionHandle,
    ) -> Result<(Option<SocketAddr>, Option<SocketAddr>)> {
        self.with_worker(|wrk| {
            let s = wrk.session_get_w_handle(handle)?;
            Ok((s.local, s.peer))
        })
    }

    pub fn session_read_ready(&self, handle: SessionHandle) -> Result<usize> {
        self.with_worker(|wrk| wrk.session_get_w_handle(handle)?.read_ready())
    }

    pub fn session_write_ready(&self, handle: SessionHandle) -> Result<usize> {
        self.with_worker(|wrk| wrk.session_get_w_handle(handle)?.write_ready())
    }

    /// Read attribute `id`. Booleans read as 0/1.
    pub fn session_attr_get(&self, handle: SessionHandle, id: u32) -> Result<u32> {
        let attr = SessionAttr::try_from(id)?;
        self.with_worker(|wrk| {
            let s = wrk.session_get_w_handle(handle)?;
            Ok(match attr {
                SessionAttr::Listen => s.is_listener() as u32,
                SessionAttr::CutThru => s.is_ct() as u32,
                _ => s.attrs.get_value(attr),
            })
        })
    }

    /// Write attribute `id`. Listener and cut-through flags are read-only.
    pub fn session_attr_set(&self, handle: SessionHandle, id: u32, value: u32) -> Result<()> {
        let attr = SessionAttr::try_from(id)?;
        if matches!(attr, SessionAttr::Listen | SessionAttr::CutThru) {
            return Err(VclError::InvalidAttribute(id));
        }
        self.with_worker(|wrk| {
            let s = wrk.session_get_w_handle_mut(handle)?;
            s.attrs.set_value(attr, value);
            Ok(())
        })
    }

    /// Wait for session notifications on the calling thread's worker.
    ///
    /// Returns up to `max` events; an empty result means the wait timed out.
    pub fn wait_for_events(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<VclEvent>> {
        self.with_worker(|wrk| {
            let deadline = timeout.map(|t| Instant::now() + t);
            while !wrk.has_app_events() {
                let remaining = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            break;
                        }
                        Some(d - now)
                    }
                    None => None,
                };
                wrk.wait_and_dispatch(remaining)?;
            }
            Ok(wrk.take_app_events(max))
        })
    }

    /// Hand a session to worker `target`.
    ///
    /// The target picks the session up on its next wait and reports it with
    /// a `Migrated` event under a new handle. On error the session stays on
    /// this worker under its old handle.
    pub fn migrate_session(&self, handle: SessionHandle, target: u32) -> Result<()> {
        let target_entry = self.workers().get(target)?;
        self.with_worker(|wrk| {
            if target == wrk.wrk_index {
                return Ok(());
            }
            let wrk_index = wrk.wrk_index;
            let s = wrk.session_get_w_handle(handle)?;
            if !s.is_open() && !s.is_listener() {
                return Err(VclError::InvalidState {
                    expected: "open session",
                    actual: s.state,
                });
            }
            let idx = s.session_index;
            let vpp_handle = s.vpp_handle;
            let ct_registration = s.ct_registration;
            let ct_mq = ct_registration
                .and_then(|reg| wrk.mux().get(reg))
                .map(|conn| conn.mq.clone());

            self.control().session_worker_update(SessionWorkerUpdate {
                vpp_handle,
                wrk_index,
                req_wrk_index: target,
            })?;

            let Some(mut session) = wrk.session_free(idx) else {
                return Err(VclError::InvalidHandle(handle.raw()));
            };
            session.ct_registration = None;
            session.begin_update();
            let adopt = SessionEvent::Adopt {
                session: Box::new(session),
                ct_mq,
                from_wrk: wrk_index,
            };
            if let Err(e) = target_entry.mq.send(adopt) {
                warn!(%handle, target, "Target worker queue full, keeping session");
                if let SessionEvent::Adopt { session, .. } = e.into_inner() {
                    self.restore_migrating(wrk, *session, ct_registration)?;
                }
                if let Err(e) = self.control().session_worker_update(SessionWorkerUpdate {
                    vpp_handle,
                    wrk_index,
                    req_wrk_index: wrk_index,
                }) {
                    warn!(%handle, error = %e, "Failed to return session to this worker");
                }
                return Err(VclError::WouldBlock);
            }

            if let Some(reg) = ct_registration
                && let Err(e) = wrk.mux.del_evfd(reg)
            {
                warn!(wrk_index, registration = reg, error = %e, "Cut-through deregistration failed");
            }
            info!(
                %handle,
                target,
                vpp_handle = %format_args!("{vpp_handle:#x}"),
                "Session handed to worker"
            );
            Ok(())
        })
    }

    /// Put a session that failed to leave back under its old index.
    fn restore_migrating(
        &self,
        wrk: &mut Worker,
        mut session: Session,
        ct_registration: Option<u32>,
    ) -> Result<()> {
        session.finish_update();
        session.ct_registration = ct_registration;
        let vpp_handle = session.vpp_handle;
        let is_listener = session.is_listener();
        let idx = wrk.session_restore(session)?;
        if vpp_handle != INVALID_VPP_HANDLE {
            wrk.table_add_vpp_handle(vpp_handle, idx);
        }
        if is_listener {
            wrk.listen_session_index = Some(idx);
        }
        Ok(())
    }

    /// Provide a certificate for a TLS session.
    pub fn session_tls_cert_add(&self, handle: SessionHandle, cert: &[u8]) -> Result<()> {
        if cert.is_empty() {
            return Err(VclError::InvalidArgument("empty certificate".to_string()));
        }
        self.with_worker(|wrk| {
            let s = wrk.session_get_w_handle(handle)?;
            if s.proto != TransportProto::Tls {
                return Err(VclError::InvalidArgument("not a TLS session".to_string()));
            }
            self.control()
                .tls_cert_add(wrk.wrk_index, s.vpp_handle, cert)?;
            Ok(())
        })
    }

    /// Provide a private key for a TLS session.
    pub fn session_tls_key_add(&self, handle: SessionHandle, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(VclError::InvalidArgument("empty key".to_string()));
        }
        self.with_worker(|wrk| {
            let s = wrk.session_get_w_handle(handle)?;
            if s.proto != TransportProto::Tls {
                return Err(VclError::InvalidArgument("not a TLS session".to_string()));
            }
            self.control().tls_key_add(wrk.wrk_index, s.vpp_handle, key)?;
            Ok(())
        })
    }
}
