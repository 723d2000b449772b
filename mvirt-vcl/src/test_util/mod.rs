//! Test utilities: in-memory FIFOs and a scripted dataplane.
//!
//! [`ScriptedDataplane`] implements [`ControlChannel`] in-process. It
//! answers registration requests on its own, completes connects and binds
//! by posting events to the requesting worker's queue, and lets tests
//! inject arbitrary events and inspect what the session layer sent back.

pub mod fifo;

pub use fifo::MemFifo;

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::control::{
    AttachReply, AttachRequest, BindRequest, ConnectRequest, ControlChannel, ControlReply,
    SessionWorkerUpdate, WorkerAddDelReply, WorkerAddDelRequest,
};
use crate::error::ControlError;
use crate::event::{
    AcceptedMsg, AppEvent, BoundMsg, ConnectedMsg, EventQueueSender, MapSegmentMsg, SessionEvent,
    VppEventQueue, WorkerUpdateReply,
};
use crate::fifo::FifoPair;
use crate::messaging::channel;

/// Segment every scripted FIFO lives in.
pub const SCRIPTED_SEGMENT: u64 = 0x5e9_0001;
pub const SCRIPTED_SEGMENT_SIZE: usize = 64 * 1024;
pub const SCRIPTED_FIFO_SIZE: usize = 4096;

/// Create an anonymous memory file of `size` bytes.
pub fn memfd_segment(name: &str, size: usize) -> io::Result<OwnedFd> {
    let name = CString::new(name).map_err(io::Error::other)?;
    // SAFETY: name is a valid NUL-terminated string and the returned fd is
    // owned by nobody else.
    let file = unsafe {
        let fd = nix::libc::memfd_create(name.as_ptr(), nix::libc::MFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        File::from_raw_fd(fd)
    };
    file.set_len(size as u64)?;
    Ok(OwnedFd::from(file))
}

/// A request the session layer issued, as recorded by the dataplane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect(String),
    Disconnect,
    EnableDisable(bool),
    Attach { name: String },
    Detach,
    WorkerAdd { wrk_index: u32 },
    WorkerDel { wrk_index: u32, vpp_wrk_index: u32 },
    ChildWorkerDel { wrk_index: u32, child_pid: i32 },
    ConnectSession(ConnectRequest),
    Bind(BindRequest),
    Unbind { wrk_index: u32, vpp_handle: u64 },
    DisconnectSession { wrk_index: u32, vpp_handle: u64 },
    WorkerUpdate(SessionWorkerUpdate),
    TlsCert { vpp_handle: u64, len: usize },
    TlsKey { vpp_handle: u64, len: usize },
}

/// Dataplane-side view of a session's FIFOs.
///
/// `rx` is what the application reads, so tests push into it; `tx` is what
/// the application writes, so tests drain it.
#[derive(Debug, Clone)]
pub struct PeerFifos {
    pub rx: Arc<MemFifo>,
    pub tx: Arc<MemFifo>,
}

impl PeerFifos {
    fn new() -> Self {
        PeerFifos {
            rx: MemFifo::new(SCRIPTED_FIFO_SIZE, SCRIPTED_SEGMENT),
            tx: MemFifo::new(SCRIPTED_FIFO_SIZE, SCRIPTED_SEGMENT),
        }
    }

    fn pair(&self) -> FifoPair {
        FifoPair::new(self.rx.clone(), self.tx.clone())
    }
}

#[derive(Default)]
struct Script {
    requests: Vec<Request>,
    worker_mqs: HashMap<u32, EventQueueSender>,
    vpp_queues: Vec<VppEventQueue>,
    fifos: HashMap<u64, PeerFifos>,
    /// (wrk_index, context) -> listener handle
    bound: HashMap<(u32, u32), u64>,
    rejects: HashMap<&'static str, i32>,
    next_vpp_wrk_index: u32,
    next_vpp_handle: u64,
    muted: bool,
    manual_completion: bool,
}

/// In-process stand-in for the dataplane's control side.
pub struct ScriptedDataplane {
    script: Mutex<Script>,
    reply_tx: Sender<ControlReply>,
    reply_rx: Receiver<ControlReply>,
}

impl ScriptedDataplane {
    pub fn new() -> Arc<Self> {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        Arc::new(ScriptedDataplane {
            script: Mutex::new(Script {
                next_vpp_handle: 0x1000,
                ..Default::default()
            }),
            reply_tx,
            reply_rx,
        })
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reply(&self, reply: ControlReply) {
        if self.script().muted {
            return;
        }
        let _ = self.reply_tx.send(reply);
    }

    fn record(&self, request: Request) -> Option<i32> {
        let op = match &request {
            Request::EnableDisable(_) => "enable",
            Request::Attach { .. } => "attach",
            Request::WorkerAdd { .. } => "worker_add",
            Request::ConnectSession(_) => "connect",
            Request::Bind(_) => "bind",
            Request::WorkerUpdate(_) => "session_worker_update",
            _ => "",
        };
        let mut script = self.script();
        script.requests.push(request);
        script.rejects.get(op).copied()
    }

    /// Answer `op` ("enable", "attach", "worker_add", "connect", "bind",
    /// "session_worker_update") with `retval` from now on.
    pub fn reject(&self, op: &'static str, retval: i32) {
        self.script().rejects.insert(op, retval);
    }

    /// Stop answering control requests.
    pub fn mute(&self, muted: bool) {
        self.script().muted = muted;
    }

    /// Leave connect and bind completions to the test.
    pub fn manual_completion(&self, manual: bool) {
        self.script().manual_completion = manual;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.script().requests.clone()
    }

    /// Post `event` on worker `wrk_index`'s queue.
    pub fn inject(&self, wrk_index: u32, event: SessionEvent) -> bool {
        let mq = self.script().worker_mqs.get(&wrk_index).cloned();
        mq.is_some_and(|mq| mq.send(event).is_ok())
    }

    /// Handle the dataplane gave the listener bound with `context`.
    pub fn listener_handle(&self, wrk_index: u32, context: u32) -> Option<u64> {
        self.script().bound.get(&(wrk_index, context)).copied()
    }

    pub fn fifos(&self, vpp_handle: u64) -> Option<PeerFifos> {
        self.script().fifos.get(&vpp_handle).cloned()
    }

    fn alloc_session(&self) -> (u64, PeerFifos) {
        let mut script = self.script();
        let handle = script.next_vpp_handle;
        script.next_vpp_handle += 1;
        let fifos = PeerFifos::new();
        script.fifos.insert(handle, fifos.clone());
        (handle, fifos)
    }

    /// A peer connects to `listener_handle` on worker `wrk_index`.
    ///
    /// Returns the new session's dataplane handle.
    pub fn inject_accept(
        &self,
        wrk_index: u32,
        listener_handle: u64,
        peer: SocketAddr,
    ) -> Option<u64> {
        let (handle, fifos) = self.alloc_session();
        let event = SessionEvent::Accepted(AcceptedMsg {
            listener_handle,
            handle,
            vpp_thread_index: 0,
            segment_handle: SCRIPTED_SEGMENT,
            fifos: fifos.pair(),
            local: None,
            peer: Some(peer),
        });
        self.inject(wrk_index, event).then_some(handle)
    }

    /// Drain what the session layer sent to dataplane thread `thread`.
    pub fn vpp_events(&self, thread: usize) -> Vec<AppEvent> {
        let script = self.script();
        let mut events = Vec::new();
        if let Some(q) = script.vpp_queues.get(thread) {
            while let Ok(ev) = q.try_recv() {
                events.push(ev);
            }
        }
        events
    }
}

impl ControlChannel for ScriptedDataplane {
    fn connect(&self, name: &str) -> Result<(), ControlError> {
        self.record(Request::Connect(name.to_string()));
        Ok(())
    }

    fn disconnect(&self) {
        self.record(Request::Disconnect);
    }

    fn enable_disable(&self, enable: bool) -> Result<(), ControlError> {
        let retval = self.record(Request::EnableDisable(enable)).unwrap_or(0);
        self.reply(ControlReply::EnableDisable { retval });
        Ok(())
    }

    fn attach(&self, req: AttachRequest) -> Result<(), ControlError> {
        let retval = self
            .record(Request::Attach {
                name: req.name.clone(),
            })
            .unwrap_or(0);
        if retval != 0 {
            self.reply(ControlReply::Attach(AttachReply {
                retval,
                app_index: 0,
                vpp_event_queues: Vec::new(),
            }));
            return Ok(());
        }

        let (inbox, outbox) =
            channel(1024).map_err(|e| ControlError::Send(e.to_string()))?;
        let fd = memfd_segment("vcl-scripted-seg", SCRIPTED_SEGMENT_SIZE)
            .map_err(|e| ControlError::Send(e.to_string()))?;
        {
            let mut script = self.script();
            script.vpp_queues = vec![inbox];
            script.worker_mqs.insert(0, req.mq.clone());
        }
        let _ = req.mq.send(SessionEvent::MapSegment(MapSegmentMsg {
            segment_handle: SCRIPTED_SEGMENT,
            name: "vcl-scripted-seg".to_string(),
            fd,
            size: SCRIPTED_SEGMENT_SIZE,
        }));
        self.reply(ControlReply::Attach(AttachReply {
            retval: 0,
            app_index: 1,
            vpp_event_queues: vec![outbox],
        }));
        Ok(())
    }

    fn detach(&self) -> Result<(), ControlError> {
        self.record(Request::Detach);
        self.reply(ControlReply::Detach { retval: 0 });
        Ok(())
    }

    fn worker_add_del(&self, req: WorkerAddDelRequest) -> Result<(), ControlError> {
        if !req.is_add {
            self.record(Request::WorkerDel {
                wrk_index: req.wrk_index,
                vpp_wrk_index: req.vpp_wrk_index,
            });
            self.script().worker_mqs.remove(&req.wrk_index);
            self.reply(ControlReply::WorkerAddDel(WorkerAddDelReply {
                retval: 0,
                is_add: false,
                wrk_index: req.wrk_index,
                vpp_wrk_index: req.vpp_wrk_index,
                api_client_index: 0,
            }));
            return Ok(());
        }

        let retval = self
            .record(Request::WorkerAdd {
                wrk_index: req.wrk_index,
            })
            .unwrap_or(0);
        let vpp_wrk_index = {
            let mut script = self.script();
            if retval == 0
                && let Some(mq) = req.mq
            {
                script.worker_mqs.insert(req.wrk_index, mq);
            }
            script.next_vpp_wrk_index += 1;
            script.next_vpp_wrk_index
        };
        self.reply(ControlReply::WorkerAddDel(WorkerAddDelReply {
            retval,
            is_add: true,
            wrk_index: req.wrk_index,
            vpp_wrk_index,
            api_client_index: vpp_wrk_index,
        }));
        Ok(())
    }

    fn child_worker_del(&self, wrk_index: u32, child_pid: i32) -> Result<(), ControlError> {
        self.record(Request::ChildWorkerDel {
            wrk_index,
            child_pid,
        });
        Ok(())
    }

    fn connect_session(&self, req: ConnectRequest) -> Result<(), ControlError> {
        let (wrk_index, context, local) = (req.wrk_index, req.context, req.local);
        let retval = self.record(Request::ConnectSession(req)).unwrap_or(0);
        if self.script().manual_completion {
            return Ok(());
        }
        let event = if retval != 0 {
            ConnectedMsg {
                context,
                retval,
                handle: 0,
                vpp_thread_index: 0,
                segment_handle: 0,
                fifos: None,
                local: None,
                cut_through: None,
            }
        } else {
            let (handle, fifos) = self.alloc_session();
            ConnectedMsg {
                context,
                retval: 0,
                handle,
                vpp_thread_index: 0,
                segment_handle: SCRIPTED_SEGMENT,
                fifos: Some(fifos.pair()),
                local,
                cut_through: None,
            }
        };
        self.inject(wrk_index, SessionEvent::Connected(event));
        Ok(())
    }

    fn bind(&self, req: BindRequest) -> Result<(), ControlError> {
        let (wrk_index, context, local) = (req.wrk_index, req.context, req.local);
        let retval = self.record(Request::Bind(req)).unwrap_or(0);
        if self.script().manual_completion {
            return Ok(());
        }
        let handle = if retval == 0 {
            let (handle, _) = self.alloc_session();
            self.script().bound.insert((wrk_index, context), handle);
            handle
        } else {
            0
        };
        self.inject(
            wrk_index,
            SessionEvent::Bound(BoundMsg {
                context,
                retval,
                handle,
                vpp_thread_index: 0,
                local: Some(local),
                fifos: None,
                has_listener_mq: true,
            }),
        );
        Ok(())
    }

    fn unbind(&self, wrk_index: u32, vpp_handle: u64) -> Result<(), ControlError> {
        self.record(Request::Unbind {
            wrk_index,
            vpp_handle,
        });
        Ok(())
    }

    fn disconnect_session(&self, wrk_index: u32, vpp_handle: u64) -> Result<(), ControlError> {
        self.record(Request::DisconnectSession {
            wrk_index,
            vpp_handle,
        });
        Ok(())
    }

    fn session_worker_update(&self, req: SessionWorkerUpdate) -> Result<(), ControlError> {
        let (vpp_handle, target) = (req.vpp_handle, req.req_wrk_index);
        if let Some(retval) = self.record(Request::WorkerUpdate(req)) {
            return Err(ControlError::Send(format!(
                "session worker update refused ({retval})"
            )));
        }
        self.inject(
            target,
            SessionEvent::WorkerUpdateReply(WorkerUpdateReply {
                handle: vpp_handle,
                retval: 0,
                wrk_index: target,
                vpp_thread_index: 0,
            }),
        );
        Ok(())
    }

    fn tls_cert_add(
        &self,
        _wrk_index: u32,
        vpp_handle: u64,
        cert: &[u8],
    ) -> Result<(), ControlError> {
        self.record(Request::TlsCert {
            vpp_handle,
            len: cert.len(),
        });
        Ok(())
    }

    fn tls_key_add(&self, _wrk_index: u32, vpp_handle: u64, key: &[u8]) -> Result<(), ControlError> {
        self.record(Request::TlsKey {
            vpp_handle,
            len: key.len(),
        });
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<ControlReply>, ControlError> {
        match self.reply_rx.recv_timeout(timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ControlError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfd_segment_has_size() {
        let fd = memfd_segment("memfd-size", 8192).unwrap();
        let file = File::from(fd);
        assert_eq!(file.metadata().unwrap().len(), 8192);
    }

    #[test]
    fn test_rejected_op_replies_with_retval() {
        let dp = ScriptedDataplane::new();
        dp.reject("enable", -5);
        dp.enable_disable(true).unwrap();
        let reply = dp.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(reply.retval(), -5);
        assert_eq!(dp.requests(), vec![Request::EnableDisable(true)]);
    }

    #[test]
    fn test_muted_dataplane_stays_silent() {
        let dp = ScriptedDataplane::new();
        dp.mute(true);
        dp.enable_disable(true).unwrap();
        assert!(dp.recv(Duration::from_millis(10)).unwrap().is_none());
    }
}
