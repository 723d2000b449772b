//! Control channel contract.
//!
//! Requests go out through [`ControlChannel`]; immediate replies come back
//! through [`ControlChannel::recv`], which the context's rx thread polls.
//! Session-level completions (connected, bound, accepted...) arrive later
//! on the worker's event queue instead.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ControlError;
use crate::event::{EventQueueSender, VppEventQueueSender};
use crate::session::TransportProto;

/// Options negotiated at attach time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachOptions {
    pub segment_size: u64,
    pub add_segment_size: u64,
    pub rx_fifo_size: u32,
    pub tx_fifo_size: u32,
    pub event_queue_size: u32,
    pub preallocated_fifo_pairs: u32,
    pub scope_local: bool,
    pub scope_global: bool,
    pub proxy_transport_tcp: bool,
    pub proxy_transport_udp: bool,
    pub use_mq_eventfd: bool,
}

/// Attach the application. `mq` becomes the first worker's event queue.
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub name: String,
    pub namespace_id: String,
    pub namespace_secret: u64,
    pub options: AttachOptions,
    pub mq: EventQueueSender,
}

#[derive(Debug, Clone)]
pub struct WorkerAddDelRequest {
    pub is_add: bool,
    pub wrk_index: u32,
    pub vpp_wrk_index: u32,
    /// Event queue of the new worker. Unset on delete.
    pub mq: Option<EventQueueSender>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub wrk_index: u32,
    /// Echoed back as `ConnectedMsg::context`.
    pub context: u32,
    pub proto: TransportProto,
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub wrk_index: u32,
    /// Echoed back as `BoundMsg::context`.
    pub context: u32,
    pub proto: TransportProto,
    pub local: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWorkerUpdate {
    pub vpp_handle: u64,
    /// Worker giving the session up.
    pub wrk_index: u32,
    /// Worker taking it over.
    pub req_wrk_index: u32,
}

/// Reply to an attach request.
#[derive(Debug)]
pub struct AttachReply {
    pub retval: i32,
    pub app_index: u32,
    /// One queue per dataplane thread, indexed by thread.
    pub vpp_event_queues: Vec<VppEventQueueSender>,
}

/// Reply to a worker add/delete.
#[derive(Debug)]
pub struct WorkerAddDelReply {
    pub retval: i32,
    pub is_add: bool,
    pub wrk_index: u32,
    pub vpp_wrk_index: u32,
    pub api_client_index: u32,
}

/// Synchronous replies to control requests.
#[derive(Debug)]
pub enum ControlReply {
    EnableDisable { retval: i32 },
    Attach(AttachReply),
    Detach { retval: i32 },
    WorkerAddDel(WorkerAddDelReply),
}

impl ControlReply {
    pub fn retval(&self) -> i32 {
        match self {
            ControlReply::EnableDisable { retval } | ControlReply::Detach { retval } => *retval,
            ControlReply::Attach(r) => r.retval,
            ControlReply::WorkerAddDel(r) => r.retval,
        }
    }
}

/// Request/response transport to the dataplane.
///
/// Implementations must tolerate concurrent use from several workers and
/// from the rx thread.
pub trait ControlChannel: Send + Sync {
    /// Open the API connection under `name`.
    fn connect(&self, name: &str) -> Result<(), ControlError>;

    /// Close the API connection.
    fn disconnect(&self);

    fn enable_disable(&self, enable: bool) -> Result<(), ControlError>;

    fn attach(&self, req: AttachRequest) -> Result<(), ControlError>;

    fn detach(&self) -> Result<(), ControlError>;

    fn worker_add_del(&self, req: WorkerAddDelRequest) -> Result<(), ControlError>;

    /// Tell the dataplane a forked child's worker is gone.
    fn child_worker_del(&self, wrk_index: u32, child_pid: i32) -> Result<(), ControlError>;

    fn connect_session(&self, req: ConnectRequest) -> Result<(), ControlError>;

    fn bind(&self, req: BindRequest) -> Result<(), ControlError>;

    fn unbind(&self, wrk_index: u32, vpp_handle: u64) -> Result<(), ControlError>;

    fn disconnect_session(&self, wrk_index: u32, vpp_handle: u64) -> Result<(), ControlError>;

    fn session_worker_update(&self, req: SessionWorkerUpdate) -> Result<(), ControlError>;

    fn tls_cert_add(&self, wrk_index: u32, vpp_handle: u64, cert: &[u8])
    -> Result<(), ControlError>;

    fn tls_key_add(&self, wrk_index: u32, vpp_handle: u64, key: &[u8]) -> Result<(), ControlError>;

    /// Next reply, or `None` if none arrived within `timeout`.
    fn recv(&self, timeout: Duration) -> Result<Option<ControlReply>, ControlError>;
}
