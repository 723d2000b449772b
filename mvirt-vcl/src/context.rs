//! Process context: application registration, worker lifecycle, fork
//! recovery.
//!
//! All state the session layer keeps for a process hangs off one
//! [`VclContext`]. Each thread finds its worker through a thread-local index
//! scoped to the context, and every worker entry point checks the process
//! id first so a forked child never keeps using its parent's registration.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{ForkPolicy, VclConfig};
use crate::control::{
    AttachOptions, AttachRequest, ControlChannel, ControlReply, WorkerAddDelReply,
    WorkerAddDelRequest,
};
use crate::error::{Result, VclError};
use crate::event::VppEventQueueSender;
use crate::segment::SegmentManager;
use crate::session::{AppState, INVALID_VPP_HANDLE, SessionState};
use crate::worker::{ForkOrigin, Worker, WorkerEntry, WorkerRegistry};

/// How long the rx thread blocks per poll of the control channel.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (context id, worker index) of the calling thread's worker.
    static CURRENT_WORKER: Cell<Option<(u64, u32)>> = const { Cell::new(None) };
}

/// Source of the current process id.
pub trait PidSource: Send + Sync {
    fn pid(&self) -> i32;
}

/// The real process id.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPid;

impl PidSource for ProcessPid {
    fn pid(&self) -> i32 {
        nix::unistd::getpid().as_raw()
    }
}

#[derive(Debug, Default)]
struct ApiState {
    app_state: AppState,
    app_index: u32,
    last_retval: i32,
    vpp_event_queues: Vec<VppEventQueueSender>,
    worker_replies: HashMap<u32, WorkerAddDelReply>,
}

/// State written by the rx thread and waited on by registering threads.
#[derive(Debug, Default)]
struct ApiShared {
    state: Mutex<ApiState>,
    changed: Condvar,
}

impl ApiShared {
    fn lock(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_app_state(&self, app_state: AppState) {
        self.lock().app_state = app_state;
        self.changed.notify_all();
    }

    fn apply(&self, reply: ControlReply) {
        let mut st = self.lock();
        match reply {
            ControlReply::EnableDisable { retval } => {
                if retval != 0 {
                    st.last_retval = retval;
                    st.app_state = AppState::Failed;
                } else if st.app_state == AppState::ConnVpp {
                    st.app_state = AppState::Enabled;
                }
            }
            ControlReply::Attach(reply) => {
                if reply.retval != 0 {
                    st.last_retval = reply.retval;
                    st.app_state = AppState::Failed;
                } else {
                    st.app_index = reply.app_index;
                    st.vpp_event_queues = reply.vpp_event_queues;
                    st.app_state = AppState::Attached;
                }
            }
            ControlReply::Detach { retval } => {
                debug!(retval, "Detach acknowledged");
            }
            ControlReply::WorkerAddDel(reply) => {
                if reply.is_add {
                    st.worker_replies.insert(reply.wrk_index, reply);
                } else {
                    debug!(
                        wrk_index = reply.wrk_index,
                        retval = reply.retval,
                        "Worker delete acknowledged"
                    );
                }
            }
        }
        drop(st);
        self.changed.notify_all();
    }

    /// Channel went away: anything still registering can give up.
    fn disconnected(&self) {
        let mut st = self.lock();
        if !matches!(st.app_state, AppState::Ready | AppState::Start) {
            st.app_state = AppState::Failed;
        }
        drop(st);
        self.changed.notify_all();
    }
}

struct RxThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

fn rx_loop(control: Arc<dyn ControlChannel>, api: Arc<ApiShared>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        match control.recv(RX_POLL_INTERVAL) {
            Ok(Some(reply)) => {
                debug!(retval = reply.retval(), "Control reply");
                api.apply(reply);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Control channel receive failed");
                api.disconnected();
                break;
            }
        }
    }
    debug!("Control rx thread stopped");
}

/// Explicit process-wide state for the session layer.
pub struct VclContext {
    id: u64,
    config: VclConfig,
    control: Arc<dyn ControlChannel>,
    pid_source: Arc<dyn PidSource>,
    api: Arc<ApiShared>,
    workers: WorkerRegistry,
    segments: Arc<SegmentManager>,
    rx_thread: Mutex<Option<RxThread>>,
}

impl VclContext {
    pub fn new(
        config: VclConfig,
        control: Arc<dyn ControlChannel>,
        pid_source: Arc<dyn PidSource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(VclContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            workers: WorkerRegistry::new(config.max_workers),
            segments: Arc::new(SegmentManager::new(config.max_segments)),
            config,
            control,
            pid_source,
            api: Arc::new(ApiShared::default()),
            rx_thread: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &VclConfig {
        &self.config
    }

    pub fn segments(&self) -> &Arc<SegmentManager> {
        &self.segments
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub(crate) fn control(&self) -> &Arc<dyn ControlChannel> {
        &self.control
    }

    pub fn app_state(&self) -> AppState {
        self.api.lock().app_state
    }

    pub fn app_index(&self) -> u32 {
        self.api.lock().app_index
    }

    /// Connect to the dataplane, attach, and register the calling thread as
    /// the first worker.
    pub fn app_create(&self, name: &str) -> Result<()> {
        if self.app_state() != AppState::Start {
            return Err(VclError::InvalidArgument(
                "application already created".to_string(),
            ));
        }
        info!(app_name = name, "Creating application");

        self.control.connect(name)?;
        self.api.set_app_state(AppState::ConnVpp);
        self.spawn_rx_thread()?;

        self.control.enable_disable(true)?;
        self.wait_for_app_state_change(AppState::Enabled, "enable")?;

        let entry = self.worker_alloc_and_init()?;
        let request = AttachRequest {
            name: name.to_string(),
            namespace_id: self.config.namespace_id.clone(),
            namespace_secret: self.config.namespace_secret,
            options: self.attach_options(),
            mq: entry.mq.clone(),
        };
        let attached = self
            .control
            .attach(request)
            .map_err(VclError::from)
            .and_then(|()| self.wait_for_app_state_change(AppState::Attached, "attach"));
        if let Err(e) = attached {
            error!(app_name = name, error = %e, "Attach failed");
            self.worker_cleanup(&entry, false);
            return Err(e);
        }

        let vpp_event_queues = self.api.lock().vpp_event_queues.clone();
        {
            let mut wrk = entry.lock();
            wrk.vpp_wrk_index = 0;
            wrk.vpp_event_queues = vpp_event_queues;
            wrk.state = AppState::Ready;
        }
        self.api.set_app_state(AppState::Ready);
        info!(
            app_name = name,
            app_index = self.app_index(),
            "Application ready"
        );
        Ok(())
    }

    /// Close the current worker's sessions, detach and stop the rx thread.
    pub fn app_destroy(&self) {
        if let Ok(entry) = self.current_worker() {
            let handles: Vec<_> = {
                let wrk = entry.lock();
                wrk.session_indices()
                    .into_iter()
                    .map(|idx| wrk.session_handle(idx))
                    .collect()
            };
            for handle in handles {
                if let Err(e) = self.session_close(handle) {
                    debug!(%handle, error = %e, "Close during teardown failed");
                }
            }
        }
        if self.app_state() != AppState::Start
            && let Err(e) = self.control.detach()
        {
            warn!(error = %e, "Detach failed");
        }
        for wrk_index in self.workers.indices() {
            if let Some(entry) = self.workers.unregister(wrk_index) {
                self.forget_current(&entry);
            }
        }
        self.stop_rx_thread();
        self.control.disconnect();
        *self.api.lock() = ApiState::default();
        self.api.changed.notify_all();
        info!("Application destroyed");
    }

    fn attach_options(&self) -> AttachOptions {
        let c = &self.config;
        AttachOptions {
            segment_size: c.segment_size,
            add_segment_size: c.add_segment_size,
            rx_fifo_size: c.rx_fifo_size,
            tx_fifo_size: c.tx_fifo_size,
            event_queue_size: c.event_queue_size,
            preallocated_fifo_pairs: c.preallocated_fifo_pairs,
            scope_local: c.app_scope_local,
            scope_global: c.app_scope_global,
            proxy_transport_tcp: c.app_proxy_transport_tcp,
            proxy_transport_udp: c.app_proxy_transport_udp,
            use_mq_eventfd: c.use_mq_eventfd,
        }
    }

    fn spawn_rx_thread(&self) -> Result<()> {
        let mut slot = self.rx_thread.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let control = self.control.clone();
        let api = self.api.clone();
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("vcl-api-rx".to_string())
            .spawn(move || rx_loop(control, api, stop_flag))?;
        *slot = Some(RxThread { handle, stop });
        Ok(())
    }

    fn stop_rx_thread(&self) {
        let rx = self
            .rx_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = rx {
            rx.stop.store(true, Ordering::Release);
            if rx.handle.join().is_err() {
                warn!("Control rx thread panicked");
            }
        }
    }

    /// Block until the app reaches `target`, fails, or the app timeout expires.
    ///
    /// Timeout marks the app FAILED.
    pub fn wait_for_app_state_change(&self, target: AppState, op: &'static str) -> Result<()> {
        let deadline = Instant::now() + self.config.app_timeout();
        let mut st = self.api.lock();
        loop {
            if st.app_state == target {
                return Ok(());
            }
            if st.app_state == AppState::Failed {
                return Err(VclError::rejected(op, st.last_retval));
            }
            let now = Instant::now();
            if now >= deadline {
                st.app_state = AppState::Failed;
                warn!(op, target = %target, "Timed out waiting for dataplane");
                return Err(VclError::TimedOut);
            }
            st = self
                .api
                .changed
                .wait_timeout(st, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn wait_for_worker_reply(&self, wrk_index: u32) -> Result<WorkerAddDelReply> {
        let deadline = Instant::now() + self.config.app_timeout();
        let mut st = self.api.lock();
        loop {
            if let Some(reply) = st.worker_replies.remove(&wrk_index) {
                return Ok(reply);
            }
            if st.app_state == AppState::Failed {
                return Err(VclError::rejected("worker_add", st.last_retval));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(VclError::TimedOut);
            }
            st = self
                .api
                .changed
                .wait_timeout(st, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Allocate a local worker record and bind it to the calling thread.
    pub fn worker_alloc_and_init(&self) -> Result<WorkerEntry> {
        let pid = self.pid_source.pid();
        let entry = self.workers.register(|idx| {
            Worker::new(
                idx,
                &self.config,
                self.segments.clone(),
                self.control.clone(),
                pid,
            )
        })?;
        CURRENT_WORKER.with(|c| c.set(Some((self.id, entry.wrk_index))));
        info!(wrk_index = entry.wrk_index, pid, "Worker allocated");
        Ok(entry)
    }

    /// Register the calling thread as an additional worker.
    ///
    /// Returns the worker index. A thread that already has a worker gets
    /// its existing index back.
    pub fn worker_register_with_vpp(&self) -> Result<u32> {
        if self.app_state() != AppState::Ready {
            return Err(VclError::NotAttached);
        }
        if let Some(idx) = self.current_index() {
            return Ok(idx);
        }
        let entry = self.worker_alloc_and_init()?;
        if let Err(e) = self.add_worker_with_vpp(&entry) {
            self.worker_cleanup(&entry, false);
            return Err(e);
        }
        Ok(entry.wrk_index)
    }

    fn add_worker_with_vpp(&self, entry: &WorkerEntry) -> Result<()> {
        entry.lock().state = AppState::AddingWorker;
        let request = WorkerAddDelRequest {
            is_add: true,
            wrk_index: entry.wrk_index,
            vpp_wrk_index: u32::MAX,
            mq: Some(entry.mq.clone()),
        };
        let reply = self
            .control
            .worker_add_del(request)
            .map_err(VclError::from)
            .and_then(|()| self.wait_for_worker_reply(entry.wrk_index));
        let reply = match reply {
            Ok(reply) if reply.retval == 0 => reply,
            Ok(reply) => {
                entry.lock().state = AppState::Failed;
                return Err(VclError::rejected("worker_add", reply.retval));
            }
            Err(e) => {
                entry.lock().state = AppState::Failed;
                return Err(e);
            }
        };
        let vpp_event_queues = self.api.lock().vpp_event_queues.clone();
        let mut wrk = entry.lock();
        wrk.vpp_wrk_index = reply.vpp_wrk_index;
        wrk.api_client_index = reply.api_client_index;
        wrk.vpp_event_queues = vpp_event_queues;
        wrk.state = AppState::Ready;
        info!(
            wrk_index = wrk.wrk_index,
            vpp_wrk_index = wrk.vpp_wrk_index,
            "Worker registered with dataplane"
        );
        Ok(())
    }

    /// Unregister the calling thread's worker and tell the dataplane.
    pub fn worker_unregister(&self) -> Result<()> {
        let entry = self.current_worker()?;
        self.worker_cleanup(&entry, true);
        Ok(())
    }

    /// Release a worker locally. With `notify`, the dataplane is told on a
    /// best-effort basis.
    pub fn worker_cleanup(&self, entry: &WorkerEntry, notify: bool) {
        let (vpp_wrk_index, forked_child, pid, sessions) = {
            let wrk = entry.lock();
            (
                wrk.vpp_wrk_index,
                wrk.forked_child,
                wrk.current_pid,
                wrk.session_count(),
            )
        };
        if notify {
            let sent = match forked_child {
                Some(_) => self.control.child_worker_del(vpp_wrk_index, pid),
                None => self.control.worker_add_del(WorkerAddDelRequest {
                    is_add: false,
                    wrk_index: entry.wrk_index,
                    vpp_wrk_index,
                    mq: None,
                }),
            };
            if let Err(e) = sent {
                warn!(wrk_index = entry.wrk_index, error = %e, "Worker delete not delivered");
            }
        }
        self.workers.unregister(entry.wrk_index);
        self.forget_current(entry);
        info!(wrk_index = entry.wrk_index, sessions, "Worker released");
    }

    fn current_index(&self) -> Option<u32> {
        CURRENT_WORKER.with(|c| match c.get() {
            Some((ctx, idx)) if ctx == self.id => Some(idx),
            _ => None,
        })
    }

    fn forget_current(&self, entry: &WorkerEntry) {
        if self.current_index() == Some(entry.wrk_index) {
            CURRENT_WORKER.with(|c| c.set(None));
        }
    }

    /// The calling thread's worker, re-registered first if the process forked.
    pub fn current_worker(&self) -> Result<WorkerEntry> {
        let idx = self.current_index().ok_or(VclError::NoWorker)?;
        let entry = self.workers.get(idx)?;
        let pid = self.pid_source.pid();
        let recorded = entry.lock().current_pid;
        if recorded != pid {
            return self.handle_fork(entry, pid);
        }
        Ok(entry)
    }

    /// Run `f` on the calling thread's worker.
    pub fn with_worker<R>(&self, f: impl FnOnce(&mut Worker) -> Result<R>) -> Result<R> {
        let entry = self.current_worker()?;
        let mut wrk = entry.lock();
        f(&mut wrk)
    }

    /// Give a forked child its own worker under the same index.
    ///
    /// The inherited record is dropped without telling the dataplane, which
    /// still routes it to the parent.
    fn handle_fork(&self, inherited: WorkerEntry, pid: i32) -> Result<WorkerEntry> {
        let policy = self.config.fork_policy;
        let wrk_index = inherited.wrk_index;
        let (origin, sessions) = {
            let parent = inherited.lock();
            let origin = ForkOrigin {
                parent_pid: parent.current_pid,
                parent_vpp_wrk_index: parent.vpp_wrk_index,
            };
            let sessions: Vec<_> = match policy {
                ForkPolicy::CloneParent => parent
                    .sessions()
                    .map(|(_, s)| {
                        let ct_mq = s
                            .ct_registration
                            .and_then(|reg| parent.mux().get(reg))
                            .map(|conn| conn.mq.clone());
                        (s.clone(), ct_mq)
                    })
                    .collect(),
                ForkPolicy::Discard => Vec::new(),
            };
            (origin, sessions)
        };
        info!(
            wrk_index,
            parent_pid = origin.parent_pid,
            pid,
            ?policy,
            sessions = sessions.len(),
            "Fork detected, re-registering worker"
        );

        let mut child = Worker::new(
            wrk_index,
            &self.config,
            self.segments.clone(),
            self.control.clone(),
            pid,
        )?;
        child.forked_child = Some(origin);
        for (mut session, ct_mq) in sessions {
            if session.is_listener() {
                session.transition(SessionState::ListenNoMq);
            }
            session.ct_registration = match ct_mq {
                Some(mq) => child.mux.add_evfd(mq).ok(),
                None => None,
            };
            let vpp_handle = session.vpp_handle;
            let is_listener = session.is_listener();
            let index = child.session_restore(session)?;
            if vpp_handle != INVALID_VPP_HANDLE {
                child.table_add_vpp_handle(vpp_handle, index);
            }
            if is_listener {
                child.listen_session_index = Some(index);
            }
        }

        let entry = self.workers.replace(wrk_index, child)?;
        drop(inherited);
        if let Err(e) = self.add_worker_with_vpp(&entry) {
            warn!(wrk_index, pid, error = %e, "Forked child could not re-register, dropping worker");
            self.worker_cleanup(&entry, false);
            return Err(e);
        }
        Ok(entry)
    }
}

impl Drop for VclContext {
    fn drop(&mut self) {
        self.stop_rx_thread();
    }
}

impl std::fmt::Debug for VclContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VclContext")
            .field("id", &self.id)
            .field("app_state", &self.app_state())
            .field("workers", &self.workers.len())
            .field("segments", &self.segments.table().len())
            .finish()
    }
}
