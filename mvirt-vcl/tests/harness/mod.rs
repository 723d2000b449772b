//! Shared setup for session layer integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use mvirt_vcl::test_util::ScriptedDataplane;
use mvirt_vcl::{PidSource, ProcessPid, SessionHandle, TransportProto, VclConfig, VclContext};

/// Process id a test can change to simulate a fork.
#[derive(Debug)]
pub struct FakePid(AtomicI32);

impl FakePid {
    pub fn new(pid: i32) -> Arc<Self> {
        Arc::new(FakePid(AtomicI32::new(pid)))
    }

    pub fn set(&self, pid: i32) {
        self.0.store(pid, Ordering::SeqCst);
    }
}

impl PidSource for FakePid {
    fn pid(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn test_config() -> VclConfig {
    VclConfig {
        app_timeout: 2.0,
        session_timeout: 2.0,
        accept_timeout: 2.0,
        ..Default::default()
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("test address")
}

/// Attached context over a scripted dataplane.
pub fn attached(name: &str) -> (Arc<VclContext>, Arc<ScriptedDataplane>) {
    attached_with(name, test_config(), Arc::new(ProcessPid))
}

pub fn attached_with(
    name: &str,
    config: VclConfig,
    pid: Arc<dyn PidSource>,
) -> (Arc<VclContext>, Arc<ScriptedDataplane>) {
    let _ = tracing_subscriber::fmt::try_init();
    let dp = ScriptedDataplane::new();
    let ctx = VclContext::new(config, dp.clone(), pid).expect("Failed to create context");
    ctx.app_create(name).expect("Failed to attach");
    (ctx, dp)
}

/// Bound and listening TCP session plus its dataplane handle.
pub fn listener(ctx: &VclContext, dp: &ScriptedDataplane, local: &str) -> (SessionHandle, u64) {
    let l = ctx
        .session_create(TransportProto::Tcp, false)
        .expect("Failed to create listener");
    ctx.session_bind(l, addr(local)).expect("Failed to bind");
    ctx.session_listen(l, 0).expect("Failed to listen");
    let vpp_handle = dp
        .listener_handle(l.wrk_index(), l.session_index())
        .expect("Dataplane never bound the listener");
    (l, vpp_handle)
}
