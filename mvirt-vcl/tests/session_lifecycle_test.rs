mod harness;

use std::time::Duration;

use harness::{addr, attached, listener};
use mvirt_vcl::event::{AppEvent, SessionEvent};
use mvirt_vcl::test_util::Request;
use mvirt_vcl::{SessionAttr, SessionState, TransportProto, VclError, VclEvent, VclEventKind};

const WAIT: Option<Duration> = Some(Duration::from_secs(1));

#[test]
fn test_accept_read_reset_close() {
    let (ctx, dp) = attached("lifecycle");
    let (l, l_vpp) = listener(&ctx, &dp, "127.0.0.1:8080");
    assert_eq!(ctx.session_state(l).unwrap(), SessionState::Listen);

    let peer = addr("10.0.0.7:40000");
    let vpp_handle = dp.inject_accept(0, l_vpp, peer).unwrap();
    let events = ctx.wait_for_events(16, WAIT).unwrap();
    assert!(events.contains(&VclEvent {
        handle: l,
        kind: VclEventKind::Accept
    }));
    assert_eq!(ctx.session_read_ready(l).unwrap(), 1);

    let (s, from) = ctx.session_accept(l).unwrap();
    assert_eq!(s.wrk_index(), 0);
    assert_eq!(from, Some(peer));
    assert_eq!(ctx.session_state(s).unwrap(), SessionState::Accept);
    assert!(dp.vpp_events(0).contains(&AppEvent::AcceptedReply {
        handle: vpp_handle,
        retval: 0
    }));

    let fifos = dp.fifos(vpp_handle).unwrap();
    fifos.rx.push(b"hello");
    let mut buf = [0u8; 16];
    assert_eq!(ctx.session_read(s, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    assert_eq!(ctx.session_write(s, b"world").unwrap(), 5);
    assert_eq!(fifos.tx.drain(), b"world");
    assert!(dp
        .vpp_events(0)
        .contains(&AppEvent::TxNotify { handle: vpp_handle }));

    assert!(dp.inject(0, SessionEvent::Reset { handle: vpp_handle }));
    let events = ctx.wait_for_events(16, WAIT).unwrap();
    assert_eq!(
        events,
        vec![VclEvent {
            handle: s,
            kind: VclEventKind::Reset
        }]
    );
    assert!(matches!(
        ctx.session_read(s, &mut buf),
        Err(VclError::ConnectionReset)
    ));
    assert!(dp.vpp_events(0).contains(&AppEvent::ResetReply {
        handle: vpp_handle,
        retval: 0
    }));

    ctx.session_close(s).unwrap();
    assert!(matches!(
        ctx.session_state(s),
        Err(VclError::InvalidHandle(_))
    ));
    let entry = ctx.workers().get(0).unwrap();
    assert_eq!(entry.lock().table_lookup_vpp_handle(vpp_handle), None);
    drop(entry);

    ctx.session_close(l).unwrap();
    assert!(dp.requests().contains(&Request::Unbind {
        wrk_index: 0,
        vpp_handle: l_vpp
    }));
    ctx.app_destroy();
}

#[test]
fn test_graceful_close_drains_then_eof() {
    let (ctx, dp) = attached("graceful");
    let (l, l_vpp) = listener(&ctx, &dp, "127.0.0.1:8081");
    let vpp_handle = dp.inject_accept(0, l_vpp, addr("10.0.0.8:1234")).unwrap();
    let (s, _) = ctx.session_accept(l).unwrap();

    dp.fifos(vpp_handle).unwrap().rx.push(b"bye");
    assert!(dp.inject(0, SessionEvent::Disconnected { handle: vpp_handle }));
    let events = ctx.wait_for_events(16, WAIT).unwrap();
    assert!(events.contains(&VclEvent {
        handle: s,
        kind: VclEventKind::Closing
    }));
    assert_eq!(ctx.session_state(s).unwrap(), SessionState::VppClosing);

    let mut buf = [0u8; 8];
    assert_eq!(ctx.session_read(s, &mut buf).unwrap(), 3);
    assert_eq!(ctx.session_read(s, &mut buf).unwrap(), 0);

    dp.vpp_events(0);
    ctx.session_close(s).unwrap();
    assert_eq!(
        dp.vpp_events(0),
        vec![AppEvent::DisconnectedReply {
            handle: vpp_handle,
            retval: 0
        }]
    );
}

#[test]
fn test_accept_of_peer_closed_session() {
    let (ctx, dp) = attached("closed-before-accept");
    let (l, l_vpp) = listener(&ctx, &dp, "127.0.0.1:8082");
    let vpp_handle = dp.inject_accept(0, l_vpp, addr("10.0.0.9:1")).unwrap();
    assert!(dp.inject(0, SessionEvent::Reset { handle: vpp_handle }));
    ctx.wait_for_events(16, WAIT).unwrap();

    let (s, _) = ctx.session_accept(l).unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(
        ctx.session_read(s, &mut buf),
        Err(VclError::ConnectionReset)
    ));
}

#[test]
fn test_nonblocking_accept_and_read() {
    let (ctx, dp) = attached("nonblocking");
    let (l, l_vpp) = listener(&ctx, &dp, "127.0.0.1:8083");
    ctx.session_attr_set(l, SessionAttr::NonBlock as u32, 1)
        .unwrap();
    assert!(matches!(ctx.session_accept(l), Err(VclError::WouldBlock)));

    dp.inject_accept(0, l_vpp, addr("10.0.0.10:2")).unwrap();
    ctx.wait_for_events(16, WAIT).unwrap();
    let (s, _) = ctx.session_accept(l).unwrap();
    assert_eq!(
        ctx.session_attr_get(s, SessionAttr::NonBlock as u32)
            .unwrap(),
        1
    );

    let mut buf = [0u8; 8];
    assert!(matches!(
        ctx.session_read(s, &mut buf),
        Err(VclError::WouldBlock)
    ));
}

#[test]
fn test_blocking_read_times_out() {
    let mut config = harness::test_config();
    config.session_timeout = 0.1;
    let (ctx, dp) = harness::attached_with("timeout", config, std::sync::Arc::new(mvirt_vcl::ProcessPid));
    let (l, l_vpp) = listener(&ctx, &dp, "127.0.0.1:8084");
    dp.inject_accept(0, l_vpp, addr("10.0.0.11:3")).unwrap();
    let (s, _) = ctx.session_accept(l).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        ctx.session_read(s, &mut buf),
        Err(VclError::TimedOut)
    ));
}

#[test]
fn test_connect_blocking_and_refused() {
    let (ctx, dp) = attached("connect");
    let s = ctx.session_create(TransportProto::Tcp, false).unwrap();
    ctx.session_connect(s, addr("192.0.2.1:80")).unwrap();
    assert_eq!(ctx.session_state(s).unwrap(), SessionState::Connect);
    assert!(matches!(
        ctx.session_connect(s, addr("192.0.2.1:80")),
        Err(VclError::AlreadyConnected(_))
    ));
    assert_eq!(
        ctx.session_attr_get(s, SessionAttr::CutThru as u32).unwrap(),
        0
    );

    dp.reject("connect", -111);
    let refused = ctx.session_create(TransportProto::Tcp, false).unwrap();
    assert!(matches!(
        ctx.session_connect(refused, addr("192.0.2.1:81")),
        Err(VclError::Rejected {
            op: "connect",
            retval: -111,
            ..
        })
    ));
    assert_eq!(ctx.session_state(refused).unwrap(), SessionState::Failed);
}

#[test]
fn test_nonblocking_connect_reports_event() {
    let (ctx, _dp) = attached("connect-nb");
    let s = ctx.session_create(TransportProto::Tcp, true).unwrap();
    ctx.session_connect(s, addr("192.0.2.2:443")).unwrap();
    let events = ctx.wait_for_events(16, WAIT).unwrap();
    assert!(events.contains(&VclEvent {
        handle: s,
        kind: VclEventKind::Connected
    }));
    assert!(ctx.session_write_ready(s).unwrap() > 0);
}

#[test]
fn test_listen_rejected_by_dataplane() {
    let (ctx, dp) = attached("bind-reject");
    dp.reject("bind", -98);
    let l = ctx.session_create(TransportProto::Tcp, false).unwrap();
    ctx.session_bind(l, addr("127.0.0.1:8085")).unwrap();
    assert!(matches!(
        ctx.session_listen(l, 0),
        Err(VclError::Rejected { retval: -98, .. })
    ));
    assert_eq!(ctx.session_state(l).unwrap(), SessionState::Failed);
}

#[test]
fn test_accept_on_plain_session_rejected() {
    let (ctx, _dp) = attached("not-listener");
    let s = ctx.session_create(TransportProto::Tcp, false).unwrap();
    assert!(matches!(
        ctx.session_accept(s),
        Err(VclError::NotListener(_))
    ));
}

#[test]
fn test_accept_for_unknown_listener_is_refused() {
    let (ctx, dp) = attached("orphan-accept");
    let vpp_handle = dp.inject_accept(0, 0xdead, addr("10.0.0.12:4")).unwrap();
    let events = ctx
        .wait_for_events(16, Some(Duration::from_millis(100)))
        .unwrap();
    assert!(events.is_empty());
    assert!(dp.vpp_events(0).contains(&AppEvent::AcceptedReply {
        handle: vpp_handle,
        retval: -1
    }));
}

#[test]
fn test_backlog_limits_pending_accepts() {
    let (ctx, dp) = attached("backlog");
    let l = ctx.session_create(TransportProto::Tcp, false).unwrap();
    ctx.session_bind(l, addr("127.0.0.1:8086")).unwrap();
    ctx.session_listen(l, 1).unwrap();
    let l_vpp = dp.listener_handle(0, l.session_index()).unwrap();

    dp.inject_accept(0, l_vpp, addr("10.0.0.13:5")).unwrap();
    let second = dp.inject_accept(0, l_vpp, addr("10.0.0.13:6")).unwrap();
    ctx.wait_for_events(16, WAIT).unwrap();

    assert_eq!(ctx.session_read_ready(l).unwrap(), 1);
    assert!(dp.vpp_events(0).contains(&AppEvent::AcceptedReply {
        handle: second,
        retval: -1
    }));
}

#[test]
fn test_tls_material_requires_tls_session() {
    let (ctx, dp) = attached("tls");
    let tcp = ctx.session_create(TransportProto::Tcp, false).unwrap();
    assert!(matches!(
        ctx.session_tls_cert_add(tcp, b"cert"),
        Err(VclError::InvalidArgument(_))
    ));

    let tls = ctx.session_create(TransportProto::Tls, false).unwrap();
    assert!(matches!(
        ctx.session_tls_key_add(tls, b""),
        Err(VclError::InvalidArgument(_))
    ));
    ctx.session_tls_cert_add(tls, b"-----BEGIN CERTIFICATE-----")
        .unwrap();
    assert!(
        dp.requests()
            .iter()
            .any(|r| matches!(r, Request::TlsCert { len: 27, .. }))
    );
}

#[test]
fn test_read_only_attributes() {
    let (ctx, _dp) = attached("attrs");
    let s = ctx.session_create(TransportProto::Udp, false).unwrap();
    assert!(matches!(
        ctx.session_attr_set(s, SessionAttr::Listen as u32, 1),
        Err(VclError::InvalidAttribute(_))
    ));
    assert!(matches!(
        ctx.session_attr_get(s, 99),
        Err(VclError::InvalidAttribute(99))
    ));
    ctx.session_attr_set(s, SessionAttr::TcpKeepIdle as u32, 30)
        .unwrap();
    assert_eq!(
        ctx.session_attr_get(s, SessionAttr::TcpKeepIdle as u32)
            .unwrap(),
        30
    );
}
