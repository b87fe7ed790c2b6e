//! Path management integration tests
//!
//! Tests Echo keepalives, path down detection and peer restart handling.

use std::sync::Arc;
use std::time::Duration;

use integration_tests::{init_test_logging, loopback_config, serve, spawn_echo_responder, MockPeer};
use nextgtp_codec::GtpMessage;
use nextgtp_common::{GtpRole, GtpVersion, PathConfig};
use nextgtp_conn::{MemoryControl, PathEvent, PeerState, Session, Tunnel};
use tokio::time::timeout;

fn fast_path() -> PathConfig {
    PathConfig {
        enabled: true,
        echo_interval_ms: 50,
        echo_timeout_ms: 30,
        max_missed: 2,
    }
}

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<PathEvent>) -> PathEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no path event")
        .expect("path event channel closed")
}

/// Test a responsive peer is reported up
#[tokio::test]
async fn test_peer_comes_up() {
    init_test_logging();

    let peer = MockPeer::bind().await.unwrap();
    let peer_addr = peer.addr();
    let responder = spawn_echo_responder(peer, 4, Duration::ZERO);

    let mut config = loopback_config(GtpVersion::V2).with_path(fast_path());
    config.peers = vec![peer_addr];
    let (conn, _stop) = serve(config).await.unwrap();
    let mut events = conn.take_path_events().unwrap();

    assert_eq!(next_event(&mut events).await, PathEvent::PeerUp { peer: peer_addr });
    let state = conn.path_manager().peer(peer_addr.ip()).unwrap();
    assert_eq!(state.state, PeerState::Alive);
    assert_eq!(state.restart_counter, Some(4));

    responder.abort();
    conn.close().await.unwrap();
}

/// Test a silent peer is reported down after the configured misses
#[tokio::test]
async fn test_silent_peer_goes_down() {
    init_test_logging();

    let peer = MockPeer::bind().await.unwrap();
    let mut config = loopback_config(GtpVersion::V1).with_path(fast_path());
    config.peers = vec![peer.addr()];
    let (conn, _stop) = serve(config).await.unwrap();
    let mut events = conn.take_path_events().unwrap();

    assert_eq!(
        next_event(&mut events).await,
        PathEvent::PathDown {
            peer: peer.addr(),
            missed: 2
        }
    );
    assert_eq!(conn.path_manager().state(peer.addr().ip()), Some(PeerState::Dead));

    // The peer kept receiving keepalives
    let (msg, _) = peer.recv().await.unwrap();
    assert!(msg.is_echo_request());

    conn.close().await.unwrap();
}

/// Test a Restart Counter increase in an Echo Request removes the peer's state
#[tokio::test]
async fn test_restart_in_echo_request_removes_state() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2)).await.unwrap();
    let mut events = conn.take_path_events().unwrap();
    let control = MemoryControl::new();
    conn.enable_kernel_gtp_with(Arc::new(control.clone()), "gtp0", GtpRole::Ggsn)
        .await
        .unwrap();

    let peer = MockPeer::bind().await.unwrap();
    let bystander = MockPeer::bind_at("127.0.0.2:0").await.unwrap();

    // First Echo records the counter
    peer.send(&GtpMessage::echo_request(GtpVersion::V2, 1, 10), conn.local_addr())
        .await
        .unwrap();
    peer.recv().await.unwrap();

    let teid = conn.allocate_teid().unwrap();
    conn.add_tunnel(
        Tunnel::new(teid, 0x10, peer.addr()).with_ms_addr("10.45.0.9".parse().unwrap()),
    )
    .await
    .unwrap();
    let other = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(other, 0x11, bystander.addr())).await.unwrap();
    let session = conn
        .add_session(Session::new(peer.addr()).with_imsi("001010123456789").with_teid(teid))
        .unwrap();
    assert_eq!(control.len(), 3);

    // Same counter: nothing happens
    peer.send(&GtpMessage::echo_request(GtpVersion::V2, 2, 10), conn.local_addr())
        .await
        .unwrap();
    peer.recv().await.unwrap();
    assert!(conn.tunnel(teid).is_some());

    // Increased counter: the peer restarted
    peer.send(&GtpMessage::echo_request(GtpVersion::V2, 3, 11), conn.local_addr())
        .await
        .unwrap();
    let (reply, _) = peer.recv().await.unwrap();
    assert!(reply.is_echo_response());

    assert_eq!(
        next_event(&mut events).await,
        PathEvent::PeerRestarted {
            peer: peer.addr(),
            old_counter: 10,
            new_counter: 11,
            removed_tunnels: vec![teid],
            removed_sessions: vec![session],
        }
    );
    assert!(conn.tunnel(teid).is_none());
    assert!(conn.session(session).is_none());
    assert!(conn.tunnel(other).is_some());

    // Kernel objects follow asynchronously
    integration_tests::wait_for_condition(
        || {
            let done = control.len() == 1;
            async move { done }
        },
        Duration::from_secs(5),
        Duration::from_millis(10),
    )
    .await
    .unwrap();

    conn.close().await.unwrap();
    assert!(control.is_empty());
}

/// Test an older counter arriving late is not treated as a restart
#[tokio::test]
async fn test_stale_counter_is_not_a_restart() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    peer.send(&GtpMessage::echo_request(GtpVersion::V2, 1, 0x02), conn.local_addr())
        .await
        .unwrap();
    peer.recv().await.unwrap();

    let teid = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(teid, 0x20, peer.addr())).await.unwrap();

    peer.send(&GtpMessage::echo_request(GtpVersion::V2, 2, 0x01), conn.local_addr())
        .await
        .unwrap();
    peer.recv().await.unwrap();
    assert!(conn.tunnel(teid).is_some());

    // Wrap-around from 255 to 0 counts as an increase
    let wrapped = MockPeer::bind_at("127.0.0.3:0").await.unwrap();
    wrapped
        .send(&GtpMessage::echo_request(GtpVersion::V2, 1, 0xFF), conn.local_addr())
        .await
        .unwrap();
    wrapped.recv().await.unwrap();
    let wrapped_teid = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(wrapped_teid, 0x21, wrapped.addr())).await.unwrap();
    wrapped
        .send(&GtpMessage::echo_request(GtpVersion::V2, 2, 0x00), conn.local_addr())
        .await
        .unwrap();
    wrapped.recv().await.unwrap();
    assert!(conn.tunnel(wrapped_teid).is_none());

    conn.close().await.unwrap();
}

/// Test an explicit Echo reports the peer's Restart Counter
#[tokio::test]
async fn test_echo_peer_updates_peer() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();
    let peer_addr = peer.addr();
    let responder = spawn_echo_responder(peer, 42, Duration::ZERO);

    conn.monitor_peer(peer_addr);
    conn.echo_peer(peer_addr).await;

    let state = conn.path_manager().peer(peer_addr.ip()).unwrap();
    assert_eq!(state.state, PeerState::Alive);
    assert_eq!(state.restart_counter, Some(42));
    assert!(!state.echo_in_flight);

    responder.abort();
    conn.close().await.unwrap();
}

/// Test a node that only sent an Echo Request is forgotten, not kept alive
#[tokio::test]
async fn test_unsolicited_sender_is_forgotten() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2).with_path(fast_path()))
        .await
        .unwrap();
    let sender = MockPeer::bind_at("127.0.0.5:0").await.unwrap();
    // Keepalives to a learned peer would go to the service port
    let service = MockPeer::bind_at(&format!("127.0.0.5:{}", conn.local_addr().port()))
        .await
        .unwrap();

    sender
        .send(&GtpMessage::echo_request(GtpVersion::V2, 9, 7), conn.local_addr())
        .await
        .unwrap();
    let (reply, _) = sender.recv().await.unwrap();
    assert!(reply.is_echo_response());

    let ip = sender.addr().ip();
    integration_tests::wait_for_condition(
        || {
            let gone = conn.path_manager().peer(ip).is_none();
            async move { gone }
        },
        Duration::from_secs(5),
        Duration::from_millis(10),
    )
    .await
    .unwrap();

    assert!(service.collect_for(Duration::from_millis(200)).await.unwrap().is_empty());
    assert!(sender.collect_for(Duration::from_millis(50)).await.unwrap().is_empty());
    assert!(conn.path_manager().peer(ip).is_none());

    conn.close().await.unwrap();
}
