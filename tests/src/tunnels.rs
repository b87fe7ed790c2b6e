//! Tunnel and session table integration tests
//!
//! Tests TEID allocation under concurrency and session bookkeeping through
//! the connection API.

use std::collections::HashSet;
use std::net::SocketAddr;

use integration_tests::{init_test_logging, loopback_config, serve};
use nextgtp_codec::v2::{ie_type, interface_type, Ie};
use nextgtp_codec::{FTeid, Gtpv2Message, Gtpv2MessageType};
use nextgtp_common::GtpVersion;
use nextgtp_conn::{ConnError, Session, Tunnel, TunnelError};

/// Test TEIDs allocated from many tasks never collide and are never zero
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_teid_allocation() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer: SocketAddr = "192.0.2.10:2152".parse().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            for i in 0..250u32 {
                let teid = conn.allocate_teid().unwrap();
                conn.add_tunnel(Tunnel::new(teid, i + 1, peer)).await.unwrap();
                mine.push(teid);
            }
            mine
        }));
    }

    let mut all = HashSet::new();
    for task in tasks {
        for teid in task.await.unwrap() {
            assert_ne!(teid, 0);
            assert!(all.insert(teid), "TEID {teid:#x} handed out twice");
        }
    }
    assert_eq!(all.len(), 2000);
    assert_eq!(conn.tunnels().len(), 2000);
    assert_eq!(conn.tunnels_for_peer(peer.ip()).len(), 2000);

    conn.close().await.unwrap();
}

/// Test duplicate tunnels and reserved TEIDs are rejected
#[tokio::test]
async fn test_tunnel_table_rejections() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer: SocketAddr = "192.0.2.10:2152".parse().unwrap();

    assert!(matches!(
        conn.add_tunnel(Tunnel::new(0, 1, peer)).await,
        Err(ConnError::Tunnel(TunnelError::InvalidTeid(0)))
    ));

    let teid = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(teid, 1, peer)).await.unwrap();
    assert!(matches!(
        conn.add_tunnel(Tunnel::new(teid, 2, peer)).await,
        Err(ConnError::Tunnel(TunnelError::DuplicateTeid(t))) if t == teid
    ));
    assert_eq!(conn.tunnel(teid).unwrap().peer_teid, 1);

    let removed = conn.del_tunnel_by_teid(teid).await.unwrap();
    assert_eq!(removed.local_teid, teid);
    assert!(matches!(
        conn.del_tunnel_by_teid(teid).await,
        Err(ConnError::Tunnel(TunnelError::TunnelNotFound(_)))
    ));

    let unused = conn.allocate_teid().unwrap();
    assert!(conn.release_teid(unused));
    assert!(!conn.release_teid(unused));

    conn.close().await.unwrap();
}

/// Test a session built from a Create Session Request is indexed by IMSI and TEID
#[tokio::test]
async fn test_session_from_create_session_request() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2)).await.unwrap();
    let peer: SocketAddr = "192.0.2.20:2123".parse().unwrap();

    let sender_fteid = FTeid {
        interface_type: interface_type::S11_MME_GTPC,
        teid: 0x1111,
        ipv4: Some("192.0.2.20".parse().unwrap()),
        ipv6: None,
    };
    let bearer_fteid = FTeid {
        interface_type: interface_type::S1U_ENODEB_GTPU,
        teid: 0x2222,
        ipv4: Some("192.0.2.21".parse().unwrap()),
        ipv6: None,
    };
    let request = Gtpv2Message::new(Gtpv2MessageType::CreateSessionRequest as u8, Some(0), 1)
        .with_ie(Ie::imsi("001010000000042").unwrap())
        .with_ie(Ie::fteid(&sender_fteid))
        .with_ie(Ie::grouped(
            ie_type::BEARER_CONTEXT,
            &[Ie::ebi(5), Ie::fteid(&bearer_fteid)],
        )
        .unwrap());

    let local_teid = conn.allocate_teid().unwrap();
    let session = Session::from_create_session_request(&request, peer)
        .unwrap()
        .with_teid(local_teid);
    assert_eq!(session.peer_control_teid, Some(0x1111));
    assert_eq!(session.ebi, Some(5));
    assert_eq!(session.peer_user_teid, Some(0x2222));

    let id = conn.add_session(session).unwrap();
    assert_eq!(conn.session_by_imsi("001010000000042").unwrap().id, id);
    assert_eq!(conn.session_by_teid(local_teid).unwrap().id, id);

    // A second session for the same subscriber is refused
    let again = Session::new(peer).with_imsi("001010000000042");
    assert!(matches!(
        conn.add_session(again),
        Err(ConnError::Tunnel(TunnelError::DuplicateSession(_)))
    ));

    let extra = conn.allocate_teid().unwrap();
    let modified = conn.modify_session(id, |s| s.teids.push(extra)).unwrap();
    assert_eq!(modified.teids, vec![local_teid, extra]);
    assert_eq!(conn.session_by_teid(extra).unwrap().id, id);

    conn.remove_session(id).unwrap();
    assert!(conn.session_by_imsi("001010000000042").is_none());
    assert!(conn.session_by_teid(local_teid).is_none());

    conn.close().await.unwrap();
}
