//! User Plane data flow integration tests
//!
//! Tests G-PDU delivery, relaying between connections and Error Indication
//! handling in both directions.

use std::time::Duration;

use bytes::Bytes;
use integration_tests::{
    init_test_logging, loopback_config, serve, wait_for_condition, MockPeer, DEFAULT_POLL_INTERVAL,
    DEFAULT_TEST_TIMEOUT,
};
use nextgtp_codec::{ExtHeader, GtpMessage, Gtpv1Message, Gtpv1MessageType, Message};
use nextgtp_common::GtpVersion;
use nextgtp_conn::Tunnel;

/// Test a G-PDU on a known tunnel reaches the application
#[tokio::test]
async fn test_g_pdu_delivered_to_reader() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let teid = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(teid, 0x5000, peer.addr())).await.unwrap();

    let payload = Bytes::from_static(&[0x45, 0x00, 0x00, 0x1c, 0xde, 0xad]);
    let pdu = GtpMessage::V1(Gtpv1Message::g_pdu(teid, payload.clone()));
    peer.send(&pdu, conn.local_addr()).await.unwrap();

    let packet = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, conn.read_from_gtp())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.teid, teid);
    assert_eq!(packet.peer, peer.addr());
    assert_eq!(packet.payload, payload);

    conn.close().await.unwrap();
}

/// Test application writes leave as G-PDUs
#[tokio::test]
async fn test_write_to_gtp_sends_g_pdu() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let payload = Bytes::from_static(b"uplink");
    let written = conn.write_to_gtp(0xABCD, payload.clone(), peer.addr()).await.unwrap();
    assert_eq!(written, payload.len());

    let (msg, from) = peer.recv().await.unwrap();
    assert_eq!(from, conn.local_addr());
    let pdu = msg.as_v1().unwrap();
    assert_eq!(pdu.message_type, Gtpv1MessageType::GPdu as u8);
    assert_eq!(pdu.teid, 0xABCD);
    assert_eq!(pdu.payload, payload);

    conn.close().await.unwrap();
}

/// Test a G-PDU for an unknown TEID is answered with Error Indication
#[tokio::test]
async fn test_unknown_teid_triggers_error_indication() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let pdu = GtpMessage::V1(Gtpv1Message::g_pdu(0x0BAD, Bytes::from_static(b"lost")));
    peer.send(&pdu, conn.local_addr()).await.unwrap();

    let (msg, _) = peer.recv().await.unwrap();
    let indication = msg.as_v1().unwrap();
    assert_eq!(
        indication.message_type,
        Gtpv1MessageType::ErrorIndication as u8
    );
    assert_eq!(indication.teid, 0);
    assert_eq!(indication.teid_data_i(), Some(0x0BAD));
    assert_eq!(indication.gsn_address(), Some(conn.local_addr().ip()));
    assert!(indication
        .extension_headers
        .contains(&ExtHeader::UdpPort { port: peer.addr().port() }));

    conn.close().await.unwrap();
}

/// Test a received Error Indication tears down the matching tunnel
#[tokio::test]
async fn test_error_indication_removes_tunnel() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let doomed = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(doomed, 0x7001, peer.addr())).await.unwrap();
    let survivor = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(survivor, 0x7002, peer.addr())).await.unwrap();

    let indication = Gtpv1Message::error_indication(0x7001, peer.addr().ip()).with_sequence_number(0);
    peer.send(&GtpMessage::V1(indication), conn.local_addr())
        .await
        .unwrap();

    wait_for_condition(
        || {
            let gone = conn.tunnel(doomed).is_none();
            async move { gone }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .unwrap();
    assert!(conn.tunnel(survivor).is_some());

    conn.close().await.unwrap();
}

/// Test G-PDUs relayed from one connection out of another
#[tokio::test]
async fn test_relay_rewrites_teid() {
    init_test_logging();

    let (ingress, _stop_in) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let (egress, _stop_out) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let sender = MockPeer::bind().await.unwrap();
    let receiver = MockPeer::bind().await.unwrap();

    ingress.relay_to(&egress, 0x100, 0x200, receiver.addr());

    let payload = Bytes::from_static(b"relayed");
    let pdu = GtpMessage::V1(Gtpv1Message::g_pdu(0x100, payload.clone()));
    sender.send(&pdu, ingress.local_addr()).await.unwrap();

    let (msg, from) = receiver.recv().await.unwrap();
    assert_eq!(from, egress.local_addr());
    let out = msg.as_v1().unwrap();
    assert_eq!(out.teid, 0x200);
    assert_eq!(out.payload, payload);

    // Once removed, the TEID is unknown again
    assert!(ingress.remove_relay(0x100));
    sender.send(&pdu, ingress.local_addr()).await.unwrap();
    let (msg, _) = sender.recv().await.unwrap();
    assert_eq!(msg.message_type(), Gtpv1MessageType::ErrorIndication as u8);
    assert!(receiver
        .recv_within(Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());

    ingress.close().await.unwrap();
    egress.close().await.unwrap();
}

/// Test the reader is released when the connection closes
#[tokio::test]
async fn test_read_from_gtp_returns_on_close() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let reader = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.read_from_gtp().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    conn.close().await.unwrap();
    let result = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(nextgtp_conn::ConnError::Closed)));
}
