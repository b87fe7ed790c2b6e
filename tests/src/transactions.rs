//! Request/response transaction integration tests
//!
//! Tests retransmission timing, timeout reporting and response matching
//! against a scripted peer over loopback UDP.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use integration_tests::{init_test_logging, loopback_config, serve, spawn_echo_responder, MockPeer};
use nextgtp_codec::{GtpMessage, Gtpv2MessageType, Message};
use nextgtp_common::GtpVersion;
use nextgtp_conn::{ConnError, TransactionError};

/// Test a response arriving before the first retransmission
#[tokio::test]
async fn test_prompt_response_needs_no_retransmission() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();
    let peer_addr = peer.addr();
    let responder = spawn_echo_responder(peer, 7, Duration::ZERO);

    let echo = GtpMessage::echo_request(GtpVersion::V2, 0, conn.restart_counter());
    let response = conn.send_request(peer_addr, echo).await.unwrap();

    assert!(response.is_echo_response());
    assert_eq!(response.recovery(), Some(7));
    assert_eq!(conn.retransmissions(), 0);
    assert_eq!(conn.pending_requests(), 0);

    responder.abort();
    conn.close().await.unwrap();
}

/// Test timeout after every retransmission went unanswered
#[tokio::test]
async fn test_silent_peer_times_out_after_retries() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let start = Instant::now();
    let echo = GtpMessage::echo_request(GtpVersion::V1, 0, conn.restart_counter());
    let result = conn.send_request(peer.addr(), echo).await;
    let elapsed = start.elapsed();

    assert!(matches!(
        result,
        Err(ConnError::Transaction(TransactionError::TimedOut { retransmissions: 2 }))
    ));
    // 100 ms interval, 2 retries: the request is abandoned one interval
    // after the last retransmission
    assert!(elapsed >= Duration::from_millis(290), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "gave up after {elapsed:?}");
    assert_eq!(conn.retransmissions(), 2);

    // Original plus two retransmissions, all with the same bytes
    let copies = peer.collect_for(Duration::from_millis(200)).await.unwrap();
    assert_eq!(copies.len(), 3);
    assert!(copies.iter().all(|m| m == &copies[0]));

    conn.close().await.unwrap();
}

/// Test that a late response after a timeout does not disturb the connection
#[tokio::test]
async fn test_late_and_duplicate_responses_are_ignored() {
    init_test_logging();

    let (conn, _stop) = serve(
        loopback_config(GtpVersion::V2).with_retry(Duration::from_millis(50), 0),
    )
    .await
    .unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let echo = GtpMessage::echo_request(GtpVersion::V2, 0, 1);
    let result = conn.send_request(peer.addr(), echo).await;
    assert!(matches!(
        result,
        Err(ConnError::Transaction(TransactionError::TimedOut { retransmissions: 0 }))
    ));

    let (request, from) = peer.recv().await.unwrap();
    let seq = request.sequence().unwrap();
    let late = GtpMessage::echo_response(GtpVersion::V2, seq, 1);
    peer.send(&late, from).await.unwrap();
    peer.send(&late, from).await.unwrap();

    // Connection still answers
    let ping = GtpMessage::echo_request(GtpVersion::V2, 9, 1);
    peer.send(&ping, conn.local_addr()).await.unwrap();
    let (answer, _) = peer.recv().await.unwrap();
    assert!(answer.is_echo_response());
    assert_eq!(answer.sequence(), Some(9));
    assert_eq!(conn.pending_requests(), 0);

    conn.close().await.unwrap();
}

/// Test that a response is matched on sender address as well as sequence
#[tokio::test]
async fn test_response_from_other_address_is_not_matched() {
    init_test_logging();

    let (conn, _stop) = serve(
        loopback_config(GtpVersion::V2).with_retry(Duration::from_millis(150), 0),
    )
    .await
    .unwrap();
    let target = MockPeer::bind().await.unwrap();
    let impostor = MockPeer::bind().await.unwrap();

    let sender = conn.clone();
    let target_addr = target.addr();
    let request = tokio::spawn(async move {
        sender
            .send_request(target_addr, GtpMessage::echo_request(GtpVersion::V2, 0, 1))
            .await
    });

    let (msg, _) = target.recv().await.unwrap();
    let reply = GtpMessage::echo_response(GtpVersion::V2, msg.sequence().unwrap(), 1);
    impostor.send(&reply, conn.local_addr()).await.unwrap();

    assert!(matches!(
        request.await.unwrap(),
        Err(ConnError::Transaction(TransactionError::TimedOut { .. }))
    ));
    conn.close().await.unwrap();
}

/// Test concurrent requests to one peer use distinct sequence numbers
#[tokio::test]
async fn test_concurrent_requests_get_distinct_sequences() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();
    let peer_addr = peer.addr();
    let responder = spawn_echo_responder(peer, 1, Duration::from_millis(5));

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            conn.send_request(peer_addr, GtpMessage::echo_request(GtpVersion::V2, 0, 1))
                .await
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert!(seen.insert(response.sequence().unwrap()));
    }
    assert_eq!(seen.len(), 20);

    responder.abort();
    conn.close().await.unwrap();
}

/// Test Version Not Supported for a request in the other version
#[tokio::test]
async fn test_version_not_supported_reply() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V2)).await.unwrap();
    let peer = MockPeer::bind().await.unwrap();

    let v1_echo = GtpMessage::echo_request(GtpVersion::V1, 0x1234, 0);
    peer.send(&v1_echo, conn.local_addr()).await.unwrap();

    let (reply, _) = peer.recv().await.unwrap();
    assert_eq!(reply.version(), GtpVersion::V2);
    assert_eq!(
        reply.message_type(),
        Gtpv2MessageType::VersionNotSupportedIndication as u8
    );
    assert_eq!(reply.sequence(), Some(0x1234));

    // Responses in the wrong version are dropped silently
    let v1_response = GtpMessage::echo_response(GtpVersion::V1, 1, 0);
    peer.send(&v1_response, conn.local_addr()).await.unwrap();
    assert!(peer
        .recv_within(Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());

    conn.close().await.unwrap();
}
