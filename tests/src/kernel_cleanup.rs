//! Kernel GTP bridge integration tests
//!
//! Uses the in-memory control channel to check that every object created
//! for a connection is gone after close, and that partial failures are
//! reported object by object.

use std::net::SocketAddr;
use std::sync::Arc;

use integration_tests::{init_test_logging, loopback_config, serve};
use nextgtp_common::{GtpRole, GtpVersion, KernelConfig};
use nextgtp_conn::{ConnError, KernelObject, KernelTunnel, MemoryControl, Tunnel, DEFAULT_RULE_TABLE};

fn peer() -> SocketAddr {
    "192.0.2.50:2152".parse().unwrap()
}

/// Test close removes every kernel object the connection created
#[tokio::test]
async fn test_close_removes_all_kernel_objects() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let control = MemoryControl::new();
    conn.enable_kernel_gtp_with(Arc::new(control.clone()), "gtp0", GtpRole::Ggsn)
        .await
        .unwrap();

    let bridge = conn.kernel_bridge().unwrap();
    bridge
        .add_address("gtp0", "10.45.0.1".parse().unwrap(), 16)
        .await
        .unwrap();
    bridge
        .add_rule("10.45.0.1".parse().unwrap(), DEFAULT_RULE_TABLE)
        .await
        .unwrap();

    for i in 2..12u8 {
        let teid = conn.allocate_teid().unwrap();
        let ms = format!("10.45.0.{i}").parse().unwrap();
        conn.add_tunnel(Tunnel::new(teid, 0x9000 + i as u32, peer()).with_ms_addr(ms))
            .await
            .unwrap();
    }
    // Device, address, rule, and a tunnel plus host route per subscriber
    assert_eq!(control.len(), 3 + 20);

    conn.close().await.unwrap();
    assert!(control.is_empty());
    assert!(conn.kernel_bridge().is_none());
}

/// Test tunnels already present are programmed when kernel GTP is enabled later
#[tokio::test]
async fn test_enable_mirrors_existing_tunnels() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let with_ms = conn.allocate_teid().unwrap();
    conn.add_tunnel(
        Tunnel::new(with_ms, 0x77, peer()).with_ms_addr("10.45.1.1".parse().unwrap()),
    )
    .await
    .unwrap();
    let without_ms = conn.allocate_teid().unwrap();
    conn.add_tunnel(Tunnel::new(without_ms, 0x78, peer())).await.unwrap();

    let control = MemoryControl::new();
    conn.enable_kernel_gtp_with(Arc::new(control.clone()), "gtp1", GtpRole::Sgsn)
        .await
        .unwrap();

    assert!(control.contains(&KernelObject::Tunnel {
        device: "gtp1".into(),
        tunnel: KernelTunnel {
            local_teid: with_ms,
            peer_teid: 0x77,
            peer_ip: peer().ip(),
            ms_addr: "10.45.1.1".parse().unwrap(),
        },
    }));
    assert_eq!(control.len(), 3);
    assert!(conn.kernel_bridge().unwrap().tunnel_objects(without_ms).is_empty());

    conn.close().await.unwrap();
    assert!(control.is_empty());
}

/// Test cleanup keeps going past failures and lists each one
#[tokio::test]
async fn test_partial_cleanup_failure_is_aggregated() {
    init_test_logging();

    let (conn, _stop) = serve(loopback_config(GtpVersion::V1)).await.unwrap();
    let control = MemoryControl::new();
    conn.enable_kernel_gtp_with(Arc::new(control.clone()), "gtp0", GtpRole::Ggsn)
        .await
        .unwrap();
    for i in 2..5u8 {
        let teid = conn.allocate_teid().unwrap();
        let ms = format!("10.45.0.{i}").parse().unwrap();
        conn.add_tunnel(Tunnel::new(teid, i as u32, peer()).with_ms_addr(ms))
            .await
            .unwrap();
    }

    control.fail_remove("route");
    let err = match conn.close().await {
        Err(ConnError::Cleanup(err)) => err,
        other => panic!("expected cleanup failure, got {other:?}"),
    };
    assert_eq!(err.len(), 3);
    assert!(err
        .failures
        .iter()
        .all(|(object, _)| matches!(object, KernelObject::Route { .. })));

    // Everything else went away; only the routes remain
    let left = control.objects();
    assert_eq!(left.len(), 3);
    assert!(left.iter().all(|o| matches!(o, KernelObject::Route { .. })));

    // Close is idempotent and does not retry
    conn.close().await.unwrap();
}

/// Test a dry-run kernel device from configuration is torn down on close
#[tokio::test]
async fn test_dry_run_device_from_config() {
    init_test_logging();

    let mut config = loopback_config(GtpVersion::V1);
    config.kernel = Some(KernelConfig {
        device: "gtp-dry".into(),
        role: GtpRole::Ggsn,
        dry_run: true,
    });
    let (conn, _stop) = serve(config).await.unwrap();

    let bridge = conn.kernel_bridge().unwrap();
    assert_eq!(bridge.device(), "gtp-dry");
    assert_eq!(bridge.role(), GtpRole::Ggsn);
    assert_eq!(
        bridge.objects(),
        vec![KernelObject::Device {
            name: "gtp-dry".into()
        }]
    );

    conn.close().await.unwrap();
}
