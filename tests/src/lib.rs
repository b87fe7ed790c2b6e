//! Integration test framework for nextgtp
#![allow(missing_docs)]
//!
//! Drives real [`nextgtp_conn::Conn`] instances over loopback UDP against
//! scripted peers.
//!
//! # Test Categories
//!
//! 1. **Transactions** - retransmission, timeout and response matching
//! 2. **Path Management** - Echo keepalives, path down and peer restart
//! 3. **User Plane** - G-PDU delivery, relay and Error Indication
//! 4. **Tunnels** - TEID allocation and session bookkeeping under concurrency
//! 5. **Kernel Cleanup** - kernel object ledger and close semantics

pub mod test_utils;

pub use test_utils::{
    init_test_logging, loopback_config, serve, spawn_echo_responder, wait_for_condition, MockPeer,
    TestResult, DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT,
};
