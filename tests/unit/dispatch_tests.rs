//! Unit tests for the request queue types and the helper round-trip.
//!
//! The helper side is simulated with in-memory duplex streams; process
//! level behaviour is covered by the integration tests.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use wsl2_ssh_agent::dispatch::{round_trip, DispatchConfig, Request};
use wsl2_ssh_agent::AppError;

// ── Request ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn respond_delivers_reply() {
    let (request, slot) = Request::new(Bytes::from_static(b"\x00\x00\x00\x01\x0b"));
    assert_eq!(&request.frame()[..], b"\x00\x00\x00\x01\x0b");

    request.respond(Bytes::from_static(b"\x00\x00\x00\x01\x0c"));
    let reply = slot.await.expect("reply delivered");
    assert_eq!(&reply[..], b"\x00\x00\x00\x01\x0c");
}

/// Dropping a request closes its slot; that is how a session learns its
/// request was abandoned.
#[tokio::test]
async fn dropped_request_closes_slot() {
    let (request, slot) = Request::new(Bytes::from_static(b"\x00\x00\x00\x01\x0b"));
    drop(request);
    assert!(slot.await.is_err(), "slot must close without a value");
}

#[test]
fn respond_to_departed_session_is_silent() {
    let (request, slot) = Request::new(Bytes::from_static(b"\x00\x00\x00\x01\x0b"));
    drop(slot);
    request.respond(Bytes::from_static(b"\x00\x00\x00\x01\x06"));
}

#[test]
fn dispatch_defaults() {
    let config = DispatchConfig::default();
    assert_eq!(config.read_timeout, Duration::from_secs(10));
    assert_eq!(config.max_request_failures, 3);
}

// ── round_trip ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_writes_request_and_reads_one_reply() {
    let (ours, mut helper) = tokio::io::duplex(256);
    let (mut rd, mut wr) = tokio::io::split(ours);

    let fake = tokio::spawn(async move {
        let mut request = [0u8; 9];
        helper.read_exact(&mut request).await.expect("read request");
        assert_eq!(&request, b"\x00\x00\x00\x05hello");
        helper
            .write_all(b"\x00\x00\x00\x05HELLO")
            .await
            .expect("write reply");
        helper
    });

    let reply = round_trip(&mut wr, &mut rd, b"\x00\x00\x00\x05hello", Duration::from_secs(5))
        .await
        .expect("round trip succeeds");
    assert_eq!(&reply[..], b"\x00\x00\x00\x05HELLO");

    let _helper = fake.await.expect("fake helper");
}

#[tokio::test]
async fn round_trip_times_out_on_silent_helper() {
    let (ours, helper) = tokio::io::duplex(256);
    let (mut rd, mut wr) = tokio::io::split(ours);

    let err = round_trip(
        &mut wr,
        &mut rd,
        b"\x00\x00\x00\x05stuck",
        Duration::from_millis(100),
    )
    .await
    .expect_err("silent helper must time out");

    assert!(matches!(err, AppError::Helper(_)), "got {err:?}");
    drop(helper);
}

/// A helper that dies mid-reply is a helper failure, not a session one.
#[tokio::test]
async fn round_trip_reports_truncated_reply() {
    let (ours, mut helper) = tokio::io::duplex(256);
    let (mut rd, mut wr) = tokio::io::split(ours);

    let fake = tokio::spawn(async move {
        let mut request = [0u8; 8];
        helper.read_exact(&mut request).await.expect("read request");
        helper.write_all(b"\x00\x00\x00\x05HE").await.expect("write");
    });

    let err = round_trip(&mut wr, &mut rd, b"\x00\x00\x00\x04fail", Duration::from_secs(5))
        .await
        .expect_err("truncated reply must fail");
    assert!(matches!(err, AppError::Helper(_)), "got {err:?}");

    fake.await.expect("fake helper");
}
