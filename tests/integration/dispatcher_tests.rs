//! Integration tests for the dispatcher task against a real helper.

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use wsl2_ssh_agent::dispatch::{request_queue, DispatchOutcome, Dispatcher, Request};
use wsl2_ssh_agent::helper::HelperChannel;
use wsl2_ssh_agent::AppError;

use super::test_helpers::{dispatch_config, frame, is_gone, Fixture, LIMIT};

fn request(body: &[u8]) -> (Request, tokio::sync::oneshot::Receiver<Bytes>) {
    Request::new(Bytes::from(frame(body)))
}

/// Requests queued together are served strictly in submission order.
#[tokio::test]
async fn queued_requests_are_served_in_order() {
    let fixture = Fixture::new();
    let (tx, rx) = request_queue();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        HelperChannel::new(fixture.upcase_helper()),
        dispatch_config(Duration::from_secs(5)),
        rx,
        cancel,
    )
    .spawn();

    let mut slots = Vec::new();
    for body in [&b"first"[..], &b"second"[..], &b"third"[..]] {
        let (req, slot) = request(body);
        tx.send(req).expect("queue open");
        slots.push(slot);
    }

    let mut replies = Vec::new();
    for slot in slots {
        replies.push(slot.await.expect("reply"));
    }
    assert_eq!(&replies[0][..], frame(b"FIRST"));
    assert_eq!(&replies[1][..], frame(b"SECOND"));
    assert_eq!(&replies[2][..], frame(b"THIRD"));
    assert_eq!(
        fixture.requests(),
        vec!["6669727374", "7365636f6e64", "7468697264"]
    );

    drop(tx);
    let outcome = tokio::time::timeout(LIMIT, dispatcher)
        .await
        .expect("dispatcher stops")
        .expect("join");
    assert!(matches!(outcome, DispatchOutcome::Completed), "got {outcome:?}");
    assert!(is_gone(fixture.helper_pid()), "last generation must be terminated");
}

/// Giving up fires the shared token and releases every waiting slot.
#[tokio::test]
async fn give_up_cancels_and_releases_queue() {
    let fixture = Fixture::new();
    let (tx, rx) = request_queue();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        HelperChannel::new(fixture.upcase_helper()),
        dispatch_config(Duration::from_secs(5)),
        rx,
        cancel.clone(),
    )
    .spawn();

    let (doomed, doomed_slot) = request(b"fail");
    let (queued, queued_slot) = request(b"never");
    tx.send(doomed).expect("queue open");
    tx.send(queued).expect("queue open");

    assert!(doomed_slot.await.is_err(), "failed request slot must close");
    assert!(queued_slot.await.is_err(), "queued request slot must close");

    let outcome = tokio::time::timeout(LIMIT, dispatcher)
        .await
        .expect("dispatcher stops")
        .expect("join");
    assert!(
        matches!(outcome, DispatchOutcome::GaveUp(AppError::GaveUp(3))),
        "got {outcome:?}"
    );
    assert!(cancel.is_cancelled(), "give-up must cancel the acceptor");

    let (late, _slot) = request(b"late");
    assert!(tx.send(late).is_err(), "queue must refuse new requests");
}

/// A failure that the immediate retry recovers from costs no budget, no
/// matter how often it happens.
#[tokio::test]
async fn recovered_failures_do_not_accumulate() {
    let fixture = Fixture::new();
    let (tx, rx) = request_queue();
    let dispatcher = Dispatcher::new(
        HelperChannel::new(fixture.upcase_helper()),
        dispatch_config(Duration::from_secs(5)),
        rx,
        CancellationToken::new(),
    )
    .spawn();

    for _ in 0..5 {
        std::fs::remove_file(fixture.path().join("flaked")).ok();
        let (req, slot) = request(b"flaky");
        tx.send(req).expect("queue open");
        assert_eq!(&slot.await.expect("reply")[..], frame(b"FLAKY"));
    }

    drop(tx);
    let outcome = dispatcher.await.expect("join");
    assert!(matches!(outcome, DispatchOutcome::Completed), "got {outcome:?}");
}

/// Shutdown does not interrupt the drain: requests queued afterwards are
/// still served by the live generation, and the helper is terminated once
/// the queue closes.
#[tokio::test]
async fn cancel_keeps_serving_queued_requests() {
    let fixture = Fixture::new();
    let (tx, rx) = request_queue();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        HelperChannel::new(fixture.upcase_helper()),
        dispatch_config(Duration::from_secs(5)),
        rx,
        cancel.clone(),
    )
    .spawn();

    let (req, slot) = request(b"warm");
    tx.send(req).expect("queue open");
    slot.await.expect("reply");
    let pid = fixture.helper_pid();

    cancel.cancel();
    let (req, slot) = request(b"after");
    tx.send(req).expect("queue still open after cancel");
    assert_eq!(&slot.await.expect("reply")[..], frame(b"AFTER"));
    assert_eq!(fixture.helper_pid(), pid, "same generation serves it");

    drop(tx);
    let outcome = tokio::time::timeout(LIMIT, dispatcher)
        .await
        .expect("dispatcher stops")
        .expect("join");
    assert!(matches!(outcome, DispatchOutcome::Completed), "got {outcome:?}");
    assert!(is_gone(pid));
}

/// After shutdown a failed generation is not replaced: the request is
/// released instead of retried.
#[tokio::test]
async fn cancel_skips_restart() {
    let fixture = Fixture::new();
    let (tx, rx) = request_queue();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        HelperChannel::new(fixture.upcase_helper()),
        dispatch_config(Duration::from_secs(5)),
        rx,
        cancel.clone(),
    )
    .spawn();

    let (req, slot) = request(b"warm");
    tx.send(req).expect("queue open");
    slot.await.expect("reply");

    cancel.cancel();
    let (req, slot) = request(b"fail");
    tx.send(req).expect("queue open");
    assert!(slot.await.is_err(), "failed request must be released");

    let outcome = tokio::time::timeout(LIMIT, dispatcher)
        .await
        .expect("dispatcher stops")
        .expect("join");
    assert!(matches!(outcome, DispatchOutcome::Cancelled), "got {outcome:?}");
    assert_eq!(
        fixture.requests().iter().filter(|r| *r == "6661696c").count(),
        1,
        "no retry after shutdown"
    );
}
