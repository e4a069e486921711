//! Session state machine driven by a scripted transport.

use std::cell::RefCell;
use std::rc::Rc;

use jpip_rs::protocol::{
    FetchEvent, FetchWindow, Session, SessionState, TransportFailure, TransportResponse,
    WaitBehavior,
};
use jpip_rs::JpipConfig;
use jpip_rs::JpipError;

/// Minimal jpp-stream body: one complete main header databin plus an
/// image-done trailer.
fn main_header_body() -> Vec<u8> {
    vec![0x50, 0x06, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x00]
}

fn channel_grant(cid: &str) -> TransportResponse {
    TransportResponse {
        body: Vec::new(),
        target_id: Some("tid-1".to_owned()),
        new_channel: Some(format!("cid={cid},path=/jpip,transport=http")),
    }
}

fn events() -> (Rc<RefCell<Vec<FetchEvent>>>, Box<dyn FnMut(FetchEvent)>) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, Box::new(move |event| sink.borrow_mut().push(event)))
}

fn open_session() -> Session {
    let mut session = Session::new(JpipConfig::default());
    session.open().unwrap();
    let req = session.next_request().unwrap();
    assert!(req.descriptor.query.contains("cnew=http"));
    assert!(req.descriptor.query.contains("type=jpp-stream"));
    session
        .handle_response(req.id, Ok(channel_grant("C1")))
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    session
}

#[test]
fn negotiation_opens_channel_and_records_target() {
    let session = open_session();
    assert_eq!(session.target_id(), Some("tid-1"));
}

#[test]
fn fetch_round_trip_fills_store_and_reports_completion() {
    let mut session = open_session();
    let (log, callback) = events();
    session
        .fetch(FetchWindow::full_frame(256, 256), WaitBehavior::NoWait, callback)
        .unwrap();

    let req = session.next_request().unwrap();
    assert!(req.descriptor.query.contains("cid=C1"));
    assert!(req.descriptor.query.contains("fsiz=256,256"));
    assert!(req.descriptor.query.contains("wait=no"));
    assert!(req.descriptor.query.contains("qid="));

    session
        .handle_response(
            req.id,
            Ok(TransportResponse {
                body: main_header_body(),
                ..Default::default()
            }),
        )
        .unwrap();

    assert_eq!(
        log.borrow().as_slice(),
        &[FetchEvent::Completed {
            server_complete: true
        }]
    );
    let saver = session.saver();
    let saver = saver.borrow();
    assert!(saver.main_header().borrow().is_fully_loaded());
}

#[test]
fn transport_failure_renegotiates_before_releasing_fetches() {
    let mut session = Session::new(JpipConfig::default());
    session.open().unwrap();
    let req = session.next_request().unwrap();
    session
        .handle_response(
            req.id,
            Err(TransportFailure {
                reason: "connection reset".to_owned(),
            }),
        )
        .unwrap();
    assert_eq!(session.state(), SessionState::Reconnecting);

    let retry = session.next_request().unwrap();
    assert!(retry.descriptor.query.contains("cnew=http"));
    session
        .handle_response(retry.id, Ok(channel_grant("C2")))
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn dedicated_fetch_must_move_after_channel_loss() {
    let mut session = open_session();
    let (pooled_log, pooled_callback) = events();
    session
        .fetch(
            FetchWindow::full_frame(512, 512),
            WaitBehavior::NoWait,
            pooled_callback,
        )
        .unwrap();
    let (log, callback) = events();
    let handle = session
        .dedicated_fetch(
            FetchWindow::full_frame(512, 512),
            WaitBehavior::WaitForLayers(4),
            callback,
        )
        .unwrap();

    // The pooled fetch goes out first; the dedicated one is still queued
    // when the transport dies.
    let in_flight = session.next_request().unwrap();
    session
        .handle_response(
            in_flight.id,
            Err(TransportFailure {
                reason: "timeout".to_owned(),
            }),
        )
        .unwrap();
    assert_eq!(session.state(), SessionState::Reconnecting);
    assert_eq!(log.borrow().as_slice(), &[FetchEvent::ChannelLost]);
    assert!(pooled_log.borrow().is_empty());

    assert!(matches!(
        session.resume_fetch(handle),
        Err(JpipError::FetchNeedsMove)
    ));
    session
        .move_fetch(handle, FetchWindow::full_frame(256, 256))
        .unwrap();

    // Only the renegotiation goes out while reconnecting.
    let retry = session.next_request().unwrap();
    assert!(retry.descriptor.query.contains("cnew=http"));
    assert!(retry.descriptor.query.contains("tid=tid-1"));
    session
        .handle_response(retry.id, Ok(channel_grant("C3")))
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    // The failed pooled request counts as still pending: it is
    // re-issued first, on the renegotiated channel.
    let reissued = session.next_request().unwrap();
    assert!(reissued.descriptor.query.contains("cid=C3"));
    assert!(reissued.descriptor.query.contains("fsiz=512,512"));

    let moved = session.next_request().unwrap();
    assert!(moved.descriptor.query.contains("fsiz=256,256"));
    assert!(moved.descriptor.query.contains("wait=yes"));
    assert!(moved.descriptor.query.contains("layers=4"));
}

#[test]
fn repeated_failures_fail_the_session() {
    let mut session = Session::new(JpipConfig {
        max_reconnect_attempts: 1,
        ..Default::default()
    });
    session.open().unwrap();
    for _ in 0..2 {
        let Some(req) = session.next_request() else {
            break;
        };
        session
            .handle_response(
                req.id,
                Err(TransportFailure {
                    reason: "refused".to_owned(),
                }),
            )
            .unwrap();
    }
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(session.open(), Err(JpipError::SessionAlreadyOpen)));
}
