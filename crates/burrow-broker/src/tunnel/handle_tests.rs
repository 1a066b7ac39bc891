//! Tests for Tunnel forwarding and release.

use std::sync::Arc;
use std::time::Duration;

use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use burrow_proto::v1::{AgentDescriptor, ConnectRequest, ConnectResponse, connect_response};

use super::TunnelState;
use crate::test_helpers::{
    RecordingCallback, TEST_FULL_METHOD, TIMEOUT, incoming_call, meta, test_tunnel,
};

fn expect_request_info(frame: &ConnectResponse) -> (String, MetadataMap) {
    match &frame.msg {
        Some(connect_response::Msg::RequestInfo(info)) => {
            (info.method_name.clone(), info.metadata())
        }
        other => panic!("expected RequestInfo, got {other:?}"),
    }
}

fn expect_message(frame: &ConnectResponse) -> Vec<u8> {
    match &frame.msg {
        Some(connect_response::Msg::Message(m)) => m.data.clone(),
        other => panic!("expected Message, got {other:?}"),
    }
}

fn expect_close_send(frame: &ConnectResponse) {
    assert!(
        matches!(frame.msg, Some(connect_response::Msg::CloseSend(_))),
        "expected CloseSend, got {:?}",
        frame.msg
    );
}

// --- done() ---

#[tokio::test]
async fn done_releases_unused_tunnel() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    tunnel.done();
    assert_eq!(tunnel.state(), TunnelState::Done);
    assert!(ret_rx.await.unwrap().is_ok());
    // The tunnel no longer holds the agent's response stream open.
    assert!(agent.from_broker.recv().await.is_none());
}

#[tokio::test]
#[should_panic(expected = "more than once")]
async fn done_twice_panics() {
    let (mut tunnel, _agent, _ret_rx) = test_tunnel(3);
    tunnel.done();
    tunnel.done();
}

#[tokio::test]
async fn forward_after_done_is_internal() {
    let (mut tunnel, _agent, _ret_rx) = test_tunnel(3);
    tunnel.done();
    let (incoming, _tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    let err = tunnel
        .forward_stream(incoming, RecordingCallback::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().starts_with("Invalid state"), "{}", err.message());
}

// --- forward_stream() ---

#[tokio::test]
async fn forwards_hello_and_world() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let cb = RecordingCallback::new();
    let mut request_meta = MetadataMap::new();
    request_meta.insert("x-request", "1".parse().unwrap());
    let (incoming, incoming_tx) = incoming_call(TEST_FULL_METHOD, request_meta);

    let agent_task = tokio::spawn(async move {
        let (method, meta_in) = expect_request_info(&agent.recv().await);
        assert_eq!(method, TEST_FULL_METHOD);
        assert_eq!(meta_in.get("x-request").unwrap().to_str().unwrap(), "1");
        assert_eq!(expect_message(&agent.recv().await), b"hello");
        expect_close_send(&agent.recv().await);

        agent.send(ConnectRequest::header(meta(&[("x-h", "h")]))).await;
        agent.send(ConnectRequest::message(b"world".to_vec())).await;
        agent.send(ConnectRequest::trailer(meta(&[("x-t", "t")]))).await;
    });

    incoming_tx.send(Ok(b"hello".to_vec())).await.unwrap();
    drop(incoming_tx);

    let cb_dyn: Arc<dyn crate::tunnel::TunnelDataCallback> = cb.clone();
    let result = tokio::time::timeout(TIMEOUT, tunnel.forward_stream(incoming, cb_dyn))
        .await
        .unwrap();
    assert!(result.is_ok(), "{result:?}");
    agent_task.await.unwrap();

    assert_eq!(
        cb.events(),
        vec!["header:x-h=h", "message:world", "trailer:x-t=t"]
    );
    assert!(ret_rx.await.unwrap().is_ok());
    assert_eq!(tunnel.state(), TunnelState::Forwarding);

    // Forwarding completed the tunnel; done() is a no-op now.
    tunnel.done();
    let (incoming, _tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    let err = tunnel
        .forward_stream(incoming, RecordingCallback::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn agent_error_is_returned_to_incoming_side() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    drop(incoming_tx);

    let agent_task = tokio::spawn(async move {
        expect_request_info(&agent.recv().await);
        expect_close_send(&agent.recv().await);
        agent
            .send(ConnectRequest::error(&Status::permission_denied("nope")))
            .await;
    });

    let err = tokio::time::timeout(
        TIMEOUT,
        tunnel.forward_stream(incoming, RecordingCallback::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    agent_task.await.unwrap();

    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "nope");
    assert!(ret_rx.await.unwrap().is_ok());
}

#[tokio::test]
async fn second_descriptor_is_rejected_on_both_sides() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    drop(incoming_tx);

    let agent_task = tokio::spawn(async move {
        expect_request_info(&agent.recv().await);
        agent
            .send(ConnectRequest::descriptor(AgentDescriptor::default()))
            .await;
        // Keep the tunnel open until the broker gives up on it.
        agent
    });

    let cb = RecordingCallback::new();
    let cb_dyn: Arc<dyn crate::tunnel::TunnelDataCallback> = cb.clone();
    let err = tokio::time::timeout(TIMEOUT, tunnel.forward_stream(incoming, cb_dyn))
        .await
        .unwrap()
        .unwrap_err();
    let _agent = agent_task.await.unwrap();

    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "Unexpected Descriptor message received");
    let tunnel_err = ret_rx.await.unwrap().unwrap_err();
    assert_eq!(tunnel_err.code(), Code::InvalidArgument);
    assert!(cb.events().is_empty());
}

#[tokio::test]
async fn incoming_read_error_aborts_forwarding() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());

    incoming_tx
        .send(Err(Status::aborted("client went away")))
        .await
        .unwrap();

    let err = tokio::time::timeout(
        TIMEOUT,
        tunnel.forward_stream(incoming, RecordingCallback::new()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert_eq!(err.code(), Code::Aborted);
    assert_eq!(ret_rx.await.unwrap().unwrap_err().code(), Code::Unavailable);
    expect_request_info(&agent.recv().await);
}

#[tokio::test]
async fn tunnel_closed_early_is_invalid_transition() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, _incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());

    let agent_task = tokio::spawn(async move {
        expect_request_info(&agent.recv().await);
        agent.send(ConnectRequest::header(meta(&[]))).await;
        // Dropping the agent end closes the tunnel without a trailer.
    });

    let err = tokio::time::timeout(
        TIMEOUT,
        tunnel.forward_stream(incoming, RecordingCallback::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    agent_task.await.unwrap();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("to EOF"), "{}", err.message());
    assert_eq!(ret_rx.await.unwrap().unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn agent_disconnect_fails_both_sides() {
    let (mut tunnel, agent, ret_rx) = test_tunnel(3);
    let (incoming, _incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    drop(agent);

    let err = tokio::time::timeout(
        TIMEOUT,
        tunnel.forward_stream(incoming, RecordingCallback::new()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(ret_rx.await.unwrap().unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn incoming_cancellation_stops_forwarding() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, _incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    let ctx = incoming.ctx.clone();

    let forward = tokio::spawn(async move {
        let result = tunnel
            .forward_stream(incoming, RecordingCallback::new())
            .await;
        (tunnel, result)
    });
    expect_request_info(&agent.recv().await);
    ctx.cancel();

    let (_tunnel, result) = tokio::time::timeout(TIMEOUT, forward)
        .await
        .unwrap()
        .unwrap();
    let err = result.unwrap_err();
    assert!(
        matches!(err.code(), Code::Cancelled | Code::Unavailable),
        "{err:?}"
    );
    assert_eq!(ret_rx.await.unwrap().unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn finished_forwarding_releases_response_stream() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());
    drop(incoming_tx);

    let agent_task = tokio::spawn(async move {
        expect_request_info(&agent.recv().await);
        expect_close_send(&agent.recv().await);
        agent.send(ConnectRequest::header(meta(&[]))).await;
        agent.send(ConnectRequest::trailer(meta(&[]))).await;
        agent
    });

    let result = tokio::time::timeout(
        TIMEOUT,
        tunnel.forward_stream(incoming, RecordingCallback::new()),
    )
    .await
    .unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert!(ret_rx.await.unwrap().is_ok());

    // The tunnel is still alive, yet the agent sees its stream end.
    let mut agent = agent_task.await.unwrap();
    let end = tokio::time::timeout(TIMEOUT, agent.from_broker.recv())
        .await
        .unwrap();
    assert!(end.is_none(), "{end:?}");
    assert_eq!(tunnel.state(), TunnelState::Forwarding);
}

#[tokio::test]
async fn dropping_forward_future_stops_both_directions() {
    let (mut tunnel, mut agent, ret_rx) = test_tunnel(3);
    let (incoming, incoming_tx) = incoming_call(TEST_FULL_METHOD, MetadataMap::new());

    let forward = tokio::time::timeout(
        Duration::from_millis(50),
        tunnel.forward_stream(incoming, RecordingCallback::new()),
    )
    .await;
    assert!(forward.is_err(), "forwarding should still be waiting");
    drop(tunnel);
    expect_request_info(&agent.recv().await);

    // Nothing reads the inbound call any more, and nothing reaches the agent.
    let _ = incoming_tx.send(Ok(b"after-drop".to_vec())).await;
    tokio::time::timeout(TIMEOUT, incoming_tx.closed())
        .await
        .unwrap();
    let next = tokio::time::timeout(TIMEOUT, agent.from_broker.recv())
        .await
        .unwrap();
    assert!(next.is_none(), "{next:?}");
    assert!(ret_rx.await.is_err());
}
