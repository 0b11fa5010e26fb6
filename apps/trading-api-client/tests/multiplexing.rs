//! Multiplexing Integration Tests
//!
//! Drives a full `Connection` (reader, writer, registries) against the
//! scripted in-memory peer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::timeout;

use async_trait::async_trait;
use trading_api_client::infrastructure::memory::{MemoryServer, memory_pair};
use trading_api_client::{
    CloseReason, Connection, ConnectionOptions, ConnectionState, DecodeErrorPolicy, FrameSink,
    RpcError, Streamer, SubscriptionState, TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

fn start(options: ConnectionOptions) -> (Connection, MemoryServer) {
    let (source, sink, server) = memory_pair();
    (Connection::start(source, sink, options), server)
}

fn start_default() -> (Connection, MemoryServer) {
    start(ConnectionOptions::default())
}

// =============================================================================
// Requests
// =============================================================================

#[tokio::test]
async fn concurrent_requests_receive_their_own_results() {
    const N: u64 = 50;
    let (conn, mut server) = start_default();

    let mut calls = Vec::new();
    for i in 0..N {
        let conn = conn.clone();
        calls.push(tokio::spawn(async move {
            let echoed: u64 = conn.request("Echo", &json!({ "n": i })).await.unwrap();
            (i, echoed)
        }));
    }

    let mut received = Vec::new();
    for _ in 0..N {
        received.push(timeout(WAIT, server.recv_request()).await.unwrap().unwrap());
    }
    // Answer in reverse arrival order.
    for req in received.iter().rev() {
        server.respond(req.id, req.params["n"].clone());
    }

    for call in calls {
        let (sent, echoed) = timeout(WAIT, call).await.unwrap().unwrap();
        assert_eq!(sent, echoed);
    }
    assert_eq!(conn.pending_requests(), 0);
}

#[tokio::test]
async fn ping_and_subscription_interleave_without_cross_delivery() {
    let (conn, mut server) = start_default();

    let ping = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request::<_, String>("Ping", &json!({})).await }
    });
    let ping_req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    assert_eq!((ping_req.id, ping_req.method.as_str()), (1, "Ping"));

    let mut sub = conn.subscribe::<i64, _>("Sub", &json!({})).await.unwrap();
    let sub_req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    assert_eq!((sub_req.id, sub_req.method.as_str()), (2, "Sub"));

    server.confirm(2, "abc");
    for i in 1..=3 {
        server.push("abc", json!(i));
    }
    server.respond(1, json!("pong"));

    let pong = timeout(WAIT, ping).await.unwrap().unwrap().unwrap();
    assert_eq!(pong, "pong");

    // The reader handled the pushes before the pong, so they are already queued.
    for expected in 1..=3 {
        let item = sub.next().now_or_never().expect("push already queued");
        assert_eq!(item.unwrap(), expected);
    }
    assert!(sub.next().now_or_never().is_none());
    assert_eq!(sub.state(), SubscriptionState::Active);
    assert_eq!(sub.token().unwrap().as_str(), "abc");
}

#[tokio::test]
async fn server_error_reaches_only_its_caller() {
    let (conn, mut server) = start_default();

    let bad = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request_raw("PlaceOrder", json!({"qty": -1})).await }
    });
    let bad_req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();

    server.fail(
        bad_req.id,
        json!({"code": -32602, "message": "invalid qty", "data": {"field": "qty"}}),
    );

    match timeout(WAIT, bad).await.unwrap().unwrap() {
        Err(RpcError::Server(err)) => {
            assert_eq!(err.code, Some(-32602));
            assert_eq!(err.message, "invalid qty");
            assert_eq!(err.data, Some(json!({"field": "qty"})));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn default_timeout_applies_to_request() {
    let (conn, mut server) = start(ConnectionOptions {
        request_timeout: Some(Duration::from_millis(30)),
        ..ConnectionOptions::default()
    });

    let err = conn.request_raw("Slow", Value::Null).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(d) if d == Duration::from_millis(30)));
    assert_eq!(conn.pending_requests(), 0);

    // A late response is dropped and the connection keeps working.
    let req = server.recv_request().await.unwrap();
    server.respond(req.id, json!("late"));
    let next = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request_raw("Ping", Value::Null).await }
    });
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.respond(req.id, json!("pong"));
    assert_eq!(timeout(WAIT, next).await.unwrap().unwrap().unwrap(), json!("pong"));
}

/// Write half whose writes never complete, as when the peer stops reading.
struct StalledSink;

#[async_trait]
impl FrameSink for StalledSink {
    async fn write_frame(&mut self, _text: String) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn timeout_covers_waiting_for_outbound_queue() {
    let limit = Duration::from_millis(50);
    let (source, _sink, _server) = memory_pair();
    let conn = Connection::start(
        source,
        StalledSink,
        ConnectionOptions {
            request_timeout: Some(limit),
            outbound_queue: 1,
            ..ConnectionOptions::default()
        },
    );

    // The writer holds the first frame forever and the second fills the
    // queue, so the third call can only time out while enqueueing.
    for _ in 0..3 {
        let err = timeout(WAIT, conn.request_raw("Ping", Value::Null))
            .await
            .expect("request must honour its timeout")
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(d) if d == limit));
    }
    assert_eq!(conn.pending_requests(), 0);
    assert_eq!(conn.state(), ConnectionState::Open);
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Deserialize, PartialEq)]
struct Quote {
    symbol: String,
    bid: String,
}

#[tokio::test]
async fn two_subscriptions_are_independent() {
    let (conn, mut server) = start_default();

    let mut first = conn.subscribe::<Quote, _>("Quotes", &json!({"symbol": "AAPL"})).await.unwrap();
    let mut second = conn.subscribe::<Quote, _>("Quotes", &json!({"symbol": "AAPL"})).await.unwrap();

    let a = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    let b = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    assert_ne!(a.id, b.id);
    server.confirm(a.id, "tok-a");
    server.confirm(b.id, "tok-b");

    assert_eq!(first.active().await.unwrap().as_str(), "tok-a");
    assert_eq!(second.active().await.unwrap().as_str(), "tok-b");
    assert_eq!(conn.active_subscriptions(), 2);

    server.push("tok-a", json!({"symbol": "AAPL", "bid": "1.0"}));
    server.push("tok-b", json!({"symbol": "AAPL", "bid": "2.0"}));
    server.push("tok-a", json!({"symbol": "AAPL", "bid": "3.0"}));

    assert_eq!(timeout(WAIT, first.next()).await.unwrap().unwrap().bid, "1.0");
    assert_eq!(timeout(WAIT, first.next()).await.unwrap().unwrap().bid, "3.0");
    assert_eq!(timeout(WAIT, second.next()).await.unwrap().unwrap().bid, "2.0");

    // Closing one leaves the other untouched.
    first.close();
    assert!(matches!(
        first.next().await,
        Err(RpcError::SubscriptionClosed)
    ));
    assert_eq!(conn.active_subscriptions(), 1);

    server.push("tok-a", json!({"symbol": "AAPL", "bid": "4.0"}));
    server.push("tok-b", json!({"symbol": "AAPL", "bid": "5.0"}));
    assert_eq!(timeout(WAIT, second.next()).await.unwrap().unwrap().bid, "5.0");
    assert_eq!(second.state(), SubscriptionState::Active);
}

#[tokio::test]
async fn frames_after_unsubscribe_are_dropped() {
    let (conn, mut server) = start_default();

    let sub = conn.subscribe::<i64, _>("Sub", &()).await.unwrap();
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.confirm(req.id, "abc");
    sub.active().await.unwrap();

    let unsub = tokio::spawn({
        let conn = conn.clone();
        async move { conn.unsubscribe(sub, "Unsub").await }
    });
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    assert_eq!(req.params, json!({"subscriptionId": "abc"}));

    // Late data for the cancelled token, then the unsubscribe answer.
    server.push("abc", json!(99));
    server.respond(req.id, json!(true));
    assert_eq!(timeout(WAIT, unsub).await.unwrap().unwrap().unwrap(), json!(true));

    assert_eq!(conn.active_subscriptions(), 0);
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn rejected_subscribe_reports_server_error() {
    let (conn, mut server) = start_default();

    let mut sub = conn.subscribe::<i64, _>("Sub", &json!({"channel": "nope"})).await.unwrap();
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.fail(req.id, json!({"code": 404, "message": "unknown channel"}));

    match timeout(WAIT, sub.active()).await.unwrap() {
        Err(RpcError::Server(err)) => assert_eq!(err.message, "unknown channel"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(sub.next().await, Err(RpcError::Server(_))));
    assert_eq!(sub.state(), SubscriptionState::Closed);
}

#[tokio::test]
async fn confirmation_without_token_is_protocol_error() {
    let (conn, mut server) = start_default();

    let sub = conn.subscribe::<i64, _>("Sub", &()).await.unwrap();
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.respond(req.id, json!({"status": "ok"}));

    assert!(matches!(
        timeout(WAIT, sub.active()).await.unwrap(),
        Err(RpcError::Protocol(_))
    ));
}

#[tokio::test]
async fn subscribe_with_custom_decoder() {
    let (conn, mut server) = start_default();

    let mut sub = conn
        .subscribe_with("Book", &(), |value: Value| {
            value["levels"]
                .as_array()
                .map(Vec::len)
                .ok_or_else(|| RpcError::Codec("missing levels".into()))
        })
        .await
        .unwrap();
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.confirm(req.id, "book-1");

    server.push("book-1", json!({"levels": [1, 2, 3]}));
    server.push("book-1", json!({"oops": true}));

    assert_eq!(timeout(WAIT, sub.next()).await.unwrap().unwrap(), 3);
    assert!(matches!(sub.next().await, Err(RpcError::Codec(_))));
    assert!(matches!(sub.next().await, Err(RpcError::Codec(_))));
    assert_eq!(conn.active_subscriptions(), 0);
}

#[tokio::test]
async fn subscription_channel_closes_when_connection_ends() {
    let (conn, mut server) = start_default();

    let sub = conn.subscribe::<u32, _>("Sub", &()).await.unwrap();
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.confirm(req.id, "s");
    sub.active().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let forwarder = sub.into_sink(tx);

    for i in 0..10 {
        server.push("s", json!(i));
    }
    let mut received = Vec::new();
    for _ in 0..10 {
        received.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(received, (0..10).collect::<Vec<_>>());

    server.hang_up();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), None);
    let error = timeout(WAIT, forwarder).await.unwrap().unwrap();
    assert!(matches!(
        error,
        RpcError::ConnectionClosed(CloseReason::PeerClosed)
    ));
    assert_eq!(conn.closed().await, CloseReason::PeerClosed);
}

// =============================================================================
// Connection failure
// =============================================================================

#[tokio::test]
async fn transport_failure_resolves_request_and_subscription() {
    let (conn, mut server) = start_default();

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request_raw("Ping", Value::Null).await }
    });
    let mut sub = conn.subscribe::<u32, _>("Sub", &()).await.unwrap();
    let _ = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    let _ = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();

    server.break_transport("connection reset by peer");

    let expected = |err: &RpcError| {
        matches!(err, RpcError::ConnectionClosed(CloseReason::Transport(msg)) if msg.contains("reset"))
    };
    let call_err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(expected(&call_err), "{call_err:?}");
    let sub_err = timeout(WAIT, sub.next()).await.unwrap().unwrap_err();
    assert!(expected(&sub_err), "{sub_err:?}");
    assert!(expected(&timeout(WAIT, sub.active()).await.unwrap().unwrap_err()));

    assert!(matches!(
        timeout(WAIT, conn.closed()).await.unwrap(),
        CloseReason::Transport(_)
    ));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(expected(&conn.request_raw("Ping", Value::Null).await.unwrap_err()));
}

#[tokio::test]
async fn write_failure_closes_connection() {
    let (conn, mut server) = start_default();
    server.stop_reading();

    let err = timeout(WAIT, conn.request_raw("Ping", Value::Null))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::ConnectionClosed(CloseReason::Transport(_))
    ));
    assert!(matches!(
        timeout(WAIT, conn.closed()).await.unwrap(),
        CloseReason::Transport(_)
    ));
}

#[tokio::test]
async fn malformed_frame_is_fatal_by_default() {
    let (conn, mut server) = start_default();

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request_raw("Ping", Value::Null).await }
    });
    let _ = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.send_text("{this is not json");

    assert!(matches!(
        timeout(WAIT, call).await.unwrap().unwrap(),
        Err(RpcError::ConnectionClosed(CloseReason::Protocol(_)))
    ));
    assert!(matches!(conn.closed().await, CloseReason::Protocol(_)));
}

#[tokio::test]
async fn malformed_frame_is_skipped_when_configured() {
    let (conn, mut server) = start(ConnectionOptions {
        decode_errors: DecodeErrorPolicy::Skip,
        ..ConnectionOptions::default()
    });

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request_raw("Ping", Value::Null).await }
    });
    let req = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    server.send_text("{this is not json");
    server.send_text("[1, 2, 3]");
    server.respond(req.id, json!("pong"));

    assert_eq!(
        timeout(WAIT, call).await.unwrap().unwrap().unwrap(),
        json!("pong")
    );
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn many_callers_all_unblock_on_close() {
    let (conn, mut server) = start_default();

    let mut calls = Vec::new();
    for _ in 0..20 {
        let conn = conn.clone();
        calls.push(tokio::spawn(async move { conn.request_raw("Ping", Value::Null).await }));
    }
    for _ in 0..20 {
        let _ = timeout(WAIT, server.recv_request()).await.unwrap().unwrap();
    }

    assert_eq!(conn.close().await, CloseReason::Shutdown);

    let mut outcomes: HashMap<bool, usize> = HashMap::new();
    for call in calls {
        let result = timeout(WAIT, call).await.unwrap().unwrap();
        *outcomes
            .entry(matches!(result, Err(RpcError::ConnectionClosed(_))))
            .or_default() += 1;
    }
    assert_eq!(outcomes.get(&true), Some(&20));
}
