use std::{net::SocketAddr, sync::Arc, time::Duration};

use courier_core::{Message as ChatMessage, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message, Error as WsError},
    MaybeTlsStream, WebSocketStream,
};

use super::{serve, test_app, test_app_with_store, test_config};
use crate::server::{
    core::{AppConfig, AppState},
    store::{in_memory::InMemoryStore, QueueKind},
    tokens::TokenKind,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn user(id: &str) -> UserId {
    UserId::try_from(id).unwrap()
}

async fn connect_with_query(addr: SocketAddr, query: &str) -> Result<Socket, WsError> {
    let request = format!("ws://{addr}/gateway/ws?{query}")
        .into_client_request()
        .expect("websocket request should build");
    connect_async(request).await.map(|(socket, _response)| socket)
}

async fn connect_as(addr: SocketAddr, state: &AppState, user_id: &str) -> Socket {
    let access = state.tokens.issue_access(user_id).unwrap();
    connect_with_query(addr, &format!("access_token={access}"))
        .await
        .expect("websocket handshake should succeed")
}

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(EVENT_WAIT, socket.next())
            .await
            .expect("event should arrive in time")
            .expect("socket should stay open")
            .expect("event should decode");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("event should be valid json")
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn connect_ready(addr: SocketAddr, state: &AppState, user_id: &str) -> Socket {
    let mut socket = connect_as(addr, state, user_id).await;
    let ready = next_event(&mut socket).await;
    assert_eq!(ready["t"], "ready");
    assert_eq!(ready["d"]["user_id"], user_id);
    socket
}

async fn send_event(socket: &mut Socket, event_type: &str, data: Value) {
    let text = json!({"v": 1, "t": event_type, "d": data}).to_string();
    socket
        .send(Message::Text(text.into()))
        .await
        .expect("event should send");
}

async fn wait_for_queue_len(state: &AppState, user_id: &str, kind: QueueKind, expected: usize) {
    let owner = user(user_id);
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    loop {
        let len = match kind {
            QueueKind::Messages => state
                .delivery
                .queue()
                .peek::<ChatMessage>(&owner)
                .await
                .unwrap()
                .stored_len(),
            QueueKind::Statuses => state
                .delivery
                .queue()
                .peek::<courier_core::StatusEvent>(&owner)
                .await
                .unwrap()
                .stored_len(),
        };
        if len == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue for {user_id} stayed at {len}, expected {expected}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until_offline(state: &AppState, user_id: &str) {
    let owner = user(user_id);
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    while state
        .delivery
        .presence()
        .lookup(&owner)
        .await
        .unwrap()
        .is_some()
    {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{user_id} stayed registered"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn offline_backlog_is_flushed_before_ready() {
    let (app, state) = test_app();
    let addr = serve(app).await;

    let mut alice = connect_ready(addr, &state, "alice").await;
    for (id, content) in [("m-1", "first"), ("m-2", "second")] {
        send_event(
            &mut alice,
            "chat_message",
            json!({"message_id": id, "receiver_id": "bob", "content": content, "content_type": "text"}),
        )
        .await;
    }
    wait_for_queue_len(&state, "bob", QueueKind::Messages, 2).await;

    let mut bob = connect_as(addr, &state, "bob").await;
    let first = next_event(&mut bob).await;
    let second = next_event(&mut bob).await;
    let ready = next_event(&mut bob).await;
    assert_eq!(first["t"], "chat_message");
    assert_eq!(first["d"]["message_id"], "m-1");
    assert_eq!(first["d"]["sender_id"], "alice");
    assert_eq!(second["d"]["message_id"], "m-2");
    assert_eq!(ready["t"], "ready");

    wait_for_queue_len(&state, "bob", QueueKind::Messages, 0).await;
}

#[tokio::test]
async fn live_message_and_status_flow_between_two_connections() {
    let (app, state) = test_app();
    let addr = serve(app).await;
    let mut alice = connect_ready(addr, &state, "alice").await;
    let mut bob = connect_ready(addr, &state, "bob").await;

    send_event(
        &mut alice,
        "chat_message",
        json!({
            "message_id": "m-live",
            "receiver_id": "bob",
            "content": "https://cdn.example.com/cat.png",
            "content_type": "image",
            "status": "seen",
            "metadata": {"width": 320}
        }),
    )
    .await;
    let received = next_event(&mut bob).await;
    assert_eq!(received["t"], "chat_message");
    assert_eq!(received["d"]["sender_id"], "alice");
    assert_eq!(received["d"]["status"], "sent");
    assert_eq!(received["d"]["metadata"]["width"], 320);

    send_event(
        &mut bob,
        "message_status",
        json!({"message_id": "m-live", "receiver_id": "alice", "status": "delivered"}),
    )
    .await;
    let status = next_event(&mut alice).await;
    assert_eq!(status["t"], "message_status");
    assert_eq!(status["d"]["message_id"], "m-live");
    assert_eq!(status["d"]["status"], "delivered");

    wait_for_queue_len(&state, "bob", QueueKind::Messages, 0).await;
    wait_for_queue_len(&state, "alice", QueueKind::Statuses, 0).await;
}

#[tokio::test]
async fn rejected_events_report_errors_and_keep_the_connection() {
    let (app, state) = test_app();
    let addr = serve(app).await;
    let mut alice = connect_ready(addr, &state, "alice").await;
    let mut bob = connect_ready(addr, &state, "bob").await;

    alice
        .send(Message::Text(String::from("{not json").into()))
        .await
        .unwrap();
    let invalid = next_event(&mut alice).await;
    assert_eq!(invalid["t"], "error");
    assert!(invalid["d"].get("message_id").is_none());

    send_event(
        &mut alice,
        "chat_message",
        json!({"message_id": "m-spoof", "sender_id": "mallory", "receiver_id": "bob", "content": "hi", "content_type": "text"}),
    )
    .await;
    let spoofed = next_event(&mut alice).await;
    assert_eq!(spoofed["t"], "error");
    assert_eq!(spoofed["d"]["message_id"], "m-spoof");

    send_event(&mut alice, "typing_started", json!({"receiver_id": "bob"})).await;
    let unsupported = next_event(&mut alice).await;
    assert_eq!(unsupported["t"], "error");

    send_event(
        &mut alice,
        "message_status",
        json!({"message_id": "m-1", "receiver_id": "bob", "status": "sent"}),
    )
    .await;
    assert_eq!(next_event(&mut alice).await["t"], "error");

    send_event(
        &mut alice,
        "chat_message",
        json!({"message_id": "m-ok", "receiver_id": "bob", "content": "still here", "content_type": "text"}),
    )
    .await;
    let delivered = next_event(&mut bob).await;
    assert_eq!(delivered["d"]["message_id"], "m-ok");
    assert_eq!(delivered["d"]["content"], "still here");
}

#[tokio::test]
async fn oversized_frame_closes_the_connection_and_clears_presence() {
    let config = AppConfig {
        max_gateway_event_bytes: 1024,
        ..test_config()
    };
    let (app, state) = test_app_with_store(&config, Arc::new(InMemoryStore::default()));
    let addr = serve(app).await;
    let mut alice = connect_ready(addr, &state, "alice").await;

    let content = "x".repeat(2048);
    send_event(
        &mut alice,
        "chat_message",
        json!({"receiver_id": "bob", "content": content, "content_type": "text"}),
    )
    .await;

    let outcome = timeout(EVENT_WAIT, alice.next())
        .await
        .expect("server should react to the oversized frame");
    assert!(
        matches!(outcome, None | Some(Err(_)) | Some(Ok(Message::Close(_)))),
        "connection should close, got {outcome:?}"
    );
    wait_until_offline(&state, "alice").await;
    wait_for_queue_len(&state, "bob", QueueKind::Messages, 0).await;
}

#[tokio::test]
async fn disconnect_sends_later_traffic_to_the_offline_queue() {
    let (app, state) = test_app();
    let addr = serve(app).await;
    let mut alice = connect_ready(addr, &state, "alice").await;
    let mut bob = connect_ready(addr, &state, "bob").await;

    bob.close(None).await.unwrap();
    wait_until_offline(&state, "bob").await;

    send_event(
        &mut alice,
        "chat_message",
        json!({"message_id": "m-after", "receiver_id": "bob", "content": "are you there", "content_type": "text"}),
    )
    .await;
    wait_for_queue_len(&state, "bob", QueueKind::Messages, 1).await;

    let mut bob = connect_as(addr, &state, "bob").await;
    assert_eq!(next_event(&mut bob).await["d"]["message_id"], "m-after");
    assert_eq!(next_event(&mut bob).await["t"], "ready");
}

#[tokio::test]
async fn handshake_rotates_an_expired_access_token() {
    let (app, state) = test_app();
    let addr = serve(app).await;
    let expired = state.tokens.issue_expired(TokenKind::Access, "alice");
    let refresh = state.tokens.issue_refresh("alice").unwrap();

    let mut request = format!("ws://{addr}/gateway/ws?access_token={expired}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-refresh-token", refresh.parse().unwrap());
    let (mut socket, response) = connect_async(request)
        .await
        .expect("refresh token should admit the connection");
    let rotated = response
        .headers()
        .get("x-access-token")
        .expect("rotated token should ride on the upgrade response")
        .to_str()
        .unwrap();
    assert_eq!(
        state.tokens.verify_access(rotated).unwrap().user_id.as_str(),
        "alice"
    );
    assert_eq!(next_event(&mut socket).await["t"], "ready");
}

#[tokio::test]
async fn refresh_token_in_the_query_string_is_ignored() {
    let (app, state) = test_app();
    let addr = serve(app).await;
    let expired = state.tokens.issue_expired(TokenKind::Access, "alice");
    let refresh = state.tokens.issue_refresh("alice").unwrap();

    for query in [
        format!("refresh_token={refresh}"),
        format!("access_token={expired}&refresh_token={refresh}"),
    ] {
        match connect_with_query(addr, &query).await {
            Ok(_) => panic!("handshake with a query refresh token should fail"),
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
            Err(other) => panic!("expected http rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn handshake_without_valid_credentials_is_refused() {
    let (app, state) = test_app();
    let addr = serve(app).await;

    for query in [
        String::new(),
        String::from("access_token=v4.local.garbage"),
        format!(
            "access_token={}",
            state.tokens.issue_expired(TokenKind::Access, "alice")
        ),
    ] {
        let error = match connect_with_query(addr, &query).await {
            Ok(_) => panic!("handshake with {query:?} should fail"),
            Err(error) => error,
        };
        match error {
            WsError::Http(response) => assert_eq!(response.status().as_u16(), 401),
            other => panic!("expected http rejection, got {other:?}"),
        }
    }
    wait_until_offline(&state, "alice").await;
}
