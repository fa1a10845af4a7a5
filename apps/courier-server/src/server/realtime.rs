use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use courier_protocol::{event_manifest, parse_envelope, CHAT_MESSAGE_EVENT, MESSAGE_STATUS_EVENT};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};

use super::{
    core::AppState,
    errors::AuthFailure,
    gateway_events,
    hub::{ConnectionControl, LinkChannels},
    metrics::{
        record_gateway_event_parse_rejected, record_gateway_event_unknown_received,
        record_ws_disconnect,
    },
    presence::ConnectionHandle,
    session::ChatSession,
    session_gate::{attach_rotated_access_token, authenticate, Credentials},
    tokens::Principal,
    types::GatewayAuthQuery,
};

/// Handshake: resolve the principal before upgrading. A rotated access token
/// rides back on the upgrade response.
pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<Response, AuthFailure> {
    let credentials =
        Credentials::from_headers(&headers).with_access_override(query.access_token);
    let outcome = authenticate(&state.tokens, &credentials, "gateway")?;
    let principal = outcome.principal().clone();
    let tokens = Arc::clone(&state.tokens);
    let runtime = Arc::clone(&state.runtime);

    let mut response = ws
        .on_upgrade(move |socket| async move {
            handle_gateway_connection(state, socket, principal).await;
        })
        .into_response();
    if let Some(access_token) = outcome.rotated_access_token() {
        attach_rotated_access_token(response.headers_mut(), access_token, &tokens, &runtime);
    }
    Ok(response)
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(
    state: AppState,
    socket: WebSocket,
    principal: Principal,
) {
    let handle = ConnectionHandle::new();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    let drain_signal = Arc::new(Notify::new());

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let ping_every = state.runtime.gateway_ping_interval;
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let session = ChatSession::open(
        state.delivery.clone(),
        principal,
        handle,
        LinkChannels {
            outbound: outbound_tx,
            control: control_tx,
            drain: Arc::clone(&drain_signal),
        },
    )
    .await;

    let manifest = event_manifest();
    let mut disconnect_reason = "connection_closed";
    loop {
        let incoming = tokio::select! {
            () = drain_signal.notified() => {
                session.drain_backlog().await;
                continue;
            }
            incoming = stream.next() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let envelope = match parse_envelope(&payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                record_gateway_event_parse_rejected("ingress", "invalid_envelope");
                tracing::info!(
                    event = "gateway.envelope_rejected",
                    connection_id = %handle,
                    %error
                );
                session.emit(gateway_events::error("Invalid envelope", None));
                continue;
            }
        };

        let event_type = envelope.t.as_str();
        if !manifest.accepts_inbound(event_type) {
            record_gateway_event_unknown_received("ingress", event_type);
            session.emit(gateway_events::error("Unsupported event", None));
            continue;
        }
        match event_type {
            CHAT_MESSAGE_EVENT => session.on_chat_message(envelope.d).await,
            MESSAGE_STATUS_EVENT => session.on_message_status(envelope.d).await,
            _ => {
                record_gateway_event_unknown_received("ingress", event_type);
                session.emit(gateway_events::error("Unsupported event", None));
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    tracing::info!(
        event = "gateway.disconnect",
        connection_id = %handle,
        reason = disconnect_reason
    );
    session.close().await;
    send_task.abort();
}
