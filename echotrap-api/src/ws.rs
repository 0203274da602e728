//! Live fan-out: one WebSocket session per dashboard tab.
//!
//! `/api/ws` speaks the legacy single-token protocol (first text frame is
//! the raw token). `/api/ws2` speaks JSON commands and multiplexes any
//! number of subdomains over one socket.
//!
//! Session invariants: never two subscriptions for the same subdomain;
//! `update_tokens` drops every subscription before adding the new set; all
//! subscriptions are released on every teardown path. Subscription happens
//! before the historical snapshot is read, so a capture landing in between
//! is delivered twice rather than lost; the dashboard dedups by `id`.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Serialize;
use serde_json::Value;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, warn};

use crate::AppState;

/// Server-to-client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ServerFrame {
    Requests {
        #[serde(skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        data: Vec<Value>,
    },
    Request {
        #[serde(skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        data: Value,
    },
    InvalidToken {
        token: String,
    },
    Pong,
    Error {
        message: String,
    },
}

type Subscriptions = StreamMap<String, BroadcastStream<String>>;

pub async fn ws_legacy(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| legacy_session(socket, state))
}

pub async fn ws_multi(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| multi_session(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

/// First frame of a session, multiplexed with process shutdown so a
/// connection idling before its init frame cannot outlive the server.
async fn recv_init(socket: &mut WebSocket, state: &AppState) -> Option<String> {
    let frame = tokio::select! {
        _ = state.shutdown.cancelled() => None,
        frame = socket.recv() => frame,
    };
    match frame {
        Some(Ok(Message::Text(text))) => Some(text),
        _ => None,
    }
}

/// Legacy protocol: raw token, replay, then live frames until disconnect.
async fn legacy_session(mut socket: WebSocket, state: AppState) {
    let Some(token) = recv_init(&mut socket, &state).await else {
        return;
    };

    let sub = match state.tokens.verify(&token) {
        Ok(sub) => sub,
        Err(_) => {
            let _ = send_frame(&mut socket, &ServerFrame::InvalidToken { token }).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "invalid token".into(),
                })))
                .await;
            return;
        }
    };

    // Subscribe before snapshotting so nothing lands in the gap.
    let mut streams: Subscriptions = StreamMap::new();
    streams.insert(sub.clone(), BroadcastStream::new(state.sessions.subscribe(&sub)));

    let history = match state.sessions.list_captures(&sub, 0, 0).await {
        Ok(history) => history,
        Err(err) => {
            warn!(%err, "historical replay failed");
            return;
        }
    };
    if send_frame(
        &mut socket,
        &ServerFrame::Requests {
            subdomain: None,
            data: history,
        },
    )
    .await
    .is_err()
    {
        return;
    }

    run_loop(&state, &mut socket, &mut streams, false).await;
}

/// Multi-token protocol: JSON init frame, then command/event loop.
async fn multi_session(mut socket: WebSocket, state: AppState) {
    let Some(init) = recv_init(&mut socket, &state).await else {
        return;
    };
    let Ok(init) = serde_json::from_str::<Value>(&init) else {
        let _ = send_frame(
            &mut socket,
            &ServerFrame::Error {
                message: "Malformed init frame".to_string(),
            },
        )
        .await;
        return;
    };

    let mut streams: Subscriptions = StreamMap::new();
    for token in initial_tokens(&init) {
        let _ = add_session(&state, &mut socket, &mut streams, &token).await;
    }

    if streams.is_empty() {
        let _ = send_frame(
            &mut socket,
            &ServerFrame::Error {
                message: "No valid sessions provided".to_string(),
            },
        )
        .await;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "no valid sessions".into(),
            })))
            .await;
        return;
    }

    run_loop(&state, &mut socket, &mut streams, true).await;
}

/// Tokens named by the init frame: `register_sessions` carries a list,
/// anything else (`connect` or the bare legacy shape) a single token.
fn initial_tokens(init: &Value) -> Vec<String> {
    if init["cmd"] == "register_sessions" {
        init["sessions"]
            .as_array()
            .map(|sessions| {
                sessions
                    .iter()
                    .filter_map(|s| s["token"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        init["token"]
            .as_str()
            .map(String::from)
            .into_iter()
            .collect()
    }
}

/// Validate one token, subscribe its subdomain and replay history.
/// Duplicate subdomains are not subscribed twice. Returns whether the
/// session set changed.
async fn add_session(
    state: &AppState,
    socket: &mut WebSocket,
    streams: &mut Subscriptions,
    token: &str,
) -> bool {
    let sub = match state.tokens.verify(token) {
        Ok(sub) => sub,
        Err(_) => {
            let _ = send_frame(
                socket,
                &ServerFrame::InvalidToken {
                    token: token.to_string(),
                },
            )
            .await;
            return false;
        }
    };

    if streams.keys().any(|existing| existing == &sub) {
        return true;
    }

    // Subscribe first, snapshot second; the client dedups by capture id.
    streams.insert(sub.clone(), BroadcastStream::new(state.sessions.subscribe(&sub)));

    match state.sessions.list_captures(&sub, 0, 0).await {
        Ok(history) => {
            if !history.is_empty() {
                let _ = send_frame(
                    socket,
                    &ServerFrame::Requests {
                        subdomain: Some(sub),
                        data: history,
                    },
                )
                .await;
            }
            true
        }
        Err(err) => {
            warn!(%err, subdomain = %sub, "historical replay failed");
            streams.remove(&sub);
            false
        }
    }
}

/// Multiplex the session's three event sources: incoming client frames,
/// deliveries from any subscribed capture channel, and process shutdown.
/// The loop ends when the peer goes away, a command fails, the session
/// falls behind the fan-out, or shutdown fires.
async fn run_loop(
    state: &AppState,
    socket: &mut WebSocket,
    streams: &mut Subscriptions,
    tagged: bool,
) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_command(state, socket, streams, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
            delivery = streams.next(), if !streams.is_empty() => {
                match delivery {
                    Some((sub, Ok(raw))) => {
                        let data = serde_json::from_str(&raw)
                            .unwrap_or(Value::String(raw));
                        let frame = ServerFrame::Request {
                            subdomain: tagged.then_some(sub),
                            data,
                        };
                        if send_frame(socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some((sub, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                        // Slow consumers do not get preferential memory.
                        warn!(subdomain = %sub, skipped, "session lagged behind fan-out");
                        break;
                    }
                    None => {}
                }
            }
        }
    }
    // Dropping the stream map releases every subscription.
}

/// One client command. Returns false when the session should end.
async fn handle_command(
    state: &AppState,
    socket: &mut WebSocket,
    streams: &mut Subscriptions,
    text: &str,
) -> bool {
    let Ok(command) = serde_json::from_str::<Value>(text) else {
        return true;
    };
    match command["cmd"].as_str() {
        Some("ping") => send_frame(socket, &ServerFrame::Pong).await.is_ok(),
        Some("update_tokens") => {
            // Drop everything, then subscribe the replacement set.
            *streams = StreamMap::new();
            let tokens: Vec<String> = command["tokens"]
                .as_array()
                .map(|tokens| {
                    tokens
                        .iter()
                        .filter_map(|t| t.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            for token in tokens {
                let _ = add_session(state, socket, streams, &token).await;
            }
            true
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_frame_shapes_resolve_to_tokens() {
        let register = serde_json::json!({
            "cmd": "register_sessions",
            "sessions": [{"token": "t1"}, {"token": "t2"}, {"other": true}]
        });
        assert_eq!(initial_tokens(&register), vec!["t1", "t2"]);

        let connect = serde_json::json!({"cmd": "connect", "token": "t3"});
        assert_eq!(initial_tokens(&connect), vec!["t3"]);

        let bare = serde_json::json!({"token": "t4", "subdomain": "abcd1234"});
        assert_eq!(initial_tokens(&bare), vec!["t4"]);

        let empty = serde_json::json!({"cmd": "register_sessions"});
        assert!(initial_tokens(&empty).is_empty());
    }

    #[test]
    fn server_frames_serialize_with_cmd_tags() {
        let frame = ServerFrame::Request {
            subdomain: Some("abcd1234".to_string()),
            data: serde_json::json!({"id": "x"}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["cmd"], "request");
        assert_eq!(value["subdomain"], "abcd1234");

        let frame = ServerFrame::Requests {
            subdomain: None,
            data: vec![],
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["cmd"], "requests");
        assert!(value.get("subdomain").is_none());

        let value = serde_json::to_value(&ServerFrame::Pong).unwrap();
        assert_eq!(value["cmd"], "pong");

        let frame = ServerFrame::InvalidToken {
            token: "t".to_string(),
        };
        assert_eq!(serde_json::to_value(&frame).unwrap()["cmd"], "invalid_token");
    }
}
