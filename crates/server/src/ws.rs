// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! The realtime event stream.
//!
//! `WebSocket /api/v1/ws` with subscription control messages
//! `{"action": "subscribe" | "unsubscribe", "topic": "..."}`. The server
//! pushes `{type, timestamp, payload}` records for matching bus events.
//! Delivery is best-effort: a connection that cannot keep up misses events
//! (bounded per-subscriber buffer, no publisher backpressure).

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;

use crate::AppState;

/// All the routes for the realtime stream.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/ws", get(upgrade))
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum Action {
    Subscribe,
    Unsubscribe,
}

/// A client subscription control message.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct ClientMessage {
    action: Action,
    topic: String,
}

fn parse_client_message(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: AppState) {
    // Events published before the first subscribe message are not replayed.
    let mut subscription = state.bus.subscribe(Vec::new());
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match parse_client_message(text.as_str()) {
                            Some(ClientMessage { action: Action::Subscribe, topic }) => {
                                tracing::debug!(topic, "ws subscribe");
                                subscription.subscribe_topic(topic);
                            }
                            Some(ClientMessage { action: Action::Unsubscribe, topic }) => {
                                tracing::debug!(topic, "ws unsubscribe");
                                subscription.unsubscribe_topic(&topic);
                            }
                            None => {
                                tracing::debug!("ignoring malformed ws message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "ws receive error");
                        break;
                    }
                }
            }
            event = subscription.recv() => {
                match event {
                    Some(published) => {
                        let Ok(json) = serde_json::to_string(&published.event) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Bus closed: the process is shutting down.
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_and_unsubscribe() {
        let msg = parse_client_message(r#"{"action":"subscribe","topic":"experiment.*"}"#)
            .expect("parse");
        assert_eq!(msg.action, Action::Subscribe);
        assert_eq!(msg.topic, "experiment.*");

        let msg = parse_client_message(r#"{"action":"unsubscribe","topic":"host.h1"}"#)
            .expect("parse");
        assert_eq!(msg.action, Action::Unsubscribe);
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(parse_client_message("not json").is_none());
        assert!(parse_client_message(r#"{"action":"listen","topic":"x"}"#).is_none());
        assert!(parse_client_message(r#"{"topic":"x"}"#).is_none());
    }
}
