//! Realtime stream endpoint
//!
//! One websocket per subscriber. On connect the client gets a
//! `contacts:init` snapshot, then every event the fan-out produces for its
//! user. The only inbound frame the server answers is "ping".

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::{StreamEvent, UserId};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub user_id: UserId,
}

pub async fn ws_endpoint(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, q.user_id, socket))
}

async fn handle_socket(state: Arc<AppState>, user_id: UserId, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let (sub_id, mut events) = state.fanout.connect(user_id);

    let contacts = match state.store.list_contacts(user_id) {
        Ok(rows) => rows.iter().map(|c| c.info()).collect(),
        Err(e) => {
            warn!("contacts load failed user_id={}: {}", user_id, e);
            Vec::new()
        }
    };
    let init = StreamEvent::ContactsInit { contacts };
    match serde_json::to_string(&init) {
        Ok(init) => {
            if sink.send(Message::Text(init)).await.is_err() {
                state.fanout.disconnect(user_id, sub_id);
                return;
            }
        }
        Err(e) => warn!("contacts:init serialization failed: {}", e),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(message) => {
                    if sink.send(Message::Text(message)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    if sink.send(Message::Text("pong".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("stream socket error user_id={}: {}", user_id, e);
                    break;
                }
            }
        }
    }

    state.fanout.disconnect(user_id, sub_id);
}
